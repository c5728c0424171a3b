//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Metric names registered for every adapter.

use r_ems_metrics::{MetricKind, MetricsStore, Result};
use r_ems_msg::NodeType;

pub const LAST_RTT_MS: &str = "last_rtt_ms";
pub const SEND_BYTES: &str = "send_bytes";
pub const RECV_BYTES: &str = "recv_bytes";
pub const TAG_READS_TOTAL: &str = "tag_reads_total";
pub const TAG_READ_ERRORS_TOTAL: &str = "tag_read_errors_total";
pub const GROUP_TAGS_TOTAL: &str = "group_tags_total";
pub const GROUP_LAST_POLL_MS: &str = "group_last_poll_ms";
pub const RECV_MSGS_TOTAL: &str = "recv_msgs_total";

/// Round trip reported until the first poll completes.
pub const RTT_UNKNOWN: u64 = 9999;

/// Create the node's metric set with the metrics its class always carries.
pub fn register_node_metrics(store: &MetricsStore, node: &str, node_type: NodeType) -> Result<()> {
    store.add_node(node, node_type)?;
    match node_type {
        NodeType::Driver => {
            store.register(
                node,
                LAST_RTT_MS,
                MetricKind::Gauge,
                "Duration of the last group poll in milliseconds",
                RTT_UNKNOWN,
            )?;
            store.register(node, SEND_BYTES, MetricKind::Counter, "Bytes sent to the device", 0)?;
            store.register(
                node,
                RECV_BYTES,
                MetricKind::Counter,
                "Bytes received from the device",
                0,
            )?;
            store.register(node, TAG_READS_TOTAL, MetricKind::Counter, "Tag reads", 0)?;
            store.register(
                node,
                TAG_READ_ERRORS_TOTAL,
                MetricKind::Counter,
                "Tag reads that failed",
                0,
            )
        }
        NodeType::App => store.register(
            node,
            RECV_MSGS_TOTAL,
            MetricKind::Counter,
            "Data messages received",
            0,
        ),
    }
}

/// Register the per-group gauges of a driver group.
pub fn register_group_metrics(store: &MetricsStore, node: &str, group: &str) -> Result<()> {
    store.register_group(
        node,
        group,
        GROUP_TAGS_TOTAL,
        MetricKind::Gauge,
        "Tags in the group",
        0,
    )?;
    store.register_group(
        node,
        group,
        GROUP_LAST_POLL_MS,
        MetricKind::Gauge,
        "Unix time of the last poll in milliseconds",
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drivers_start_with_unknown_rtt() {
        let store = MetricsStore::new();
        register_node_metrics(&store, "plc1", NodeType::Driver).unwrap();
        register_node_metrics(&store, "app1", NodeType::App).unwrap();
        assert_eq!(store.value("plc1", LAST_RTT_MS), Some(RTT_UNKNOWN));
        assert_eq!(store.value("app1", RECV_MSGS_TOTAL), Some(0));
        assert_eq!(store.value("app1", LAST_RTT_MS), None);
        assert!(register_node_metrics(&store, "plc1", NodeType::Driver).is_err());
    }
}
