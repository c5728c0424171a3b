//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Prometheus rendering of [`MetricsStore`] snapshots.

use std::str::FromStr;

use indexmap::IndexMap;
use prometheus::proto::{Counter, Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use r_ems_msg::{MessagingMetrics, NodeType};

use crate::store::{MetricEntry, MetricKind, MetricsStore, StoreView};
use crate::{MetricsError, Result};

const PREFIX: &str = "r_ems_";

/// Slice of the store selected for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsCategory {
    /// Fleet aggregates and bus counters.
    Global,
    Driver,
    App,
    #[default]
    All,
}

impl MetricsCategory {
    fn includes_global(self) -> bool {
        matches!(self, MetricsCategory::Global | MetricsCategory::All)
    }

    fn includes(self, node_type: NodeType) -> bool {
        match self {
            MetricsCategory::All => true,
            MetricsCategory::Driver => node_type == NodeType::Driver,
            MetricsCategory::App => node_type == NodeType::App,
            MetricsCategory::Global => false,
        }
    }
}

impl FromStr for MetricsCategory {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(MetricsCategory::Global),
            "driver" => Ok(MetricsCategory::Driver),
            "app" => Ok(MetricsCategory::App),
            "all" => Ok(MetricsCategory::All),
            other => Err(MetricsError::UnknownCategory(other.to_owned())),
        }
    }
}

/// Convert one store traversal (plus optional bus counters) into metric families.
pub fn gather(
    store: &MetricsStore,
    bus: Option<MessagingMetrics>,
    category: MetricsCategory,
) -> Vec<MetricFamily> {
    let mut families = FamilySet::default();
    store.visit(|view| {
        if category.includes_global() {
            push_global(&mut families, view, bus);
        }
        for (node, set) in view.nodes.iter() {
            if !category.includes(set.node_type) {
                continue;
            }
            for (name, entry) in &set.entries {
                families.push(name, entry, &[("node", node)]);
            }
            for (group, entries) in &set.groups {
                for (name, entry) in entries {
                    families.push(name, entry, &[("node", node), ("group", group)]);
                }
            }
        }
    });
    families.into_vec()
}

/// Text exposition format of `families`.
pub fn render_text(families: &[MetricFamily]) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
}

fn push_global(families: &mut FamilySet, view: &StoreView<'_>, bus: Option<MessagingMetrics>) {
    let fleet = view.fleet;
    let gauges = [
        ("north_nodes", "Configured north (app) nodes", fleet.north_nodes),
        ("north_running", "Running north nodes", fleet.north_running),
        ("north_disconnected", "North nodes without a link", fleet.north_disconnected),
        ("south_nodes", "Configured south (driver) nodes", fleet.south_nodes),
        ("south_running", "Running south nodes", fleet.south_running),
        ("south_disconnected", "South nodes without a link", fleet.south_disconnected),
        ("core_dumped", "Set once an adapter task has died", u64::from(view.core_dumped)),
        ("uptime_seconds", "Seconds since the hub started", view.uptime_seconds),
    ];
    for (name, help, value) in gauges {
        families.push_value(name, MetricKind::Gauge, help, value, &[]);
    }

    if let Some(bus) = bus {
        let counters = [
            ("bus_frames_sent_total", "Frames accepted by a bus queue", bus.sent),
            ("bus_frames_received_total", "Frames taken off the manager queue", bus.received),
            ("bus_frames_dropped_total", "Frames lost to a full or closed queue", bus.dropped),
        ];
        for (name, help, value) in counters {
            families.push_value(name, MetricKind::Counter, help, value, &[]);
        }
    }
}

#[derive(Default)]
struct FamilySet {
    families: IndexMap<String, MetricFamily>,
}

impl FamilySet {
    fn push(&mut self, name: &str, entry: &MetricEntry, labels: &[(&str, &str)]) {
        self.push_value(name, entry.kind, &entry.help, entry.value, labels);
    }

    fn push_value(
        &mut self,
        name: &str,
        kind: MetricKind,
        help: &str,
        value: u64,
        labels: &[(&str, &str)],
    ) {
        let family = self
            .families
            .entry(name.to_owned())
            .or_insert_with(|| {
                let mut family = MetricFamily::default();
                family.set_name(format!("{PREFIX}{name}"));
                family.set_help(help.to_owned());
                family.set_field_type(match kind {
                    MetricKind::Counter => MetricType::COUNTER,
                    MetricKind::Gauge => MetricType::GAUGE,
                });
                family
            });

        let mut metric = Metric::default();
        for (label, label_value) in labels {
            let mut pair = LabelPair::default();
            pair.set_name((*label).to_owned());
            pair.set_value((*label_value).to_owned());
            metric.mut_label().push(pair);
        }
        // The family type wins if two sources disagree on the kind of a name.
        match family.get_field_type() {
            MetricType::COUNTER => {
                let mut counter = Counter::default();
                counter.set_value(value as f64);
                metric.set_counter(counter);
            }
            _ => {
                let mut gauge = Gauge::default();
                gauge.set_value(value as f64);
                metric.set_gauge(gauge);
            }
        }
        family.mut_metric().push(metric);
    }

    fn into_vec(self) -> Vec<MetricFamily> {
        self.families.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> MetricsStore {
        let store = MetricsStore::new();
        store.add_node("plc1", NodeType::Driver).unwrap();
        store.add_node("north", NodeType::App).unwrap();
        store
            .register("plc1", "tag_reads_total", MetricKind::Counter, "Tags read", 0)
            .unwrap();
        store.update("plc1", "tag_reads_total", 12).unwrap();
        store
            .register_group("plc1", "grp1", "group_tags_total", MetricKind::Gauge, "Tags in group", 3)
            .unwrap();
        store
            .register("north", "recv_msgs_total", MetricKind::Counter, "Messages received", 2)
            .unwrap();
        store
    }

    #[test]
    fn renders_labelled_node_and_group_series() {
        let store = populated();
        let text = render_text(&gather(&store, None, MetricsCategory::All)).unwrap();
        assert!(text.contains("# TYPE r_ems_tag_reads_total counter"));
        assert!(text.contains("r_ems_tag_reads_total{node=\"plc1\"} 12"));
        assert!(text.contains("r_ems_group_tags_total{group=\"grp1\",node=\"plc1\"} 3")
            || text.contains("r_ems_group_tags_total{node=\"plc1\",group=\"grp1\"} 3"));
        assert!(text.contains("r_ems_south_nodes 0"));
    }

    #[test]
    fn category_filters_node_classes() {
        let store = populated();
        let drivers = render_text(&gather(&store, None, MetricsCategory::Driver)).unwrap();
        assert!(drivers.contains("tag_reads_total"));
        assert!(!drivers.contains("recv_msgs_total"));
        assert!(!drivers.contains("uptime_seconds"));

        let global = render_text(&gather(
            &store,
            Some(MessagingMetrics {
                sent: 4,
                received: 3,
                dropped: 1,
            }),
            MetricsCategory::Global,
        ))
        .unwrap();
        assert!(global.contains("r_ems_bus_frames_dropped_total 1"));
        assert!(!global.contains("node=\"plc1\""));
        assert_eq!("APP".parse::<MetricsCategory>().unwrap(), MetricsCategory::App);
        assert!("nodes".parse::<MetricsCategory>().is_err());
    }
}
