//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Node registry, subscriptions and the manager task."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use r_ems_common::config::{HubConfig, NodeConfig, SubscriptionConfig};
use r_ems_core::{Manager, ManagerClient, ManagerError, ManagerHandle};
use r_ems_metrics::MetricsStore;
use r_ems_msg::{
    AdapterState, AddNode, Body, DataType, ErrorCode, GroupConfig, GroupRef, LinkState, NodeCtl,
    NodeCtlKind, NodeRef, NodeSetting, NodeType, Subscription, Tag, TagAttribute, TagBatch,
    TagValue, TransData, Value, WriteTag,
};
use r_ems_net::{builtin_catalog, MODBUS_TCP, TELEMETRY_LOG};
use r_ems_persistence::{
    GroupRecord, JsonFilePersister, NodeRecord, PersistenceBridge, Persister, DEFAULT_QUEUE_DEPTH,
};
use tempfile::tempdir;

const MODBUS_SETTING: &str = r#"{"host":"127.0.0.1","port":502,"timeout":3000}"#;

#[allow(clippy::field_reassign_with_default)]
fn hub_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.manager.monitor = false;
    config.manager.state_interval_ms = Duration::from_millis(50);
    config.manager.request_timeout_ms = Duration::from_secs(2);
    config
}

async fn start(
    config: HubConfig,
    persistence: PersistenceBridge,
) -> (ManagerHandle, ManagerClient, Arc<MetricsStore>) {
    let metrics = Arc::new(MetricsStore::new());
    let handle = Manager::new(config, builtin_catalog(), Arc::clone(&metrics), persistence)
        .start()
        .await
        .expect("manager starts");
    let client = handle.client();
    (handle, client, metrics)
}

async fn add_modbus(client: &ManagerClient, node: &str) {
    client
        .call(Body::AddNode(AddNode {
            node: node.into(),
            plugin: MODBUS_TCP.into(),
        }))
        .await
        .expect("node added");
    client
        .call(Body::NodeSetting(NodeSetting {
            node: node.into(),
            setting: MODBUS_SETTING.into(),
        }))
        .await
        .expect("setting accepted");
}

fn ctl(node: &str, ctl: NodeCtlKind) -> Body {
    Body::NodeCtl(NodeCtl {
        node: node.into(),
        ctl,
    })
}

fn add_group(node: &str, group: &str, interval_ms: u32) -> Body {
    Body::AddGroup(GroupConfig {
        driver: node.into(),
        group: group.into(),
        interval_ms,
    })
}

async fn wait_for_state(client: &ManagerClient, node_type: NodeType, node: &str, state: AdapterState) {
    for _ in 0..100 {
        let nodes = client.nodes(node_type).await.expect("listing");
        if nodes.iter().any(|n| n.name == node && n.state == state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{node} never reached {state:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_interval_floor_and_double_start() {
    let (handle, client, _metrics) = start(hub_config(), PersistenceBridge::disabled()).await;
    add_modbus(&client, "plc1").await;

    client.call(add_group("plc1", "grp1", 200)).await.expect("group added");
    assert_eq!(
        client.call(add_group("plc1", "grp2", 50)).await,
        Err(ManagerError::Rejected(ErrorCode::GroupParameterInvalid))
    );

    client.call(ctl("plc1", NodeCtlKind::Start)).await.expect("started");
    assert_eq!(
        client.call(ctl("plc1", NodeCtlKind::Start)).await,
        Err(ManagerError::Rejected(ErrorCode::NodeIsRunning))
    );
    match client
        .request(Body::GetNodeState(NodeRef { node: "plc1".into() }))
        .await
        .expect("state reply")
    {
        Body::RespGetNodeState(report) => {
            assert_eq!(report.running, AdapterState::Running);
            assert_eq!(report.link, LinkState::Connected);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_management_errors_are_typed() {
    let (handle, client, _metrics) = start(hub_config(), PersistenceBridge::disabled()).await;
    add_modbus(&client, "plc1").await;

    let add = |node: &str, plugin: &str| {
        Body::AddNode(AddNode {
            node: node.into(),
            plugin: plugin.into(),
        })
    };
    assert_eq!(
        client.call(add("plc1", MODBUS_TCP)).await,
        Err(ManagerError::Rejected(ErrorCode::NodeExist))
    );
    assert_eq!(
        client.call(add("manager", MODBUS_TCP)).await,
        Err(ManagerError::Rejected(ErrorCode::NodeNameInvalid))
    );
    assert_eq!(
        client.call(add("plc9", "profinet")).await,
        Err(ManagerError::Rejected(ErrorCode::PluginNotFound))
    );
    assert_eq!(
        client.call(add("log2", TELEMETRY_LOG)).await,
        Err(ManagerError::Rejected(ErrorCode::PluginNotAllowInstance))
    );
    assert_eq!(
        client.call(ctl("ghost", NodeCtlKind::Start)).await,
        Err(ManagerError::Rejected(ErrorCode::NodeNotExist))
    );
    assert_eq!(
        client
            .request(Body::RespError(r_ems_msg::RespError {
                code: ErrorCode::Success
            }))
            .await,
        Err(ManagerError::NoTarget("resp_error"))
    );

    let drivers = client.nodes(NodeType::Driver).await.unwrap();
    assert_eq!(drivers.len(), 1);
    assert_eq!(drivers[0].plugin, MODBUS_TCP);
    let apps = client.nodes(NodeType::App).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert!(apps[0].single);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_group_on_an_app_is_not_allowed() {
    let (handle, client, _metrics) = start(hub_config(), PersistenceBridge::disabled()).await;
    wait_for_state(&client, NodeType::App, TELEMETRY_LOG, AdapterState::Running).await;

    let reply = client
        .request(Body::ReadGroup(GroupRef {
            driver: TELEMETRY_LOG.into(),
            group: "grp1".into(),
        }))
        .await
        .expect("reply");
    assert_eq!(reply, Body::error(ErrorCode::GroupNotAllow));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polled_data_is_cached_and_fanned_out() {
    let (handle, client, metrics) = start(hub_config(), PersistenceBridge::disabled()).await;
    add_modbus(&client, "plc1").await;
    client.call(add_group("plc1", "grp1", 100)).await.unwrap();
    let reply = client
        .request(Body::AddTag(TagBatch {
            driver: "plc1".into(),
            group: "grp1".into(),
            tags: vec![Tag::new("sp", "1!400001", DataType::Int16, TagAttribute::READ_WRITE)],
        }))
        .await
        .unwrap();
    assert!(matches!(reply, Body::RespAddTag(result) if result.code == ErrorCode::Success));
    client
        .call(Body::Subscribe(Subscription {
            app: TELEMETRY_LOG.into(),
            driver: "plc1".into(),
            group: "grp1".into(),
        }))
        .await
        .expect("subscribed");
    client.call(ctl("plc1", NodeCtlKind::Start)).await.unwrap();
    client
        .call(Body::WriteTag(WriteTag {
            driver: "plc1".into(),
            group: "grp1".into(),
            tag: "sp".into(),
            value: Value::Int(7),
        }))
        .await
        .expect("written");

    let expected = Body::TransData(TransData {
        driver: "plc1".into(),
        group: "grp1".into(),
        values: vec![TagValue {
            tag: "sp".into(),
            value: Value::Int(7),
        }],
    });
    let mut cached = None;
    for _ in 0..50 {
        let reply = client
            .request(Body::ReadGroup(GroupRef {
                driver: "plc1".into(),
                group: "grp1".into(),
            }))
            .await
            .unwrap();
        if reply == expected {
            cached = Some(reply);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cached.is_some(), "group never polled");

    let mut delivered = 0;
    for _ in 0..50 {
        delivered = metrics.value(TELEMETRY_LOG, "recv_msgs_total").unwrap_or(0);
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered > 0, "subscriber never received data");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_node_purges_registry_and_metrics() {
    let (handle, client, metrics) = start(hub_config(), PersistenceBridge::disabled()).await;
    add_modbus(&client, "plc1").await;
    client.call(add_group("plc1", "grp1", 200)).await.unwrap();
    assert!(metrics.group_value("plc1", "grp1", "group_tags_total").is_some());

    client
        .call(Body::DelNode(NodeRef { node: "plc1".into() }))
        .await
        .expect("deleted");
    assert!(client.nodes(NodeType::Driver).await.unwrap().is_empty());
    assert_eq!(metrics.value("plc1", "last_rtt_ms"), None);
    assert!(metrics.visit(|view| !view.nodes.contains_key("plc1")));

    assert_eq!(
        client.call(Body::DelNode(NodeRef { node: "plc1".into() })).await,
        Err(ManagerError::Rejected(ErrorCode::NodeNotExist))
    );
    assert_eq!(
        client
            .call(Body::DelNode(NodeRef {
                node: TELEMETRY_LOG.into()
            }))
            .await,
        Err(ManagerError::Rejected(ErrorCode::NodeNotAllowDelete))
    );

    handle.shutdown().await.expect("shutdown");
}

#[allow(clippy::field_reassign_with_default)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declared_nodes_are_configured_and_auto_started() {
    let mut config = hub_config();
    let mut nodes = IndexMap::new();
    nodes.insert(
        "plc1".to_string(),
        NodeConfig {
            plugin: MODBUS_TCP.into(),
            setting: Some(serde_json::from_str(MODBUS_SETTING).unwrap()),
            auto_start: true,
        },
    );
    config.nodes = nodes;
    config.subscriptions = vec![SubscriptionConfig {
        app: TELEMETRY_LOG.into(),
        driver: "plc1".into(),
        group: "grp1".into(),
    }];

    let (handle, client, metrics) = start(config, PersistenceBridge::disabled()).await;
    wait_for_state(&client, NodeType::Driver, "plc1", AdapterState::Running).await;

    let mut fleet = Default::default();
    for _ in 0..50 {
        fleet = metrics.visit(|view| view.fleet);
        if fleet.south_running == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fleet.south_nodes, 1);
    assert_eq!(fleet.south_running, 1);
    assert_eq!(fleet.north_nodes, 1);

    handle.shutdown().await.expect("shutdown");
    assert!(metrics.visit(|view| view.nodes.is_empty()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_nodes_are_restored_after_restart() {
    let dir = tempdir().expect("tempdir");

    let persister = Arc::new(JsonFilePersister::new(dir.path()).unwrap());
    let (bridge, writer) = PersistenceBridge::spawn(persister, DEFAULT_QUEUE_DEPTH).unwrap();
    let (handle, client, _metrics) = start(hub_config(), bridge).await;
    add_modbus(&client, "plc1").await;
    client.call(add_group("plc1", "grp1", 200)).await.unwrap();
    client.call(ctl("plc1", NodeCtlKind::Start)).await.unwrap();
    handle.shutdown().await.expect("shutdown");
    tokio::task::spawn_blocking(move || writer.join())
        .await
        .expect("writer drained");

    let persister = Arc::new(JsonFilePersister::new(dir.path()).unwrap());
    let (bridge, _writer) = PersistenceBridge::spawn(persister, DEFAULT_QUEUE_DEPTH).unwrap();
    let (handle, client, _metrics) = start(hub_config(), bridge).await;
    wait_for_state(&client, NodeType::Driver, "plc1", AdapterState::Running).await;
    match client
        .request(Body::GetGroup(NodeRef { node: "plc1".into() }))
        .await
        .unwrap()
    {
        Body::RespGetGroup(list) => {
            assert_eq!(list.groups.len(), 1);
            assert_eq!(list.groups[0].name, "grp1");
            assert_eq!(list.groups[0].interval_ms, 200);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    handle.shutdown().await.expect("shutdown");
}

/// File persister whose node deletions lag behind the requests that caused them.
struct LaggingDeletes(JsonFilePersister);

impl Persister for LaggingDeletes {
    fn load_nodes(&self) -> r_ems_persistence::Result<Vec<NodeRecord>> {
        self.0.load_nodes()
    }
    fn save_node(&self, record: &NodeRecord) -> r_ems_persistence::Result<()> {
        self.0.save_node(record)
    }
    fn delete_node(&self, node: &str) -> r_ems_persistence::Result<()> {
        std::thread::sleep(Duration::from_millis(300));
        self.0.delete_node(node)
    }
    fn load_setting(&self, node: &str) -> r_ems_persistence::Result<Option<String>> {
        self.0.load_setting(node)
    }
    fn save_setting(&self, node: &str, setting: &str) -> r_ems_persistence::Result<()> {
        self.0.save_setting(node, setting)
    }
    fn load_state(&self, node: &str) -> r_ems_persistence::Result<Option<AdapterState>> {
        self.0.load_state(node)
    }
    fn save_state(&self, node: &str, state: AdapterState) -> r_ems_persistence::Result<()> {
        self.0.save_state(node, state)
    }
    fn load_groups(&self, node: &str) -> r_ems_persistence::Result<Vec<GroupRecord>> {
        self.0.load_groups(node)
    }
    fn save_group(&self, node: &str, group: &str, interval_ms: u32) -> r_ems_persistence::Result<()> {
        self.0.save_group(node, group, interval_ms)
    }
    fn delete_group(&self, node: &str, group: &str) -> r_ems_persistence::Result<()> {
        self.0.delete_group(node, group)
    }
    fn save_tag(&self, node: &str, group: &str, tag: &Tag) -> r_ems_persistence::Result<()> {
        self.0.save_tag(node, group, tag)
    }
    fn delete_tag(&self, node: &str, group: &str, tag: &str) -> r_ems_persistence::Result<()> {
        self.0.delete_tag(node, group, tag)
    }
}

async fn setting_of(client: &ManagerClient, node: &str) -> Body {
    client
        .request(Body::GetNodeSetting(NodeRef { node: node.into() }))
        .await
        .expect("setting reply")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn re_added_node_does_not_inherit_deleted_configuration() {
    let dir = tempdir().expect("tempdir");
    let persister = Arc::new(LaggingDeletes(JsonFilePersister::new(dir.path()).unwrap()));
    let (bridge, writer) = PersistenceBridge::spawn(persister, DEFAULT_QUEUE_DEPTH).unwrap();
    let (handle, client, _metrics) = start(hub_config(), bridge).await;

    add_modbus(&client, "plc9").await;
    client.call(add_group("plc9", "grp1", 200)).await.unwrap();
    client
        .call(Body::DelNode(NodeRef { node: "plc9".into() }))
        .await
        .expect("deleted");
    client
        .call(Body::AddNode(AddNode {
            node: "plc9".into(),
            plugin: MODBUS_TCP.into(),
        }))
        .await
        .expect("added again");

    assert_eq!(
        setting_of(&client, "plc9").await,
        Body::error(ErrorCode::NodeSettingNotFound)
    );
    match client
        .request(Body::GetGroup(NodeRef { node: "plc9".into() }))
        .await
        .unwrap()
    {
        Body::RespGetGroup(list) => assert!(list.groups.is_empty()),
        other => panic!("unexpected reply {other:?}"),
    }
    let drivers = client.nodes(NodeType::Driver).await.unwrap();
    assert_eq!(drivers[0].state, AdapterState::Init);

    handle.shutdown().await.expect("shutdown");
    tokio::task::spawn_blocking(move || writer.join())
        .await
        .expect("writer drained");

    let persister = Arc::new(JsonFilePersister::new(dir.path()).unwrap());
    let (bridge, _writer) = PersistenceBridge::spawn(persister, DEFAULT_QUEUE_DEPTH).unwrap();
    let (handle, client, _metrics) = start(hub_config(), bridge).await;
    assert_eq!(client.nodes(NodeType::Driver).await.unwrap().len(), 1);
    assert_eq!(
        setting_of(&client, "plc9").await,
        Body::error(ErrorCode::NodeSettingNotFound)
    );
    handle.shutdown().await.expect("shutdown");
}
