//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! JSON file persister.
//!
//! Layout: `<root>/<node>/{node,setting,state,groups}.json`. Every file is a versioned
//! envelope whose `hash` is the SHA-256 of the serialized payload; a mismatch on load is
//! reported as [`PersistenceError::HashMismatch`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use r_ems_msg::{AdapterState, Tag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::persister::{GroupRecord, NodeRecord, Persister};
use crate::{PersistenceError, Result};

/// Current envelope version.
pub const STORE_VERSION: u16 = 1;

const NODE_FILE: &str = "node.json";
const SETTING_FILE: &str = "setting.json";
const STATE_FILE: &str = "state.json";
const GROUPS_FILE: &str = "groups.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingRecord {
    setting: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
    state: AdapterState,
}

/// Persister writing one directory per node below `root`.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    root: PathBuf,
}

impl JsonFilePersister {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(dir_name(node))
    }

    fn file(&self, node: &str, file: &str) -> PathBuf {
        self.node_dir(node).join(file)
    }

    fn update_groups(
        &self,
        node: &str,
        update: impl FnOnce(&mut Vec<GroupRecord>) -> Result<()>,
    ) -> Result<()> {
        let path = self.file(node, GROUPS_FILE);
        let mut groups: Vec<GroupRecord> = read_record(&path)?.unwrap_or_default();
        update(&mut groups)?;
        write_record(&path, &groups)
    }
}

impl Persister for JsonFilePersister {
    fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(record) = read_record::<NodeRecord>(&entry.path().join(NODE_FILE))? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(records)
    }

    fn save_node(&self, record: &NodeRecord) -> Result<()> {
        write_record(&self.file(&record.node, NODE_FILE), record)
    }

    fn delete_node(&self, node: &str) -> Result<()> {
        let dir = self.node_dir(node);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn load_setting(&self, node: &str) -> Result<Option<String>> {
        Ok(read_record::<SettingRecord>(&self.file(node, SETTING_FILE))?.map(|r| r.setting))
    }

    fn save_setting(&self, node: &str, setting: &str) -> Result<()> {
        write_record(
            &self.file(node, SETTING_FILE),
            &SettingRecord {
                setting: setting.to_owned(),
            },
        )
    }

    fn load_state(&self, node: &str) -> Result<Option<AdapterState>> {
        Ok(read_record::<StateRecord>(&self.file(node, STATE_FILE))?.map(|r| r.state))
    }

    fn save_state(&self, node: &str, state: AdapterState) -> Result<()> {
        write_record(&self.file(node, STATE_FILE), &StateRecord { state })
    }

    fn load_groups(&self, node: &str) -> Result<Vec<GroupRecord>> {
        Ok(read_record(&self.file(node, GROUPS_FILE))?.unwrap_or_default())
    }

    fn save_group(&self, node: &str, group: &str, interval_ms: u32) -> Result<()> {
        self.update_groups(node, |groups| {
            match groups.iter_mut().find(|g| g.name == group) {
                Some(existing) => existing.interval_ms = interval_ms,
                None => groups.push(GroupRecord {
                    name: group.to_owned(),
                    interval_ms,
                    tags: Vec::new(),
                }),
            }
            Ok(())
        })
    }

    fn delete_group(&self, node: &str, group: &str) -> Result<()> {
        self.update_groups(node, |groups| {
            groups.retain(|g| g.name != group);
            Ok(())
        })
    }

    fn save_tag(&self, node: &str, group: &str, tag: &Tag) -> Result<()> {
        self.update_groups(node, |groups| {
            let record = groups
                .iter_mut()
                .find(|g| g.name == group)
                .ok_or_else(|| PersistenceError::MissingGroup {
                    node: node.to_owned(),
                    group: group.to_owned(),
                })?;
            match record.tags.iter_mut().find(|t| t.name == tag.name) {
                Some(existing) => *existing = tag.clone(),
                None => record.tags.push(tag.clone()),
            }
            Ok(())
        })
    }

    fn delete_tag(&self, node: &str, group: &str, tag: &str) -> Result<()> {
        self.update_groups(node, |groups| {
            if let Some(record) = groups.iter_mut().find(|g| g.name == group) {
                record.tags.retain(|t| t.name != tag);
            }
            Ok(())
        })
    }
}

/// Plain names map to themselves; anything else is hex encoded so it cannot escape `root`.
fn dir_name(node: &str) -> String {
    let plain = !node.is_empty()
        && !node.starts_with('.')
        && node
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        node.to_owned()
    } else {
        format!("x-{}", hex::encode(node))
    }
}

fn write_record<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_value(payload)?;
    let envelope = StoreEnvelope {
        version: STORE_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(&payload)?,
        payload,
    };

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
        file.flush()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "record written");
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let envelope: StoreEnvelope = serde_json::from_slice(&bytes)?;
    if envelope.version != STORE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.version));
    }
    if compute_hash(&envelope.payload)? != envelope.hash {
        return Err(PersistenceError::HashMismatch(path.to_path_buf()));
    }
    Ok(Some(serde_json::from_value(envelope.payload)?))
}

fn compute_hash(payload: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ems_msg::{DataType, TagAttribute};
    use tempfile::tempdir;

    #[test]
    fn setting_and_state_survive_reload() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersister::new(dir.path()).unwrap();
        store.save_setting("plc1", r#"{"host":"127.0.0.1"}"#).unwrap();
        store.save_state("plc1", AdapterState::Running).unwrap();

        let reopened = JsonFilePersister::new(dir.path()).unwrap();
        assert_eq!(
            reopened.load_setting("plc1").unwrap().as_deref(),
            Some(r#"{"host":"127.0.0.1"}"#)
        );
        assert_eq!(reopened.load_state("plc1").unwrap(), Some(AdapterState::Running));
        assert_eq!(reopened.load_setting("plc2").unwrap(), None);
    }

    #[test]
    fn groups_and_tags_are_upserted() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersister::new(dir.path()).unwrap();
        let tag = Tag::new("pressure", "1!400001", DataType::Uint16, TagAttribute::READ);

        store.save_group("plc1", "grp1", 200).unwrap();
        store.save_tag("plc1", "grp1", &tag).unwrap();
        store.save_group("plc1", "grp1", 500).unwrap();
        store.save_tag("plc1", "grp1", &Tag { precision: 1, ..tag.clone() }).unwrap();
        assert!(matches!(
            store.save_tag("plc1", "missing", &tag),
            Err(PersistenceError::MissingGroup { .. })
        ));

        let groups = store.load_groups("plc1").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].interval_ms, 500);
        assert_eq!(groups[0].tags.len(), 1);
        assert_eq!(groups[0].tags[0].precision, 1);

        store.delete_tag("plc1", "grp1", "pressure").unwrap();
        assert!(store.load_groups("plc1").unwrap()[0].tags.is_empty());
        store.delete_group("plc1", "grp1").unwrap();
        assert!(store.load_groups("plc1").unwrap().is_empty());
    }

    #[test]
    fn nodes_are_listed_and_deleted() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersister::new(dir.path()).unwrap();
        for (node, plugin) in [("plc2", "modbus-tcp"), ("a/b", "file")] {
            store
                .save_node(&NodeRecord {
                    node: node.into(),
                    plugin: plugin.into(),
                })
                .unwrap();
        }
        assert!(!dir.path().join("a").exists());
        let names: Vec<String> = store.load_nodes().unwrap().into_iter().map(|r| r.node).collect();
        assert_eq!(names, ["a/b", "plc2"]);

        store.delete_node("plc2").unwrap();
        store.delete_node("plc2").unwrap();
        assert_eq!(store.load_nodes().unwrap().len(), 1);
    }

    #[test]
    fn tampered_record_is_rejected() {
        let dir = tempdir().unwrap();
        let store = JsonFilePersister::new(dir.path()).unwrap();
        store.save_setting("plc1", "{}").unwrap();

        let path = dir.path().join("plc1").join(SETTING_FILE);
        let mut envelope: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        envelope["payload"]["setting"] = serde_json::json!("{\"port\":1}");
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(matches!(
            store.load_setting("plc1"),
            Err(PersistenceError::HashMismatch(_))
        ));
    }
}
