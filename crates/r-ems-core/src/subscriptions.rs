//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Node registry, subscriptions and the manager task."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

/// Which apps receive data from which driver groups.
#[derive(Debug, Default)]
pub struct Subscriptions {
    by_group: BTreeMap<(String, String), BTreeSet<String>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the app was already subscribed.
    pub fn subscribe(&mut self, app: &str, driver: &str, group: &str) -> bool {
        self.by_group
            .entry((driver.to_owned(), group.to_owned()))
            .or_default()
            .insert(app.to_owned())
    }

    pub fn unsubscribe(&mut self, app: &str, driver: &str, group: &str) -> bool {
        let key = (driver.to_owned(), group.to_owned());
        let Some(apps) = self.by_group.get_mut(&key) else {
            return false;
        };
        let removed = apps.remove(app);
        if apps.is_empty() {
            self.by_group.remove(&key);
        }
        removed
    }

    pub fn subscribers(&self, driver: &str, group: &str) -> Vec<String> {
        self.by_group
            .get(&(driver.to_owned(), group.to_owned()))
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every subscription held by or pointing at `node`.
    pub fn drop_node(&mut self, node: &str) -> usize {
        let mut dropped = 0;
        self.by_group.retain(|(driver, _), apps| {
            if driver == node {
                dropped += apps.len();
                return false;
            }
            if apps.remove(node) {
                dropped += 1;
            }
            !apps.is_empty()
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.by_group.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty()
    }
}
