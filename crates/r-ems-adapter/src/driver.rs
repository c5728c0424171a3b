//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Groups, tags, value caches and poll deadlines of a driver node.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use r_ems_msg::{ErrorCode, GroupInfo, Tag, TagPage, TagValue, Value, GROUP_LIST_MAX, TAG_BATCH_MAX};

use crate::plugin::PollContext;

/// Groups one driver may hold; bounded by what a group listing can carry.
pub const MAX_GROUPS: usize = GROUP_LIST_MAX;

#[derive(Debug)]
struct GroupState {
    interval: Duration,
    tags: IndexMap<String, Tag>,
    cache: HashMap<String, Value>,
    deadline: Option<Instant>,
}

impl GroupState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            tags: IndexMap::new(),
            cache: HashMap::new(),
            deadline: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DriverState {
    groups: IndexMap<String, GroupState>,
}

impl DriverState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn add_group(&mut self, group: &str, interval: Duration) -> Result<(), ErrorCode> {
        if group.is_empty() {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        if self.groups.contains_key(group) {
            return Err(ErrorCode::GroupExist);
        }
        if self.groups.len() >= MAX_GROUPS {
            return Err(ErrorCode::PayloadTooLarge);
        }
        self.groups.insert(group.to_owned(), GroupState::new(interval));
        Ok(())
    }

    pub fn update_group(&mut self, group: &str, interval: Duration) -> Result<(), ErrorCode> {
        let state = self.groups.get_mut(group).ok_or(ErrorCode::GroupNotExist)?;
        state.interval = interval;
        Ok(())
    }

    pub fn del_group(&mut self, group: &str) -> Result<(), ErrorCode> {
        self.groups
            .shift_remove(group)
            .map(|_| ())
            .ok_or(ErrorCode::GroupNotExist)
    }

    pub fn group_list(&self) -> Vec<GroupInfo> {
        self.groups
            .iter()
            .map(|(name, state)| GroupInfo {
                name: name.clone(),
                interval_ms: interval_ms(state.interval),
                tag_count: u16::try_from(state.tags.len()).unwrap_or(u16::MAX),
            })
            .collect()
    }

    pub fn tag_count(&self, group: &str) -> Result<usize, ErrorCode> {
        Ok(self.group(group)?.tags.len())
    }

    pub fn add_tag(&mut self, group: &str, tag: Tag) -> Result<(), ErrorCode> {
        if tag.name.is_empty() {
            return Err(ErrorCode::TagNameInvalid);
        }
        let state = self.group_mut(group)?;
        if state.tags.contains_key(&tag.name) {
            return Err(ErrorCode::TagExist);
        }
        state.tags.insert(tag.name.clone(), tag);
        Ok(())
    }

    pub fn update_tag(&mut self, group: &str, tag: Tag) -> Result<(), ErrorCode> {
        let state = self.group_mut(group)?;
        let slot = state.tags.get_mut(&tag.name).ok_or(ErrorCode::TagNotExist)?;
        state.cache.remove(&tag.name);
        *slot = tag;
        Ok(())
    }

    pub fn del_tag(&mut self, group: &str, tag: &str) -> Result<(), ErrorCode> {
        let state = self.group_mut(group)?;
        state.tags.shift_remove(tag).ok_or(ErrorCode::TagNotExist)?;
        state.cache.remove(tag);
        Ok(())
    }

    pub fn tag(&self, group: &str, tag: &str) -> Result<&Tag, ErrorCode> {
        self.group(group)?.tags.get(tag).ok_or(ErrorCode::TagNotExist)
    }

    /// Up to one batch of tags starting at `offset`, with the group's total tag count.
    pub fn tag_page(&self, group: &str, offset: usize) -> Result<TagPage, ErrorCode> {
        let state = self.group(group)?;
        Ok(TagPage {
            total: u16::try_from(state.tags.len()).unwrap_or(u16::MAX),
            tags: state
                .tags
                .values()
                .skip(offset)
                .take(TAG_BATCH_MAX)
                .cloned()
                .collect(),
        })
    }

    /// Cached values in tag order. Tags never read are left out.
    pub fn cached_values(&self, group: &str) -> Result<Vec<TagValue>, ErrorCode> {
        let state = self.group(group)?;
        Ok(state
            .tags
            .keys()
            .filter_map(|name| {
                state.cache.get(name).map(|value| TagValue {
                    tag: name.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }

    /// Poll view over one group, borrowing its tags and cache.
    pub fn poll_context(&mut self, group: &str) -> Option<PollContext<'_>> {
        let (_, name, state) = self.groups.get_full_mut(group)?;
        Some(PollContext::new(name, &state.tags, &mut state.cache))
    }

    /// Schedule `group` one interval after `now`.
    pub fn arm(&mut self, group: &str, now: Instant) {
        if let Some(state) = self.groups.get_mut(group) {
            state.deadline = Some(now + state.interval);
        }
    }

    pub fn arm_all(&mut self, now: Instant) {
        for state in self.groups.values_mut() {
            state.deadline = Some(now + state.interval);
        }
    }

    pub fn clear_deadlines(&mut self) {
        for state in self.groups.values_mut() {
            state.deadline = None;
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups.values().filter_map(|g| g.deadline).min()
    }

    /// Groups whose deadline has passed, disarmed until re-armed after their poll.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for (name, state) in self.groups.iter_mut() {
            if state.deadline.is_some_and(|deadline| deadline <= now) {
                state.deadline = None;
                due.push(name.clone());
            }
        }
        due
    }

    fn group(&self, group: &str) -> Result<&GroupState, ErrorCode> {
        self.groups.get(group).ok_or(ErrorCode::GroupNotExist)
    }

    fn group_mut(&mut self, group: &str) -> Result<&mut GroupState, ErrorCode> {
        self.groups.get_mut(group).ok_or(ErrorCode::GroupNotExist)
    }
}

pub(crate) fn interval_ms(interval: Duration) -> u32 {
    u32::try_from(interval.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ems_msg::{DataType, TagAttribute};

    fn tag(name: &str) -> Tag {
        Tag::new(name, "1!400001", DataType::Int16, TagAttribute::READ)
    }

    #[test]
    fn groups_reject_duplicates_and_unknown_names() {
        let mut driver = DriverState::new();
        driver.add_group("grp1", Duration::from_millis(200)).unwrap();
        assert_eq!(
            driver.add_group("grp1", Duration::from_millis(300)),
            Err(ErrorCode::GroupExist)
        );
        assert_eq!(
            driver.update_group("nope", Duration::from_millis(300)),
            Err(ErrorCode::GroupNotExist)
        );
        driver.update_group("grp1", Duration::from_millis(500)).unwrap();
        assert_eq!(driver.group_list()[0].interval_ms, 500);
        assert_eq!(driver.del_group("nope"), Err(ErrorCode::GroupNotExist));
        driver.del_group("grp1").unwrap();
        assert!(driver.is_empty());
    }

    #[test]
    fn group_count_is_bounded() {
        let mut driver = DriverState::new();
        for i in 0..MAX_GROUPS {
            driver.add_group(&format!("g{i}"), Duration::from_millis(100)).unwrap();
        }
        assert_eq!(
            driver.add_group("overflow", Duration::from_millis(100)),
            Err(ErrorCode::PayloadTooLarge)
        );
    }

    #[test]
    fn tags_page_in_insertion_order() {
        let mut driver = DriverState::new();
        driver.add_group("grp1", Duration::from_millis(100)).unwrap();
        for i in 0..20 {
            driver.add_tag("grp1", tag(&format!("t{i:02}"))).unwrap();
        }
        assert_eq!(driver.add_tag("grp1", tag("t00")), Err(ErrorCode::TagExist));
        assert_eq!(driver.add_tag("grp2", tag("x")), Err(ErrorCode::GroupNotExist));

        let first = driver.tag_page("grp1", 0).unwrap();
        assert_eq!(first.total, 20);
        assert_eq!(first.tags.len(), TAG_BATCH_MAX);
        let rest = driver.tag_page("grp1", 16).unwrap();
        assert_eq!(rest.tags.len(), 4);
        assert_eq!(rest.tags[0].name, "t16");
    }

    #[test]
    fn poll_context_fills_the_cache() {
        let mut driver = DriverState::new();
        driver.add_group("grp1", Duration::from_millis(100)).unwrap();
        driver.add_tag("grp1", tag("a")).unwrap();
        driver.add_tag("grp1", tag("b")).unwrap();
        {
            let mut ctx = driver.poll_context("grp1").unwrap();
            let names: Vec<String> = ctx.tags().keys().cloned().collect();
            for name in names {
                ctx.set_value(&name, Value::Int(7));
            }
            ctx.set_value("ghost", Value::Int(1));
        }
        let values = driver.cached_values("grp1").unwrap();
        assert_eq!(values.len(), 2);

        driver.update_tag("grp1", tag("a")).unwrap();
        assert_eq!(driver.cached_values("grp1").unwrap().len(), 1);
        driver.del_tag("grp1", "b").unwrap();
        assert!(driver.cached_values("grp1").unwrap().is_empty());
    }

    #[test]
    fn due_groups_are_disarmed() {
        let mut driver = DriverState::new();
        driver.add_group("fast", Duration::from_millis(100)).unwrap();
        driver.add_group("slow", Duration::from_millis(1000)).unwrap();
        let start = Instant::now();
        driver.arm_all(start);
        assert_eq!(driver.next_deadline(), Some(start + Duration::from_millis(100)));

        let due = driver.take_due(start + Duration::from_millis(150));
        assert_eq!(due, ["fast"]);
        assert_eq!(driver.next_deadline(), Some(start + Duration::from_millis(1000)));

        driver.clear_deadlines();
        assert_eq!(driver.next_deadline(), None);
    }
}
