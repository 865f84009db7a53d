//! Current-state holon table.
//!
//! Flat id-keyed map plus a type index. Holons only enter through
//! `create`; nothing is ever removed. A holon rejected by the validator is
//! flagged inactive via `mark_inactive` and drops out of normal listings.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Holon, HolonSpec, HolonStatus, PropertyBag};
use crate::error::{EngineError, EntityKind, Result};
use crate::ids::{EventId, HolonId};

/// Holon listing filter. `statuses` empty means "visible" (active or draft).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HolonFilter {
    pub holon_type: Option<String>,
    pub statuses: Vec<HolonStatus>,
    /// Property equality constraints, all of which must hold.
    pub properties: Vec<(String, Value)>,
}

impl HolonFilter {
    pub fn of_type(holon_type: impl Into<String>) -> Self {
        Self {
            holon_type: Some(holon_type.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: HolonStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.push((key.into(), value));
        self
    }

    pub fn matches(&self, holon: &Holon) -> bool {
        if self.holon_type.as_ref().is_some_and(|t| t != &holon.holon_type) {
            return false;
        }
        let status_ok = if self.statuses.is_empty() {
            holon.status.is_visible()
        } else {
            self.statuses.contains(&holon.status)
        };
        status_ok
            && self
                .properties
                .iter()
                .all(|(k, v)| holon.properties.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolonStore {
    holons: BTreeMap<HolonId, Holon>,
    by_type: BTreeMap<String, BTreeSet<HolonId>>,
}

impl HolonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.holons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holons.is_empty()
    }

    pub fn contains(&self, id: &HolonId) -> bool {
        self.holons.contains_key(id)
    }

    /// Insert a new holon created by `created_by` at `created_at`. The id
    /// is the supplied one, or derived from the creating event.
    pub fn create(
        &mut self,
        spec: HolonSpec,
        created_by: EventId,
        created_at: DateTime<Utc>,
    ) -> Result<Holon> {
        let id = spec.id.unwrap_or_else(|| HolonId::derived(created_by));
        if self.holons.contains_key(&id) {
            return Err(EngineError::DuplicateId {
                kind: EntityKind::Holon,
                id: id.to_string(),
            });
        }
        let holon = Holon {
            id: id.clone(),
            holon_type: spec.holon_type,
            properties: spec.properties,
            created_at,
            created_by,
            status: spec.status,
            status_reason: None,
            source_documents: spec.source_documents,
            version: 1,
            updated_at: created_at,
            updated_by: created_by,
        };
        self.by_type
            .entry(holon.holon_type.clone())
            .or_default()
            .insert(id.clone());
        self.holons.insert(id, holon.clone());
        Ok(holon)
    }

    pub fn get(&self, id: &HolonId) -> Result<&Holon> {
        self.holons
            .get(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Holon, id.to_string()))
    }

    /// Compensating action for a rejected creation: the holon stays in the
    /// table (its event stays in the log) but is excluded from normal queries.
    pub fn mark_inactive(
        &mut self,
        id: &HolonId,
        reason: impl Into<String>,
        by: EventId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.set_status(id, HolonStatus::Inactive, Some(reason.into()), by, at)
            .map(|_| ())
    }

    pub fn set_status(
        &mut self,
        id: &HolonId,
        status: HolonStatus,
        reason: Option<String>,
        by: EventId,
        at: DateTime<Utc>,
    ) -> Result<&Holon> {
        let holon = self.get_mut(id)?;
        holon.status = status;
        holon.status_reason = reason;
        touch(holon, by, at);
        Ok(holon)
    }

    /// Apply a property patch: `set` keys are inserted or replaced, then
    /// `unset` keys removed.
    pub fn update_properties(
        &mut self,
        id: &HolonId,
        set: &PropertyBag,
        unset: &[String],
        by: EventId,
        at: DateTime<Utc>,
    ) -> Result<&Holon> {
        let holon = self.get_mut(id)?;
        for (k, v) in set {
            holon.properties.insert(k.clone(), v.clone());
        }
        for k in unset {
            holon.properties.remove(k);
        }
        touch(holon, by, at);
        Ok(holon)
    }

    /// Visible (active or draft) holons of `holon_type`, by id.
    pub fn list_by_type(&self, holon_type: &str) -> Vec<&Holon> {
        self.ids_of_type(holon_type)
            .filter_map(|id| self.holons.get(id))
            .filter(|h| h.status.is_visible())
            .collect()
    }

    pub fn query(&self, filter: &HolonFilter) -> Vec<&Holon> {
        match &filter.holon_type {
            Some(t) => self
                .ids_of_type(t)
                .filter_map(|id| self.holons.get(id))
                .filter(|h| filter.matches(h))
                .collect(),
            None => self.holons.values().filter(|h| filter.matches(h)).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Holon> {
        self.holons.values()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(|s| s.as_str())
    }

    fn ids_of_type<'a>(&'a self, holon_type: &str) -> impl Iterator<Item = &'a HolonId> + 'a {
        self.by_type.get(holon_type).into_iter().flatten()
    }

    fn get_mut(&mut self, id: &HolonId) -> Result<&mut Holon> {
        self.holons
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Holon, id.to_string()))
    }
}

fn touch(holon: &mut Holon, by: EventId, at: DateTime<Utc>) {
    holon.version += 1;
    holon.updated_by = by;
    if at > holon.updated_at {
        holon.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn create_then_get() {
        let mut store = HolonStore::new();
        let h = store
            .create(
                HolonSpec::new("Position").with_id("pos-1").with_property("title", json!("Lead")),
                EventId(1),
                t0(),
            )
            .unwrap();
        assert_eq!(h.version, 1);
        assert_eq!(store.get(&"pos-1".into()).unwrap().properties["title"], "Lead");
    }

    #[test]
    fn create_without_id_derives_one() {
        let mut store = HolonStore::new();
        let h = store.create(HolonSpec::new("Person"), EventId(3), t0()).unwrap();
        assert_eq!(h.id, HolonId::derived(EventId(3)));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut store = HolonStore::new();
        store.create(HolonSpec::new("Person").with_id("p1"), EventId(1), t0()).unwrap();
        let err = store
            .create(HolonSpec::new("Person").with_id("p1"), EventId(2), t0())
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_id");
    }

    #[test]
    fn inactive_holons_drop_out_of_listings() {
        let mut store = HolonStore::new();
        store.create(HolonSpec::new("Person").with_id("p1"), EventId(1), t0()).unwrap();
        store.create(HolonSpec::new("Person").with_id("p2"), EventId(2), t0()).unwrap();
        store.mark_inactive(&"p1".into(), "rejected", EventId(2), t0()).unwrap();

        let ids: Vec<&str> = store.list_by_type("Person").iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["p2"]);

        let audit = store.query(&HolonFilter::of_type("Person").with_status(HolonStatus::Inactive));
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status_reason.as_deref(), Some("rejected"));
    }

    #[test]
    fn update_properties_sets_and_unsets() {
        let mut store = HolonStore::new();
        store
            .create(
                HolonSpec::new("Mission").with_id("m1").with_property("phase", json!("plan")),
                EventId(1),
                t0(),
            )
            .unwrap();
        let mut set = PropertyBag::new();
        set.insert("lead".to_string(), json!("p1"));
        let h = store
            .update_properties(&"m1".into(), &set, &["phase".to_string()], EventId(2), t0())
            .unwrap();
        assert_eq!(h.version, 2);
        assert!(h.properties.get("phase").is_none());
        assert_eq!(h.properties["lead"], "p1");
    }

    #[test]
    fn missing_holon_is_not_found() {
        let mut store = HolonStore::new();
        let err = store.mark_inactive(&"ghost".into(), "x", EventId(1), t0()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
