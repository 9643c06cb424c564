//! The persisted state model.
//!
//! A state file holds one [`Database`]: an identity ([`Database::lineage`]),
//! a revision counter ([`Database::serial`]) and the last known
//! [`ResourceEntry`] of every managed resource, grouped by section.

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

/// Identity of a managed resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    /// The resource type, e.g. `jobs` or `catalogs`
    pub section: String,
    /// The user-assigned name within the section
    pub name: String,
}
impl ResourceKey {
    pub fn new(section: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceKey {
            section: section.into(),
            name: name.into(),
        }
    }
}
impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.section, self.name)
    }
}

/// Where a resource stands in the pre-write/finalize protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// An intent was recorded but never confirmed. The remote object may or
    /// may not exist, and must be looked up before applying again.
    Unreconciled,
    /// The last recorded operation was confirmed by the remote system.
    Applied,
}
impl Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Unreconciled => write!(f, "unreconciled"),
            EntryStatus::Applied => write!(f, "applied"),
        }
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// What the store knows about one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceEntry {
    /// Identifier assigned by the remote system. Empty until the first
    /// successful creation.
    #[serde(rename = "__id__", default, skip_serializing_if = "String::is_empty")]
    pub remote_id: String,

    /// Desired configuration as last applied. Opaque to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Remote-observed attributes, see [`crate::StateStore::get_typed_state`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,

    /// Nanoseconds since the Unix epoch at which the last intent was recorded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pre_timestamp: i64,

    /// Nanoseconds since the Unix epoch at which the last intent was
    /// confirmed, or `0` while unconfirmed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub post_timestamp: i64,
}
impl ResourceEntry {
    /// Whether an intent was recorded. Entries without one cannot be finalized.
    pub fn has_pre_write(&self) -> bool {
        self.pre_timestamp != 0
    }

    /// Whether the last recorded intent lacks a confirmation. Entries with no
    /// timestamps at all (only possible in hand-edited files) count as
    /// unreconciled too.
    pub fn is_unreconciled(&self) -> bool {
        self.post_timestamp == 0
    }

    pub fn status(&self) -> EntryStatus {
        if self.is_unreconciled() {
            EntryStatus::Unreconciled
        } else {
            EntryStatus::Applied
        }
    }
}

/// The root of a state file.
///
/// ```json
/// {
///   "lineage": "1b4e28ba-2fa1-4d3b-a3f5-ef19b5a7633b",
///   "serial": 2,
///   "resources": {
///     "jobs": {
///       "nightly-etl": {
///         "__id__": "123",
///         "config": "{\"name\":\"nightly-etl\"}",
///         "state": { "job_id": 123 },
///         "pre_timestamp": 1718000000000000000,
///         "post_timestamp": 1718000000500000000
///       }
///     }
///   }
/// }
/// ```
///
/// Unknown fields are rejected at every level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Database {
    /// Minted once when the state file is created; never changes afterwards.
    pub lineage: String,
    /// Incremented on every persisted mutation.
    pub serial: u64,
    /// `section -> name -> entry`
    pub resources: BTreeMap<String, BTreeMap<String, ResourceEntry>>,
}
impl Database {
    /// A database for a new state file, with a fresh lineage.
    pub fn new() -> Self {
        Database {
            lineage: uuid::Uuid::new_v4().to_string(),
            serial: 0,
            resources: BTreeMap::new(),
        }
    }

    pub fn get(&self, section: &str, name: &str) -> Option<&ResourceEntry> {
        self.resources.get(section)?.get(name)
    }

    pub fn get_mut(&mut self, section: &str, name: &str) -> Option<&mut ResourceEntry> {
        self.resources.get_mut(section)?.get_mut(name)
    }

    pub fn insert(&mut self, section: &str, name: &str, entry: ResourceEntry) {
        self.resources
            .entry(section.to_owned())
            .or_default()
            .insert(name.to_owned(), entry);
    }

    /// Remove an entry, dropping its section when it becomes empty.
    pub fn remove(&mut self, section: &str, name: &str) -> Option<ResourceEntry> {
        let names = self.resources.get_mut(section)?;
        let entry = names.remove(name);
        if names.is_empty() {
            self.resources.remove(section);
        }
        entry
    }

    /// All entries, ordered by section, then name.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, &ResourceEntry)> {
        self.resources.iter().flat_map(|(section, names)| {
            names
                .iter()
                .map(move |(name, entry)| (ResourceKey::new(section, name), entry))
        })
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_fresh_databases_have_distinct_lineage() {
        let a = Database::new();
        let b = Database::new();
        assert_ne!(a.lineage, b.lineage);
        assert_eq!(a.serial, 0);
        assert!(a.is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_section() {
        let mut db = Database::new();
        db.insert("jobs", "a", ResourceEntry::default());
        db.insert("jobs", "b", ResourceEntry::default());
        assert_eq!(db.len(), 2);
        assert!(db.remove("jobs", "a").is_some());
        assert!(db.resources.contains_key("jobs"));
        assert!(db.remove("jobs", "b").is_some());
        assert!(!db.resources.contains_key("jobs"));
        assert!(db.remove("jobs", "b").is_none());
    }

    #[test]
    fn test_iter_is_ordered() {
        let mut db = Database::new();
        db.insert("schemas", "z", ResourceEntry::default());
        db.insert("jobs", "b", ResourceEntry::default());
        db.insert("jobs", "a", ResourceEntry::default());
        let keys: Vec<String> = db.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["jobs.a", "jobs.b", "schemas.z"]);
    }

    #[test]
    fn test_entry_status() {
        let mut entry = ResourceEntry {
            pre_timestamp: 10,
            ..Default::default()
        };
        assert!(entry.has_pre_write());
        assert_eq!(entry.status(), EntryStatus::Unreconciled);
        entry.post_timestamp = 11;
        assert_eq!(entry.status(), EntryStatus::Applied);
    }

    #[test]
    fn test_entry_serialization_omits_empty_fields() {
        let entry = ResourceEntry {
            pre_timestamp: 5,
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({ "pre_timestamp": 5 })
        );

        let entry = ResourceEntry {
            remote_id: "123".to_owned(),
            config: Some("{}".to_owned()),
            state: Some(json!({ "size": 3 })),
            pre_timestamp: 5,
            post_timestamp: 6,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "__id__": "123",
                "config": "{}",
                "state": { "size": 3 },
                "pre_timestamp": 5,
                "post_timestamp": 6
            })
        );
    }

    #[test]
    fn test_entry_rejects_unknown_fields() {
        let r: Result<ResourceEntry, _> =
            serde_json::from_value(json!({ "__id__": "1", "ResourceID": "1" }));
        assert!(r.is_err());
    }

    #[test]
    fn test_database_rejects_unknown_fields() {
        let r: Result<Database, _> = serde_json::from_value(json!({
            "lineage": "x",
            "serial": 0,
            "resources": {},
            "version": 4
        }));
        assert!(r.is_err());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(
            ResourceKey::new("jobs", "nightly-etl").to_string(),
            "jobs.nightly-etl"
        );
    }
}
