//! Storage areas, access levels, keys, change records and quotas.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::StorageConfig;
use crate::extensions::error::{ExtensionError, ExtensionResult};

/// Persisted items of one partition, ordered by key.
pub type StoredMap = BTreeMap<String, Value>;

/// The four `chrome.storage` areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Local,
    Sync,
    Session,
    Managed,
}

impl StorageArea {
    pub const ALL: [StorageArea; 4] = [
        StorageArea::Local,
        StorageArea::Sync,
        StorageArea::Session,
        StorageArea::Managed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
            StorageArea::Session => "session",
            StorageArea::Managed => "managed",
        }
    }

    /// Access level a partition starts with.
    pub fn default_access_level(&self) -> AccessLevel {
        match self {
            StorageArea::Local | StorageArea::Sync => AccessLevel::TrustedAndUntrustedContexts,
            StorageArea::Session | StorageArea::Managed => AccessLevel::TrustedContexts,
        }
    }

    /// Whether callers need the `storage` permission.
    pub fn requires_permission(&self) -> bool {
        !matches!(self, StorageArea::Managed)
    }

    /// Session data lives only in memory.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, StorageArea::Session)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, StorageArea::Managed)
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which contexts may see a storage area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "TRUSTED_CONTEXTS")]
    TrustedContexts,
    #[serde(rename = "TRUSTED_AND_UNTRUSTED_CONTEXTS")]
    TrustedAndUntrustedContexts,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::TrustedContexts => "TRUSTED_CONTEXTS",
            AccessLevel::TrustedAndUntrustedContexts => "TRUSTED_AND_UNTRUSTED_CONTEXTS",
        }
    }

    pub fn admits_untrusted(&self) -> bool {
        matches!(self, AccessLevel::TrustedAndUntrustedContexts)
    }
}

impl FromStr for AccessLevel {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRUSTED_CONTEXTS" => Ok(AccessLevel::TrustedContexts),
            "TRUSTED_AND_UNTRUSTED_CONTEXTS" => Ok(AccessLevel::TrustedAndUntrustedContexts),
            other => Err(ExtensionError::InvalidAccessLevel(other.to_string())),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `keys` argument of `get` and `getBytesInUse`.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageKeys {
    /// `null` / omitted: every item.
    All,
    Key(String),
    Keys(Vec<String>),
    /// An object: its keys, with its values as defaults for missing items.
    Defaults(Map<String, Value>),
}

impl StorageKeys {
    /// Interpret a script-supplied keys argument.
    pub fn from_json(keys: &Value) -> ExtensionResult<Self> {
        match keys {
            Value::Null => Ok(StorageKeys::All),
            Value::String(key) => Ok(StorageKeys::Key(key.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key.clone()),
                    other => Err(ExtensionError::InvalidArgument(format!(
                        "storage keys must be strings, got {}",
                        other
                    ))),
                })
                .collect::<ExtensionResult<Vec<_>>>()
                .map(StorageKeys::Keys),
            Value::Object(defaults) => Ok(StorageKeys::Defaults(defaults.clone())),
            other => Err(ExtensionError::InvalidArgument(format!(
                "invalid storage keys: {}",
                other
            ))),
        }
    }

    /// Pick the requested items out of `items`.
    pub fn select(&self, items: &StoredMap) -> Map<String, Value> {
        match self {
            StorageKeys::All => items.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            StorageKeys::Key(key) => pick(items, std::iter::once(key)),
            StorageKeys::Keys(keys) => pick(items, keys.iter()),
            StorageKeys::Defaults(defaults) => defaults
                .iter()
                .map(|(key, default)| {
                    let value = items.get(key).unwrap_or(default);
                    (key.clone(), value.clone())
                })
                .collect(),
        }
    }

    /// Keys this argument names, or `None` for all.
    pub fn names(&self) -> Option<Vec<&str>> {
        match self {
            StorageKeys::All => None,
            StorageKeys::Key(key) => Some(vec![key.as_str()]),
            StorageKeys::Keys(keys) => Some(keys.iter().map(String::as_str).collect()),
            StorageKeys::Defaults(defaults) => Some(defaults.keys().map(String::as_str).collect()),
        }
    }
}

fn pick<'a>(items: &StoredMap, keys: impl Iterator<Item = &'a String>) -> Map<String, Value> {
    keys.filter_map(|key| items.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}

/// One entry of an `onChanged` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Changes of one mutation, keyed by item name.
pub type StorageChanges = BTreeMap<String, StorageChange>;

/// Keys whose value differs between `before` and `after`.
pub fn diff(before: &StoredMap, after: &StoredMap) -> StorageChanges {
    let mut changes = StorageChanges::new();
    for (key, old) in before {
        match after.get(key) {
            Some(new) if new == old => {}
            new => {
                changes.insert(
                    key.clone(),
                    StorageChange {
                        old_value: Some(old.clone()),
                        new_value: new.cloned(),
                    },
                );
            }
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            changes.insert(
                key.clone(),
                StorageChange {
                    old_value: None,
                    new_value: Some(new.clone()),
                },
            );
        }
    }
    changes
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Quota size of one item: key length plus its JSON encoding.
pub fn entry_size(key: &str, value: &Value) -> usize {
    let mut counter = ByteCounter(0);
    // Writing into a counter cannot fail for a `Value`.
    let _ = serde_json::to_writer(&mut counter, value);
    key.len() + counter.0
}

/// Total quota size of a partition.
pub fn bytes_in_use(items: &StoredMap) -> usize {
    items.iter().map(|(k, v)| entry_size(k, v)).sum()
}

/// Limits for one area. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageQuota {
    pub total_bytes: Option<usize>,
    pub bytes_per_item: Option<usize>,
    pub max_items: Option<usize>,
}

impl StorageQuota {
    pub const UNLIMITED: StorageQuota = StorageQuota {
        total_bytes: None,
        bytes_per_item: None,
        max_items: None,
    };

    /// Quota for `area`. `unlimited` reflects the `unlimitedStorage`
    /// permission, which lifts the local and session limits only.
    pub fn for_area(area: StorageArea, config: &StorageConfig, unlimited: bool) -> Self {
        match area {
            StorageArea::Local if unlimited => Self::UNLIMITED,
            StorageArea::Local => StorageQuota {
                total_bytes: config.local_quota_bytes,
                ..Self::UNLIMITED
            },
            StorageArea::Session if unlimited => Self::UNLIMITED,
            StorageArea::Session => StorageQuota {
                total_bytes: config.session_quota_bytes,
                ..Self::UNLIMITED
            },
            StorageArea::Sync => StorageQuota {
                total_bytes: Some(config.sync_quota_bytes),
                bytes_per_item: Some(config.sync_quota_bytes_per_item),
                max_items: Some(config.sync_max_items),
            },
            StorageArea::Managed => Self::UNLIMITED,
        }
    }

    /// Check a prospective partition state. `written` are the keys the
    /// mutation touches; only those are held to the per-item limit.
    pub fn check<'a>(
        &self,
        next: &StoredMap,
        written: impl IntoIterator<Item = &'a str>,
    ) -> ExtensionResult<()> {
        if let Some(limit) = self.bytes_per_item {
            for key in written {
                if let Some(value) = next.get(key) {
                    if entry_size(key, value) > limit {
                        return Err(ExtensionError::QuotaExceeded(
                            "QUOTA_BYTES_PER_ITEM".to_string(),
                        ));
                    }
                }
            }
        }
        if let Some(limit) = self.max_items {
            if next.len() > limit {
                return Err(ExtensionError::QuotaExceeded("MAX_ITEMS".to_string()));
            }
        }
        if let Some(limit) = self.total_bytes {
            if bytes_in_use(next) > limit {
                return Err(ExtensionError::QuotaExceeded("QUOTA_BYTES".to_string()));
            }
        }
        Ok(())
    }
}
