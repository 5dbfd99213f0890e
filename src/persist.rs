use crate::store::SenderOperationState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const STATE_VERSION: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported state version {0} (newest known is {STATE_VERSION})")]
    UnsupportedVersion(u64),
    #[error("migration from v{from} failed: {reason}")]
    Migration { from: u32, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Keyed by lowercase 0x-prefixed sender address.
    pub senders: BTreeMap<String, SenderOperationState>,
}

pub trait StatePersistence: Send + Sync {
    fn load(&self) -> Result<Option<PersistedState>, PersistError>;
    fn save(&self, state: &PersistedState) -> Result<(), PersistError>;
}

type Migration = fn(Value) -> Result<Value, PersistError>;

/// `(from_version, step)`; each step produces `from_version + 1`.
const MIGRATIONS: &[(u32, Migration)] = &[(1, v1_to_v2), (2, v2_to_v3)];

/// Upgrades any known schema version to the current one.
pub fn migrate(mut raw: Value) -> Result<PersistedState, PersistError> {
    // v1 files predate the version field.
    let declared = raw.get("version").and_then(Value::as_u64).unwrap_or(1);
    let mut version =
        u32::try_from(declared).map_err(|_| PersistError::UnsupportedVersion(declared))?;

    if version > STATE_VERSION || version == 0 {
        return Err(PersistError::UnsupportedVersion(version.into()));
    }

    while version < STATE_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|(from, _)| *from == version)
            .map(|(_, f)| *f)
            .ok_or(PersistError::UnsupportedVersion(version.into()))?;
        raw = step(raw)?;
        version += 1;
        tracing::debug!(version, "migrated persisted userop state");
    }

    Ok(serde_json::from_value(raw)?)
}

/// v1: `{ "userOps": { addr: { "pending": { hash, maxFeePerGas, maxPriorityFeePerGas } } } }`
/// with big integers as decimal strings.
/// v2: `{ "version": 2, "senders": { addr: { current, pending, operationAttempt } } }`
/// with big integers as hex quantities.
fn v1_to_v2(raw: Value) -> Result<Value, PersistError> {
    let err = |reason: &str| PersistError::Migration {
        from: 1,
        reason: reason.to_string(),
    };

    let user_ops = match raw.get("userOps") {
        Some(Value::Object(m)) => m.clone(),
        Some(_) => return Err(err("userOps is not an object")),
        None => Map::new(),
    };

    let mut senders = Map::new();
    for (addr, entry) in user_ops {
        let pending = match entry.get("pending") {
            Some(Value::Object(p)) => {
                let mut out = p.clone();
                for key in ["maxFeePerGas", "maxPriorityFeePerGas"] {
                    if let Some(v) = p.get(key) {
                        out.insert(key.to_string(), decimal_to_quantity(v).map_err(|e| err(&e))?);
                    }
                }
                Value::Object(out)
            }
            _ => Value::Null,
        };
        senders.insert(
            addr.to_lowercase(),
            serde_json::json!({
                "current": null,
                "pending": pending,
                "operationAttempt": 0,
            }),
        );
    }

    Ok(serde_json::json!({ "version": 2, "senders": senders }))
}

/// v3 renames the action/resource fields of `current`, adds sponsorship and
/// retry diagnostics, and drops the transient `promptUser` flag some v2
/// writers persisted by mistake.
fn v2_to_v3(mut raw: Value) -> Result<Value, PersistError> {
    let senders = raw
        .get_mut("senders")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| PersistError::Migration {
            from: 2,
            reason: "missing senders object".to_string(),
        })?;

    for entry in senders.values_mut() {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };
        obj.remove("promptUser");
        obj.remove("promptResponse");
        obj.entry("rejectedSponsorshipReason").or_insert(Value::Null);
        obj.entry("retryDetails").or_insert(Value::Null);

        if let Some(current) = obj.get_mut("current").and_then(Value::as_object_mut) {
            if let Some(v) = current.remove("functionHashForPaymasterProxy") {
                current.insert("action".to_string(), v);
            }
            if let Some(v) = current.remove("spaceId") {
                current.insert("resourceId".to_string(), v);
            }
        }
    }

    if let Some(obj) = raw.as_object_mut() {
        obj.insert("version".to_string(), Value::from(3));
    }
    Ok(raw)
}

fn decimal_to_quantity(v: &Value) -> Result<Value, String> {
    let s = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(format!("expected decimal big integer, got {other}")),
    };
    if s.starts_with("0x") {
        return Ok(Value::String(s));
    }
    let n = ethers::types::U256::from_dec_str(&s).map_err(|e| format!("{s}: {e}"))?;
    Ok(Value::String(crate::encoding::fmt_u256(n)))
}

/// JSON file with atomic-ish replacement on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatePersistence for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedState>, PersistError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw)?;
        migrate(value).map(Some)
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let io_err = |path: &Path, source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;

        // Write to a temp file then rename so an interrupted write never
        // leaves a truncated state file behind.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| io_err(&tmp_path, e))?;

        // On Windows rename fails if the destination exists.
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
            } else {
                return Err(io_err(&self.path, err));
            }
        }
        Ok(())
    }
}

/// In-memory persistence, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Option<Value>>,
}

impl MemoryStore {
    pub fn with_raw(raw: Value) -> Self {
        Self {
            inner: Mutex::new(Some(raw)),
        }
    }

    pub fn raw(&self) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatePersistence for MemoryStore {
    fn load(&self) -> Result<Option<PersistedState>, PersistError> {
        match self.raw() {
            Some(v) => migrate(v).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let v = serde_json::to_value(state)?;
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(v);
        Ok(())
    }
}
