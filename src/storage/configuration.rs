//! Typed key-value configuration registry.
//!
//! Entries are runtime-tagged (`Int | Bool | String`), carry peer
//! read/write permissions, a reboot-required marker and a monotonic write
//! count. Entries live in containers mapped to files; containers persist
//! lazily when their summed write counts change.
//!
//! The core is single-threaded, so entries are shared as `Rc` handles with
//! interior mutability.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::adapter::SharedFilesystem;
use super::files::{CLIENT_STATE_FN, CONFIG_FN};
use crate::support::errors::PersistError;

// ── Values ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i32),
    Bool(bool),
    String(String),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "Int",
            Self::Bool(_) => "Bool",
            Self::String(_) => "String",
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Bool(v) => Value::from(*v),
            Self::String(v) => Value::from(v.clone()),
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(|v| Self::Int(v as i32)),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// Wire rendering for GetConfiguration.
    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::String(v) => v.clone(),
        }
    }
}

pub type Validator = Box<dyn Fn(&ConfigValue) -> bool>;

// ── Entries ────────────────────────────────────────────────────

pub struct ConfigEntry {
    key: String,
    value: RefCell<ConfigValue>,
    write_count: Cell<u16>,
    readable_by_peer: Cell<bool>,
    writable_by_peer: Cell<bool>,
    reboot_required: Cell<bool>,
    validator: RefCell<Option<Validator>>,
}

pub type ConfigHandle = Rc<ConfigEntry>;

impl ConfigEntry {
    fn new(key: &str, value: ConfigValue) -> ConfigHandle {
        Rc::new(Self {
            key: key.to_string(),
            value: RefCell::new(value),
            write_count: Cell::new(0),
            readable_by_peer: Cell::new(true),
            writable_by_peer: Cell::new(true),
            reboot_required: Cell::new(false),
            validator: RefCell::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bumped on every accepted mutation; containers use the sum to detect
    /// dirty state.
    pub fn write_count(&self) -> u16 {
        self.write_count.get()
    }

    pub fn type_name(&self) -> &'static str {
        self.value.borrow().type_name()
    }

    // Tag-checked getters. A mismatched access is reported and answered
    // with the type's default rather than propagating garbage.

    pub fn as_int(&self) -> Option<i32> {
        match &*self.value.borrow() {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &*self.value.borrow() {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match &*self.value.borrow() {
            ConfigValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn int(&self) -> i32 {
        self.as_int().unwrap_or_else(|| {
            error!(key = %self.key, "config accessed as Int but holds {}", self.type_name());
            0
        })
    }

    pub fn boolean(&self) -> bool {
        self.as_bool().unwrap_or_else(|| {
            error!(key = %self.key, "config accessed as Bool but holds {}", self.type_name());
            false
        })
    }

    pub fn string(&self) -> String {
        self.as_string().unwrap_or_else(|| {
            error!(key = %self.key, "config accessed as String but holds {}", self.type_name());
            String::new()
        })
    }

    pub fn render(&self) -> String {
        self.value.borrow().render()
    }

    // Setters run the validator and bump the write count on success.

    pub fn set(&self, value: ConfigValue) -> bool {
        if value.type_name() != self.type_name() {
            error!(
                key = %self.key,
                "config set with {} but holds {}",
                value.type_name(),
                self.type_name()
            );
            return false;
        }
        if let Some(validator) = &*self.validator.borrow() {
            if !validator(&value) {
                warn!(key = %self.key, "config value rejected by validator");
                return false;
            }
        }
        *self.value.borrow_mut() = value;
        self.write_count.set(self.write_count.get().wrapping_add(1));
        true
    }

    pub fn set_int(&self, v: i32) -> bool {
        self.set(ConfigValue::Int(v))
    }

    pub fn set_bool(&self, v: bool) -> bool {
        self.set(ConfigValue::Bool(v))
    }

    pub fn set_string(&self, v: impl Into<String>) -> bool {
        self.set(ConfigValue::String(v.into()))
    }

    /// Coerce a ChangeConfiguration string into this entry's type.
    /// Returns `false` on parse failure or validator rejection.
    pub fn set_from_wire(&self, raw: &str) -> bool {
        let parsed = match &*self.value.borrow() {
            ConfigValue::Int(_) => raw.trim().parse::<i32>().ok().map(ConfigValue::Int),
            ConfigValue::Bool(_) => match raw.trim() {
                "true" | "True" => Some(ConfigValue::Bool(true)),
                "false" | "False" => Some(ConfigValue::Bool(false)),
                _ => None,
            },
            ConfigValue::String(_) => Some(ConfigValue::String(raw.to_string())),
        };
        match parsed {
            Some(value) => self.set(value),
            None => false,
        }
    }

    // Flags.

    pub fn readable_by_peer(&self) -> bool {
        self.readable_by_peer.get()
    }

    pub fn writable_by_peer(&self) -> bool {
        self.writable_by_peer.get()
    }

    pub fn requires_reboot(&self) -> bool {
        self.reboot_required.get()
    }

    pub fn revoke_peer_read(&self) {
        self.readable_by_peer.set(false);
    }

    pub fn revoke_peer_write(&self) {
        self.writable_by_peer.set(false);
    }

    pub fn set_reboot_required(&self) {
        self.reboot_required.set(true);
    }

    pub fn set_validator(&self, validator: Validator) {
        *self.validator.borrow_mut() = Some(validator);
    }
}

/// Validator for keys that must stay non-negative.
pub fn validate_unsigned_int(value: &ConfigValue) -> bool {
    matches!(value, ConfigValue::Int(v) if *v >= 0)
}

// ── Containers ─────────────────────────────────────────────────

struct ConfigContainer {
    filename: &'static str,
    peer_visible: bool,
    entries: Vec<ConfigHandle>,
    saved_revision: Cell<u64>,
}

impl ConfigContainer {
    fn revision(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.write_count() as u64)
            .sum::<u64>()
            .wrapping_add(self.entries.len() as u64)
    }
}

// ── Service ────────────────────────────────────────────────────

/// Process-wide configuration registry backed by the filesystem adapter.
///
/// Shared as `Rc<ConfigService>`; the request store and the operation
/// handlers both hold a handle.
pub struct ConfigService {
    fs: SharedFilesystem,
    containers: RefCell<Vec<ConfigContainer>>,
    /// Values loaded from disk whose keys have not been declared yet.
    pending: RefCell<HashMap<&'static str, Map<String, Value>>>,
}

impl ConfigService {
    pub fn new(fs: SharedFilesystem) -> Rc<Self> {
        let service = Rc::new(Self {
            fs,
            containers: RefCell::new(vec![
                ConfigContainer {
                    filename: CONFIG_FN,
                    peer_visible: true,
                    entries: Vec::new(),
                    saved_revision: Cell::new(0),
                },
                ConfigContainer {
                    filename: CLIENT_STATE_FN,
                    peer_visible: false,
                    entries: Vec::new(),
                    saved_revision: Cell::new(0),
                },
            ]),
            pending: RefCell::new(HashMap::new()),
        });
        service.load_all();
        service
    }

    fn load_all(&self) {
        let mut pending = self.pending.borrow_mut();
        for container in self.containers.borrow().iter() {
            match self.fs.read(container.filename) {
                Ok(Some(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => {
                        pending.insert(container.filename, map);
                    }
                    Ok(_) | Err(_) => {
                        error!(file = container.filename, "config container malformed, ignored");
                    }
                },
                Ok(None) => {}
                Err(e) => error!(file = container.filename, "config container unreadable: {e}"),
            }
        }
    }

    fn declare(&self, filename: &'static str, key: &str, default: ConfigValue) -> ConfigHandle {
        let mut containers = self.containers.borrow_mut();
        // A key already declared anywhere wins, regardless of the requested
        // container or default.
        for container in containers.iter() {
            if let Some(existing) = container.entries.iter().find(|e| e.key() == key) {
                return existing.clone();
            }
        }

        let persisted = self
            .pending
            .borrow_mut()
            .get_mut(filename)
            .and_then(|map| map.remove(key))
            .and_then(|v| ConfigValue::from_json(&v))
            .filter(|v| v.type_name() == default.type_name());

        let entry = ConfigEntry::new(key, persisted.unwrap_or(default));
        let container = containers
            .iter_mut()
            .find(|c| c.filename == filename)
            .unwrap_or_else(|| unreachable!("containers are fixed at construction"));
        container.entries.push(entry.clone());
        entry
    }

    pub fn declare_int(&self, key: &str, default: i32) -> ConfigHandle {
        self.declare(CONFIG_FN, key, ConfigValue::Int(default))
    }

    pub fn declare_bool(&self, key: &str, default: bool) -> ConfigHandle {
        self.declare(CONFIG_FN, key, ConfigValue::Bool(default))
    }

    pub fn declare_string(&self, key: &str, default: &str) -> ConfigHandle {
        self.declare(CONFIG_FN, key, ConfigValue::String(default.to_string()))
    }

    /// Internal state that must never appear in GetConfiguration.
    pub fn declare_state_int(&self, key: &str, default: i32) -> ConfigHandle {
        let entry = self.declare(CLIENT_STATE_FN, key, ConfigValue::Int(default));
        entry.revoke_peer_read();
        entry.revoke_peer_write();
        entry
    }

    pub fn declare_state_string(&self, key: &str, default: &str) -> ConfigHandle {
        let entry = self.declare(CLIENT_STATE_FN, key, ConfigValue::String(default.to_string()));
        entry.revoke_peer_read();
        entry.revoke_peer_write();
        entry
    }

    pub fn get(&self, key: &str) -> Option<ConfigHandle> {
        self.containers
            .borrow()
            .iter()
            .flat_map(|c| c.entries.iter())
            .find(|e| e.key() == key)
            .cloned()
    }

    /// Entries a peer may see, for GetConfiguration.
    pub fn peer_visible_entries(&self) -> Vec<ConfigHandle> {
        self.containers
            .borrow()
            .iter()
            .filter(|c| c.peer_visible)
            .flat_map(|c| c.entries.iter())
            .filter(|e| e.readable_by_peer())
            .cloned()
            .collect()
    }

    /// Persist containers whose entries changed since the last save.
    pub fn save_dirty(&self) {
        for container in self.containers.borrow().iter() {
            let revision = container.revision();
            if revision == container.saved_revision.get() {
                continue;
            }
            let mut map = self
                .pending
                .borrow()
                .get(container.filename)
                .cloned()
                .unwrap_or_default();
            for entry in &container.entries {
                map.insert(entry.key().to_string(), entry.value.borrow().to_json());
            }
            let text = Value::Object(map).to_string();
            match self.fs.write(container.filename, &text) {
                Ok(()) => {
                    container.saved_revision.set(revision);
                    debug!(file = container.filename, "config container saved");
                }
                Err(e) => error!(file = container.filename, "config save failed: {e}"),
            }
        }
    }

    /// Immediate persistence for callers that cannot tolerate the lazy
    /// cadence (the request store cursor).
    pub fn save_now(&self, filename: &str) -> Result<(), PersistError> {
        for container in self.containers.borrow().iter() {
            if container.filename != filename {
                continue;
            }
            let mut map = self
                .pending
                .borrow()
                .get(container.filename)
                .cloned()
                .unwrap_or_default();
            for entry in &container.entries {
                map.insert(entry.key().to_string(), entry.value.borrow().to_json());
            }
            self.fs.write(container.filename, &Value::Object(map).to_string())?;
            container.saved_revision.set(container.revision());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFilesystem;

    fn service() -> (Rc<ConfigService>, Rc<MemFilesystem>) {
        let fs = Rc::new(MemFilesystem::new());
        let svc = ConfigService::new(fs.clone());
        (svc, fs)
    }

    #[test]
    fn declare_get_set() {
        let (svc, _fs) = service();
        let interval = svc.declare_int("HeartbeatInterval", 86400);
        assert_eq!(interval.int(), 86400);
        assert!(interval.set_int(300));
        assert_eq!(svc.get("HeartbeatInterval").unwrap().int(), 300);
        assert_eq!(interval.write_count(), 1);
    }

    #[test]
    fn type_mismatch_rejected() {
        let (svc, _fs) = service();
        let entry = svc.declare_bool("LocalAuthListEnabled", true);
        assert!(!entry.set_int(1));
        assert!(entry.boolean());
        assert_eq!(entry.as_int(), None);
    }

    #[test]
    fn wire_coercion() {
        let (svc, _fs) = service();
        let interval = svc.declare_int("MeterValueSampleInterval", 0);
        assert!(interval.set_from_wire("60"));
        assert_eq!(interval.int(), 60);
        assert!(!interval.set_from_wire("sixty"));

        let flag = svc.declare_bool("StopTxnDataCapturePeriodic", false);
        assert!(flag.set_from_wire("true"));
        assert!(flag.boolean());
        assert!(!flag.set_from_wire("1"));
    }

    #[test]
    fn validator_rejects() {
        let (svc, _fs) = service();
        let entry = svc.declare_int("ClockAlignedDataInterval", 0);
        entry.set_validator(Box::new(validate_unsigned_int));
        assert!(!entry.set_int(-5));
        assert!(entry.set_int(900));
    }

    #[test]
    fn persistence_roundtrip() {
        let (svc, fs) = service();
        let interval = svc.declare_int("HeartbeatInterval", 86400);
        interval.set_int(120);
        svc.save_dirty();
        assert!(fs.contains(CONFIG_FN));

        let dump = fs.dump();
        let fs2 = Rc::new(MemFilesystem::restore(dump));
        let svc2 = ConfigService::new(fs2);
        let reloaded = svc2.declare_int("HeartbeatInterval", 86400);
        assert_eq!(reloaded.int(), 120);
    }

    #[test]
    fn save_dirty_is_lazy() {
        let (svc, fs) = service();
        let _e = svc.declare_int("ResetRetries", 1);
        svc.save_dirty();
        let before = fs.dump();
        svc.save_dirty();
        assert_eq!(before, fs.dump());
    }

    #[test]
    fn state_entries_hidden_from_peer() {
        let (svc, _fs) = service();
        svc.declare_state_int("opBegin", 0);
        svc.declare_int("HeartbeatInterval", 86400);
        let visible = svc.peer_visible_entries();
        assert!(visible.iter().all(|e| e.key() != "opBegin"));
        assert!(visible.iter().any(|e| e.key() == "HeartbeatInterval"));
    }
}
