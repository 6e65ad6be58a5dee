//! Local authorization list.
//!
//! Versioned list managed by SendLocalList (full or differential) and
//! reported by GetLocalListVersion. When `LocalAuthListEnabled` is set, the
//! list pre-authorizes known tags and backs offline authorization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::adapter::SharedFilesystem;
use crate::storage::configuration::{ConfigHandle, ConfigService};
use crate::storage::files::AUTH_LIST_FN;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationData {
    pub id_tag: String,
    /// `None` in a differential update means "delete this entry".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredList {
    list_version: i32,
    local_authorization_list: Vec<AuthorizationData>,
}

/// Differential update against a stale version.
#[derive(Debug)]
pub struct VersionMismatch;

pub struct AuthListService {
    fs: SharedFilesystem,
    enabled: ConfigHandle,
    version: i32,
    entries: Vec<AuthorizationData>,
}

impl AuthListService {
    pub fn new(fs: SharedFilesystem, cfg: &ConfigService) -> Self {
        let enabled = cfg.declare_bool("LocalAuthListEnabled", true);
        let stored: StoredList = match fs.read(AUTH_LIST_FN) {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("local auth list malformed, discarded: {e}");
                StoredList::default()
            }),
            _ => StoredList::default(),
        };
        Self {
            fs,
            enabled,
            version: stored.list_version,
            entries: stored.local_authorization_list,
        }
    }

    fn save(&self) {
        let stored = StoredList {
            list_version: self.version,
            local_authorization_list: self.entries.clone(),
        };
        match serde_json::to_string(&stored) {
            Ok(text) => {
                if let Err(e) = self.fs.write(AUTH_LIST_FN, &text) {
                    warn!("local auth list persistence failed: {e}");
                }
            }
            Err(e) => warn!("local auth list serialization failed: {e}"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.boolean()
    }

    /// Version for GetLocalListVersion: 0 when the list is empty.
    pub fn list_version(&self) -> i32 {
        if self.entries.is_empty() {
            0
        } else {
            self.version
        }
    }

    /// Look up a tag; expired or non-Accepted entries don't authorize.
    pub fn check(&self, id_tag: &str, now: Option<DateTime<Utc>>) -> Option<&AuthorizationData> {
        if !self.is_enabled() {
            return None;
        }
        let entry = self.entries.iter().find(|e| e.id_tag == id_tag)?;
        if entry.status.as_deref() != Some("Accepted") {
            return None;
        }
        if let (Some(expiry), Some(now)) = (entry.expiry_date, now) {
            if expiry <= now {
                return None;
            }
        }
        Some(entry)
    }

    pub fn update_full(&mut self, version: i32, entries: Vec<AuthorizationData>) {
        self.version = version;
        self.entries = entries.into_iter().filter(|e| e.status.is_some()).collect();
        self.save();
    }

    pub fn update_differential(
        &mut self,
        version: i32,
        entries: Vec<AuthorizationData>,
    ) -> Result<(), VersionMismatch> {
        if version <= self.version {
            return Err(VersionMismatch);
        }
        for incoming in entries {
            self.entries.retain(|e| e.id_tag != incoming.id_tag);
            if incoming.status.is_some() {
                self.entries.push(incoming);
            }
        }
        self.version = version;
        self.save();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn entry(id_tag: &str, status: Option<&str>) -> AuthorizationData {
        AuthorizationData {
            id_tag: id_tag.into(),
            status: status.map(String::from),
            expiry_date: None,
            parent_id_tag: None,
        }
    }

    fn service() -> AuthListService {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let cfg = ConfigService::new(fs.clone());
        AuthListService::new(fs, &cfg)
    }

    #[test]
    fn empty_list_reports_version_zero() {
        let svc = service();
        assert_eq!(svc.list_version(), 0);
    }

    #[test]
    fn full_update_replaces() {
        let mut svc = service();
        svc.update_full(3, vec![entry("TAG01", Some("Accepted"))]);
        assert_eq!(svc.list_version(), 3);
        assert!(svc.check("TAG01", None).is_some());

        svc.update_full(4, vec![entry("TAG02", Some("Accepted"))]);
        assert!(svc.check("TAG01", None).is_none());
        assert!(svc.check("TAG02", None).is_some());
    }

    #[test]
    fn differential_requires_newer_version() {
        let mut svc = service();
        svc.update_full(3, vec![entry("TAG01", Some("Accepted"))]);
        assert!(svc.update_differential(3, vec![]).is_err());

        svc.update_differential(4, vec![entry("TAG01", None), entry("TAG02", Some("Accepted"))])
            .unwrap();
        assert!(svc.check("TAG01", None).is_none());
        assert!(svc.check("TAG02", None).is_some());
    }

    #[test]
    fn blocked_entries_do_not_authorize() {
        let mut svc = service();
        svc.update_full(1, vec![entry("TAG01", Some("Blocked"))]);
        assert!(svc.check("TAG01", None).is_none());
    }
}
