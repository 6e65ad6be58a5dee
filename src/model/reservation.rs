//! Connector reservations.
//!
//! Slot-indexed records persisted as one file; expiry is checked every poll
//! once the wall clock is known. The connector consults the matching
//! reservation at transaction begin and consumes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::adapter::SharedFilesystem;
use crate::storage::files::RESERVATIONS_FN;
use crate::support::time::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: i32,
    pub connector_id: u32,
    pub expiry_date: DateTime<Utc>,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

pub struct ReservationService {
    fs: SharedFilesystem,
    slots: Vec<Reservation>,
}

impl ReservationService {
    pub fn new(fs: SharedFilesystem) -> Self {
        let slots = match fs.read(RESERVATIONS_FN) {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("reservation records malformed, discarded: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("reservation records unreadable: {e}");
                Vec::new()
            }
        };
        Self { fs, slots }
    }

    fn save(&self) {
        match serde_json::to_string(&self.slots) {
            Ok(text) => {
                if let Err(e) = self.fs.write(RESERVATIONS_FN, &text) {
                    warn!("reservation persistence failed: {e}");
                }
            }
            Err(e) => warn!("reservation serialization failed: {e}"),
        }
    }

    pub fn poll(&mut self, clock: &Clock) {
        let Some(now) = clock.now() else {
            return;
        };
        let before = self.slots.len();
        self.slots.retain(|r| r.expiry_date > now);
        if self.slots.len() != before {
            info!("expired reservations dropped");
            self.save();
        }
    }

    pub fn for_connector(&self, connector_id: u32) -> Option<&Reservation> {
        self.slots.iter().find(|r| r.connector_id == connector_id)
    }

    pub fn by_id(&self, reservation_id: i32) -> Option<&Reservation> {
        self.slots.iter().find(|r| r.reservation_id == reservation_id)
    }

    /// Insert or update by reservation id.
    pub fn upsert(&mut self, reservation: Reservation) {
        self.slots
            .retain(|r| r.reservation_id != reservation.reservation_id);
        self.slots.push(reservation);
        self.save();
    }

    pub fn cancel(&mut self, reservation_id: i32) -> bool {
        let before = self.slots.len();
        self.slots.retain(|r| r.reservation_id != reservation_id);
        let removed = self.slots.len() != before;
        if removed {
            self.save();
        }
        removed
    }

    /// The reservation was honored by a starting transaction.
    pub fn consume(&mut self, reservation_id: i32) {
        if self.cancel(reservation_id) {
            info!(reservation_id, "reservation consumed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::time::parse_iso;
    use std::rc::Rc;

    fn reservation(id: i32, connector_id: u32, expiry: &str) -> Reservation {
        Reservation {
            reservation_id: id,
            connector_id,
            expiry_date: parse_iso(expiry).unwrap(),
            id_tag: "TAG01".into(),
            parent_id_tag: None,
        }
    }

    #[test]
    fn upsert_cancel_roundtrip() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut svc = ReservationService::new(fs.clone());
        svc.upsert(reservation(7, 1, "2030-01-01T00:00:00Z"));
        assert!(svc.for_connector(1).is_some());

        // Survives a reboot.
        let mut svc = ReservationService::new(fs);
        assert_eq!(svc.by_id(7).unwrap().connector_id, 1);
        assert!(svc.cancel(7));
        assert!(svc.for_connector(1).is_none());
    }

    #[test]
    fn expiry_frees_the_connector() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut svc = ReservationService::new(fs);
        svc.upsert(reservation(1, 1, "2020-01-01T00:00:00Z"));

        let mut clock = Clock::with_source(Box::new(|| 1000));
        clock.set_time(parse_iso("2024-06-01T00:00:00Z").unwrap());
        svc.poll(&clock);
        assert!(svc.for_connector(1).is_none());
    }

    #[test]
    fn unsynchronized_clock_keeps_reservations() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let mut svc = ReservationService::new(fs);
        svc.upsert(reservation(1, 1, "2020-01-01T00:00:00Z"));
        let clock = Clock::with_source(Box::new(|| 1000));
        svc.poll(&clock);
        assert!(svc.for_connector(1).is_some());
    }
}
