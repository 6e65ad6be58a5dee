//! Monotonic tick counter and CSMS-synchronized wall clock.
//!
//! The tick counter never rewinds and survives nothing: it restarts at an
//! arbitrary value on every boot. The wall clock starts unsynchronized and is
//! set from the BootNotification / Heartbeat responses. Timestamps captured
//! before the first sync are kept as tick offsets and resolved once the
//! clock is known.

use std::cell::Cell;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Millisecond tick supplier. Defaults to process uptime; tests inject their
/// own source.
pub type TickSource = Box<dyn Fn() -> u64>;

/// A wall-clock instant, or a monotonic offset captured before the clock was
/// synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Absolute(DateTime<Utc>),
    Relative { tick_ms: u64 },
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Absolute(value)
    }
}

/// Serialize a wall-clock instant the way OCPP-J wants it: ISO 8601 UTC,
/// millisecond precision, `Z` suffix.
pub fn format_iso(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_iso(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct Clock {
    ticks: TickSource,
    last_tick: Cell<u64>,
    base_wall: Option<DateTime<Utc>>,
    base_tick: u64,
}

impl Clock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self::with_source(Box::new(move || start.elapsed().as_millis() as u64))
    }

    pub fn with_source(ticks: TickSource) -> Self {
        Self {
            ticks,
            last_tick: Cell::new(0),
            base_wall: None,
            base_tick: 0,
        }
    }

    /// Current monotonic tick. Clamped so it never rewinds even if the
    /// source misbehaves.
    pub fn tick_ms(&self) -> u64 {
        let raw = (self.ticks)();
        let tick = raw.max(self.last_tick.get());
        self.last_tick.set(tick);
        tick
    }

    pub fn is_synced(&self) -> bool {
        self.base_wall.is_some()
    }

    /// Adopt the server-provided wall time. May be called repeatedly; each
    /// call rebases the tick mapping.
    pub fn set_time(&mut self, wall: DateTime<Utc>) {
        self.base_tick = self.tick_ms();
        self.base_wall = Some(wall);
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        let base = self.base_wall?;
        let elapsed = self.tick_ms() as i64 - self.base_tick as i64;
        Some(base + Duration::milliseconds(elapsed))
    }

    /// Capture the current instant; falls back to a tick offset while the
    /// clock is unsynchronized.
    pub fn timestamp(&self) -> Timestamp {
        match self.now() {
            Some(now) => Timestamp::Absolute(now),
            None => Timestamp::Relative {
                tick_ms: self.tick_ms(),
            },
        }
    }

    /// Resolve a possibly-relative timestamp against the sync base. Relative
    /// stamps taken before the sync point resolve backwards correctly.
    pub fn resolve(&self, ts: &Timestamp) -> Option<DateTime<Utc>> {
        match ts {
            Timestamp::Absolute(t) => Some(*t),
            Timestamp::Relative { tick_ms } => {
                let base = self.base_wall?;
                let offset = *tick_ms as i64 - self.base_tick as i64;
                Some(base + Duration::milliseconds(offset))
            }
        }
    }

    /// Wire rendering of a timestamp. An unresolvable relative stamp (taken
    /// before a reboot that never saw a clock sync) renders as the epoch.
    pub fn render(&self, ts: &Timestamp) -> String {
        match self.resolve(ts) {
            Some(t) => format_iso(t),
            None => {
                tracing::debug!("rendering unsynchronized timestamp as epoch");
                format_iso(DateTime::<Utc>::UNIX_EPOCH)
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn manual_clock() -> (Clock, Rc<RefCell<u64>>) {
        let tick = Rc::new(RefCell::new(0u64));
        let source = tick.clone();
        let clock = Clock::with_source(Box::new(move || *source.borrow()));
        (clock, tick)
    }

    #[test]
    fn unsynchronized_clock_yields_relative_stamps() {
        let (clock, tick) = manual_clock();
        *tick.borrow_mut() = 1234;
        assert!(!clock.is_synced());
        assert_eq!(clock.timestamp(), Timestamp::Relative { tick_ms: 1234 });
        assert!(clock.now().is_none());
    }

    #[test]
    fn sync_resolves_past_relative_stamps() {
        let (mut clock, tick) = manual_clock();
        *tick.borrow_mut() = 5_000;
        let early = clock.timestamp();

        *tick.borrow_mut() = 65_000;
        let wall = parse_iso("2024-06-01T12:00:00.000Z").unwrap();
        clock.set_time(wall);

        // Captured 60 s before the sync point.
        let resolved = clock.resolve(&early).unwrap();
        assert_eq!(format_iso(resolved), "2024-06-01T11:59:00.000Z");
    }

    #[test]
    fn ticks_never_rewind() {
        let (clock, tick) = manual_clock();
        *tick.borrow_mut() = 100;
        assert_eq!(clock.tick_ms(), 100);
        *tick.borrow_mut() = 50;
        assert_eq!(clock.tick_ms(), 100);
    }

    #[test]
    fn iso_format_millisecond_z() {
        let t = parse_iso("2024-01-02T03:04:05.678Z").unwrap();
        assert_eq!(format_iso(t), "2024-01-02T03:04:05.678Z");
    }

    #[test]
    fn timestamp_serde_roundtrip() {
        let abs = Timestamp::Absolute(parse_iso("2024-06-01T00:00:00.000Z").unwrap());
        let rel = Timestamp::Relative { tick_ms: 42 };
        for ts in [abs, rel] {
            let json = serde_json::to_string(&ts).unwrap();
            let back: Timestamp = serde_json::from_str(&json).unwrap();
            assert_eq!(back, ts);
        }
    }
}
