//! Boot registration.
//!
//! Submits BootNotification through the pre-boot-eligible path until the
//! CSMS accepts the charge point, honoring the server-provided retry
//! interval. Acceptance opens the post-boot gate (the context syncs the
//! queue every cycle) and adopts the negotiated heartbeat interval.

use tracing::{info, warn};

use super::ServiceCx;
use crate::operations::v16::boot_notification::BootNotification;
use crate::rpc::Request;

pub const BOOT_INTERVAL_DEFAULT_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

impl RegistrationStatus {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Accepted" => Some(Self::Accepted),
            "Pending" => Some(Self::Pending),
            "Rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Identity strings sent in BootNotification, clamped to their CiString
/// caps at construction.
#[derive(Debug, Clone, Default)]
pub struct BootData {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    pub charge_point_serial_number: Option<String>,
    pub charge_box_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub meter_type: Option<String>,
    pub meter_serial_number: Option<String>,
}

impl BootData {
    pub fn new(vendor: &str, model: &str) -> Self {
        Self {
            charge_point_vendor: super::ci_string(vendor, 20),
            charge_point_model: super::ci_string(model, 25),
            ..Default::default()
        }
    }

    pub fn with_serial_number(mut self, serial: &str) -> Self {
        self.charge_point_serial_number = Some(super::ci_string(serial, 25));
        self
    }

    pub fn with_firmware_version(mut self, version: &str) -> Self {
        self.firmware_version = Some(super::ci_string(version, 50));
        self
    }
}

pub struct BootService {
    status: Option<RegistrationStatus>,
    interval_s: u64,
    last_attempt_tick: Option<u64>,
    in_flight: bool,
    triggered: bool,
    data: BootData,
}

impl BootService {
    pub fn new(data: BootData) -> Self {
        Self {
            status: None,
            interval_s: BOOT_INTERVAL_DEFAULT_S,
            last_attempt_tick: None,
            in_flight: false,
            triggered: false,
            data,
        }
    }

    pub fn data(&self) -> &BootData {
        &self.data
    }

    pub fn registration_status(&self) -> Option<RegistrationStatus> {
        self.status
    }

    pub fn is_accepted(&self) -> bool {
        self.status == Some(RegistrationStatus::Accepted)
    }

    /// TriggerMessage(BootNotification) requests a re-send even after
    /// acceptance.
    pub fn set_triggered(&mut self) {
        self.triggered = true;
    }

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>) {
        if self.in_flight {
            return;
        }
        if self.is_accepted() && !self.triggered {
            return;
        }
        let now = cx.clock.tick_ms();
        let due = match self.last_attempt_tick {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval_s * 1000,
        };
        if !due {
            return;
        }
        self.in_flight = true;
        self.last_attempt_tick = Some(now);
        let op = BootNotification::new(cx.version);
        cx.outbox.push(
            Request::new(Box::new(op))
                .pre_boot_eligible()
                .with_op_nr_hint(cx.req_store.op_end()),
        );
    }

    /// BootNotification.conf arrived. `interval_s` of 0 keeps the current
    /// setting.
    pub fn handle_conf(&mut self, status: RegistrationStatus, interval_s: i32) {
        self.in_flight = false;
        self.triggered = false;
        let previous = self.status;
        self.status = Some(status);
        match status {
            RegistrationStatus::Accepted => {
                if previous != Some(RegistrationStatus::Accepted) {
                    info!("boot registration accepted");
                }
            }
            RegistrationStatus::Pending | RegistrationStatus::Rejected => {
                if interval_s > 0 {
                    self.interval_s = interval_s as u64;
                } else {
                    self.interval_s = BOOT_INTERVAL_DEFAULT_S;
                }
                warn!(?status, retry_s = self.interval_s, "boot registration not accepted");
            }
        }
    }

    /// The request failed or timed out; keep the retry cadence.
    pub fn handle_failure(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_data_clamps_ci_strings() {
        let data = BootData::new(
            "A-vendor-name-that-is-way-too-long",
            "A-model-name-that-is-also-way-too-long",
        )
        .with_firmware_version("fw-1.0");
        assert_eq!(data.charge_point_vendor.len(), 20);
        assert_eq!(data.charge_point_model.len(), 25);
        assert_eq!(data.firmware_version.as_deref(), Some("fw-1.0"));
    }

    #[test]
    fn registration_status_parses() {
        assert_eq!(
            RegistrationStatus::from_wire("Accepted"),
            Some(RegistrationStatus::Accepted)
        );
        assert_eq!(RegistrationStatus::from_wire("Unknown"), None);
    }

    #[test]
    fn conf_adopts_retry_interval_when_pending() {
        let mut boot = BootService::new(BootData::new("V", "M"));
        boot.handle_conf(RegistrationStatus::Pending, 5);
        assert_eq!(boot.interval_s, 5);
        assert!(!boot.is_accepted());

        boot.handle_conf(RegistrationStatus::Accepted, 60);
        assert!(boot.is_accepted());
    }
}
