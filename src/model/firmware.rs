//! Firmware update tracking.
//!
//! UpdateFirmware hands the download to an integrator callback; the service
//! tracks installation state and emits FirmwareStatusNotification on change
//! or trigger. Download and flashing live outside the core.

use chrono::{DateTime, Utc};

use super::ServiceCx;
use crate::operations::v16::firmware_status_notification::FirmwareStatusNotification;
use crate::rpc::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Idle,
    Downloading,
    Downloaded,
    DownloadFailed,
    Installing,
    Installed,
    InstallationFailed,
}

impl FirmwareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Downloading => "Downloading",
            Self::Downloaded => "Downloaded",
            Self::DownloadFailed => "DownloadFailed",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::InstallationFailed => "InstallationFailed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirmwareUpdateRequest {
    pub location: String,
    pub retrieve_date: Option<DateTime<Utc>>,
    pub retries: Option<i32>,
    pub retry_interval: Option<i32>,
}

type DownloadHook = Box<dyn Fn(&FirmwareUpdateRequest)>;

pub struct FirmwareService {
    status: FirmwareStatus,
    reported: Option<FirmwareStatus>,
    triggered: bool,
    download_handler: Option<DownloadHook>,
}

impl FirmwareService {
    pub fn new() -> Self {
        Self {
            status: FirmwareStatus::Idle,
            reported: None,
            triggered: false,
            download_handler: None,
        }
    }

    pub fn set_download_handler(&mut self, hook: DownloadHook) {
        self.download_handler = Some(hook);
    }

    /// UpdateFirmware: schedule the download with the host.
    /// Returns whether a handler took the job.
    pub fn request_update(&mut self, request: FirmwareUpdateRequest) -> bool {
        match &self.download_handler {
            Some(handler) => {
                handler(&request);
                self.status = FirmwareStatus::Downloading;
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, status: FirmwareStatus) {
        self.status = status;
    }

    pub fn status(&self) -> FirmwareStatus {
        self.status
    }

    pub fn trigger(&mut self) {
        self.triggered = true;
    }

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>) {
        let changed = self.reported != Some(self.status) && self.status != FirmwareStatus::Idle;
        if !changed && !self.triggered {
            return;
        }
        let triggered = self.triggered;
        self.triggered = false;
        self.reported = Some(self.status);

        let op = FirmwareStatusNotification::new(self.status);
        let mut request = Request::new(Box::new(op)).with_op_nr_hint(cx.req_store.op_end());
        if triggered {
            request = request.pre_boot_eligible();
        }
        cx.outbox.push(request);
    }
}

impl Default for FirmwareService {
    fn default() -> Self {
        Self::new()
    }
}
