//! Diagnostics upload tracking.
//!
//! GetDiagnostics hands the transfer to an integrator callback; this
//! service only tracks the upload state and emits
//! DiagnosticsStatusNotification on change or trigger. The upload I/O
//! itself lives outside the core.

use chrono::{DateTime, Utc};

use super::ServiceCx;
use crate::operations::v16::diagnostics_status_notification::DiagnosticsStatusNotification;
use crate::rpc::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsStatus {
    Idle,
    Uploading,
    Uploaded,
    UploadFailed,
}

impl DiagnosticsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Uploading => "Uploading",
            Self::Uploaded => "Uploaded",
            Self::UploadFailed => "UploadFailed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticsRequest {
    pub location: String,
    pub retries: Option<i32>,
    pub retry_interval: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
}

/// Returns the name of the file that will be uploaded, or `None` when no
/// diagnostics are available.
type UploadHook = Box<dyn Fn(&DiagnosticsRequest) -> Option<String>>;

pub struct DiagnosticsService {
    status: DiagnosticsStatus,
    reported: Option<DiagnosticsStatus>,
    triggered: bool,
    upload_handler: Option<UploadHook>,
}

impl DiagnosticsService {
    pub fn new() -> Self {
        Self {
            status: DiagnosticsStatus::Idle,
            reported: None,
            triggered: false,
            upload_handler: None,
        }
    }

    pub fn set_upload_handler(&mut self, hook: UploadHook) {
        self.upload_handler = Some(hook);
    }

    /// GetDiagnostics: delegate to the host; returns the upload file name.
    pub fn request_upload(&mut self, request: DiagnosticsRequest) -> Option<String> {
        let handler = self.upload_handler.as_ref()?;
        let file_name = handler(&request)?;
        self.status = DiagnosticsStatus::Uploading;
        Some(file_name)
    }

    /// Host-side progress updates.
    pub fn set_status(&mut self, status: DiagnosticsStatus) {
        self.status = status;
    }

    pub fn status(&self) -> DiagnosticsStatus {
        self.status
    }

    pub fn trigger(&mut self) {
        self.triggered = true;
    }

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>) {
        let changed = self.reported != Some(self.status) && self.status != DiagnosticsStatus::Idle;
        if !changed && !self.triggered {
            return;
        }
        let triggered = self.triggered;
        self.triggered = false;
        self.reported = Some(self.status);

        let op = DiagnosticsStatusNotification::new(self.status);
        let mut request = Request::new(Box::new(op)).with_op_nr_hint(cx.req_store.op_end());
        if triggered {
            request = request.pre_boot_eligible();
        }
        cx.outbox.push(request);
    }
}

impl Default for DiagnosticsService {
    fn default() -> Self {
        Self::new()
    }
}
