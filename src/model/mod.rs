//! Domain model of the charge point.
//!
//! The [`Model`] owns every service below the RPC layer. Services never
//! store pointers to each other; whatever a poll step needs is passed
//! through [`ServiceCx`], and operation handlers receive `&mut Model`
//! through the queue.

pub mod auth_list;
pub mod boot;
pub mod connector;
pub mod diagnostics;
pub mod firmware;
pub mod heartbeat;
pub mod meter_store;
pub mod metering;
pub mod reservation;
pub mod reset;
pub mod transaction;

use std::rc::Rc;

use serde_json::Value;
use tracing::{info, warn};

use crate::rpc::store::StoredRequestRecord;
use crate::rpc::{Operation, Request, RequestStore, TimeoutPolicy};
use crate::storage::adapter::SharedFilesystem;
use crate::storage::configuration::{ConfigHandle, ConfigService};
use crate::support::time::Clock;

pub use auth_list::AuthListService;
pub use boot::{BootData, BootService, RegistrationStatus};
pub use connector::{Availability, AvailabilityChange, ChargePointStatus, Connector, ErrorData};
pub use diagnostics::{DiagnosticsRequest, DiagnosticsService, DiagnosticsStatus};
pub use firmware::{FirmwareService, FirmwareStatus, FirmwareUpdateRequest};
pub use heartbeat::HeartbeatService;
pub use metering::{MeteringConnector, ReadingContext, SampledValueSampler, SamplerProperties};
pub use reservation::{Reservation, ReservationService};
pub use reset::{ResetKind, ResetService};
pub use transaction::{StopReason, Transaction, TransactionStore};

/// Wire dialect spoken with the CSMS. Dispatch-level only; the runtime
/// below is version-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V16,
    V201,
}

/// Truncate to an OCPP CiString cap.
pub(crate) fn ci_string(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        value.to_string()
    } else {
        value.chars().take(max_len).collect()
    }
}

/// Everything a service poll step may touch besides its own state.
pub struct ServiceCx<'a> {
    pub clock: &'a Clock,
    pub req_store: &'a mut RequestStore,
    pub tx_store: &'a mut TransactionStore,
    pub outbox: &'a mut Vec<Request>,
    pub version: ProtocolVersion,
    pub boot_accepted: bool,
    pub last_recv_tick: u64,
    pub online: bool,
    pub queue_drained: bool,
}

/// Reserve an operation number, commit the record, enqueue the request.
/// Persistence failures demote to volatile delivery; they never abort the
/// operation itself. Returns whether the record was persisted.
pub(crate) fn push_persistent_request(
    cx: &mut ServiceCx<'_>,
    operation: Box<dyn Operation>,
    action: &str,
    payload: Value,
    connector_id: Option<u32>,
    tx_nr: Option<u32>,
) -> bool {
    let hint = cx.req_store.op_end();
    let request = match cx.req_store.reserve_opnr() {
        Ok(op_nr) => {
            let record = StoredRequestRecord {
                op_nr,
                action: action.to_string(),
                payload,
                connector_id,
                tx_nr,
            };
            match cx.req_store.commit(&record) {
                Ok(()) => Request::persistent(operation, op_nr),
                Err(e) => {
                    warn!(action, "request record not persisted: {e}");
                    cx.req_store.advance(op_nr);
                    demoted(operation, hint)
                }
            }
        }
        Err(e) => {
            warn!(action, "operation number unavailable: {e}");
            demoted(operation, hint)
        }
    };
    let persisted = request.is_persistent();
    cx.outbox.push(request);
    persisted
}

fn demoted(operation: Box<dyn Operation>, hint: u32) -> Request {
    Request::new(operation)
        .with_timeout(TimeoutPolicy::OfflineSensitive(
            crate::rpc::request::DEFAULT_TIMEOUT_MS,
        ))
        .with_op_nr_hint(hint)
}

// ── Model ──────────────────────────────────────────────────────

pub struct ModelSetup {
    pub version: ProtocolVersion,
    pub connector_count: u32,
    pub boot_data: BootData,
}

pub struct Model {
    pub clock: Clock,
    pub fs: SharedFilesystem,
    pub cfg: Rc<ConfigService>,
    pub req_store: RequestStore,
    pub tx_store: TransactionStore,
    pub connectors: Vec<Connector>,
    pub metering: Vec<MeteringConnector>,
    pub boot: BootService,
    pub heartbeat: HeartbeatService,
    pub reservations: ReservationService,
    pub auth_list: AuthListService,
    pub reset: ResetService,
    pub diagnostics: DiagnosticsService,
    pub firmware: FirmwareService,
    pub version: ProtocolVersion,
    pub outbox: Vec<Request>,

    // Authorization policy knobs shared by the Authorize flow.
    authorize_remote_tx_requests: ConfigHandle,
    local_pre_authorize: ConfigHandle,
    local_authorize_offline: ConfigHandle,
    allow_offline_tx_unknown_id: ConfigHandle,

    unlock_handler: Option<Box<dyn Fn(u32) -> UnlockStatus>>,
    data_transfer_handler: Option<DataTransferHandler>,
    cache_clear_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Unlocked,
    UnlockFailed,
    NotSupported,
}

impl UnlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlocked => "Unlocked",
            Self::UnlockFailed => "UnlockFailed",
            Self::NotSupported => "NotSupported",
        }
    }
}

/// Outcome of a vendor DataTransfer handler.
pub enum DataTransferResult {
    Accepted(Option<Value>),
    Rejected,
    UnknownVendorId,
    UnknownMessageId,
}

type DataTransferHandler = Box<dyn Fn(&str, Option<&str>, Option<&Value>) -> DataTransferResult>;

impl Model {
    pub fn new(
        fs: SharedFilesystem,
        cfg: Rc<ConfigService>,
        clock: Clock,
        setup: ModelSetup,
    ) -> Self {
        let connector_count = setup.connector_count.max(1);
        let req_store = RequestStore::new(fs.clone(), cfg.clone());
        let mut tx_store = TransactionStore::new(fs.clone(), connector_count);

        let mut connectors: Vec<Connector> = (1..=connector_count)
            .map(|id| Connector::new(id, &cfg))
            .collect();
        let metering = (1..=connector_count)
            .map(|id| MeteringConnector::new(id, fs.clone(), &cfg))
            .collect();

        // Resume transactions that were live when the process died.
        for connector in &mut connectors {
            if let Some(tx_nr) = tx_store.latest_tx_nr(connector.id()) {
                if let Some(tx) = tx_store.get(connector.id(), tx_nr) {
                    connector.recover(tx);
                }
            }
        }

        // Informational keys the peer may read.
        let n = cfg.declare_int("NumberOfConnectors", connector_count as i32);
        n.set_int(connector_count as i32);
        n.revoke_peer_write();
        let profiles = cfg.declare_string(
            "SupportedFeatureProfiles",
            "Core,FirmwareManagement,LocalAuthListManagement,Reservation,RemoteTrigger",
        );
        profiles.revoke_peer_write();
        cfg.declare_int("GetConfigurationMaxKeys", 50).revoke_peer_write();

        Self {
            boot: BootService::new(setup.boot_data),
            heartbeat: HeartbeatService::new(&cfg),
            reservations: ReservationService::new(fs.clone()),
            auth_list: AuthListService::new(fs.clone(), &cfg),
            reset: ResetService::new(&cfg),
            diagnostics: DiagnosticsService::new(),
            firmware: FirmwareService::new(),
            authorize_remote_tx_requests: cfg.declare_bool("AuthorizeRemoteTxRequests", false),
            local_pre_authorize: cfg.declare_bool("LocalPreAuthorize", false),
            local_authorize_offline: cfg.declare_bool("LocalAuthorizeOffline", true),
            allow_offline_tx_unknown_id: cfg.declare_bool("AllowOfflineTxForUnknownId", false),
            unlock_handler: None,
            data_transfer_handler: None,
            cache_clear_requested: false,
            clock,
            fs,
            cfg,
            req_store,
            tx_store,
            connectors,
            metering,
            version: setup.version,
            outbox: Vec::new(),
        }
    }

    pub fn connector(&self, connector_id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id() == connector_id)
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|c| c.id() == connector_id)
    }

    /// Metering connectors are created 1:1 with connectors, in id order.
    pub fn metering_mut(&mut self, connector_id: u32) -> Option<&mut MeteringConnector> {
        let idx = connector_id.checked_sub(1)? as usize;
        self.metering.get_mut(idx)
    }

    pub fn take_outbox(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.outbox)
    }

    /// One model step. Drives every service; request emission goes through
    /// the outbox, drained by the context into the queue.
    pub fn poll(&mut self, online: bool, last_recv_tick: u64, queue_drained: bool) {
        let Model {
            clock,
            req_store,
            tx_store,
            connectors,
            metering,
            boot,
            heartbeat,
            reservations,
            reset,
            diagnostics,
            firmware,
            outbox,
            version,
            ..
        } = self;

        let mut cx = ServiceCx {
            clock,
            req_store,
            tx_store,
            outbox,
            version: *version,
            boot_accepted: boot.is_accepted(),
            last_recv_tick,
            online,
            queue_drained,
        };

        reservations.poll(cx.clock);
        boot.poll(&mut cx);
        heartbeat.poll(&mut cx);

        for (connector, metering) in connectors.iter_mut().zip(metering.iter_mut()) {
            connector.poll(&mut cx, metering, reservations);
            let tx = connector.transaction().cloned();
            metering.poll(&mut cx, tx.as_ref());
        }

        reset.poll(&mut cx, connectors);
        diagnostics.poll(&mut cx);
        firmware.poll(&mut cx);
    }

    // ── Authorization flow ─────────────────────────────────

    /// Local authorization entry point (RFID tap). Consults the local list
    /// when enabled; otherwise queues an Authorize exchange.
    pub fn begin_authorization(&mut self, connector_id: u32, id_tag: &str) -> bool {
        let id_tag = ci_string(id_tag, 20);
        let now = self.clock.tick_ms();
        let wall = self.clock.now();

        let listed = self
            .auth_list
            .check(&id_tag, wall)
            .map(|e| e.parent_id_tag.clone());
        let pre_authorized = self.local_pre_authorize.boolean() && listed.is_some();
        let parent = listed.flatten();

        let Some(connector) = self.connectors.iter_mut().find(|c| c.id() == connector_id)
        else {
            return false;
        };
        if !connector.begin_session(&id_tag, pre_authorized, now) {
            return false;
        }
        if pre_authorized {
            connector.authorize_result(&id_tag, true, parent);
            return true;
        }

        let op = crate::operations::v16::authorize::Authorize::new(
            self.version,
            connector_id,
            id_tag.clone(),
        );
        self.outbox
            .push(Request::new(Box::new(op)).with_op_nr_hint(self.req_store.op_end()));
        true
    }

    /// Authorize.conf (or its failure) resolved; also the fallback path for
    /// offline authorization.
    pub fn finish_authorization(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        accepted: bool,
        parent_id_tag: Option<String>,
    ) {
        if let Some(connector) = self.connector_mut(connector_id) {
            connector.authorize_result(id_tag, accepted, parent_id_tag);
        }
    }

    /// Authorize could not be delivered (offline). Decide locally.
    pub fn authorize_offline_fallback(&mut self, connector_id: u32, id_tag: &str) {
        let wall = self.clock.now();
        let (accepted, parent) = if self.local_authorize_offline.boolean() {
            match self.auth_list.check(id_tag, wall) {
                Some(entry) => (true, entry.parent_id_tag.clone()),
                None => (self.allow_offline_tx_unknown_id.boolean(), None),
            }
        } else {
            (self.allow_offline_tx_unknown_id.boolean(), None)
        };
        info!(connector_id, id_tag, accepted, "offline authorization fallback");
        self.finish_authorization(connector_id, id_tag, accepted, parent);
    }

    // ── Remote control ─────────────────────────────────────

    pub fn remote_start(&mut self, id_tag: &str, connector_id: Option<u32>) -> bool {
        let target = match connector_id {
            Some(id) => self.connector(id).map(|c| c.id()),
            None => self
                .connectors
                .iter()
                .find(|c| c.is_operative() && !c.has_session() && c.transaction().is_none())
                .map(|c| c.id()),
        };
        let Some(connector_id) = target else {
            return false;
        };

        if self.authorize_remote_tx_requests.boolean() {
            self.begin_authorization(connector_id, id_tag)
        } else {
            let now = self.clock.tick_ms();
            let id_tag = ci_string(id_tag, 20);
            self.connector_mut(connector_id)
                .is_some_and(|c| c.begin_session(&id_tag, true, now))
        }
    }

    pub fn remote_stop(&mut self, transaction_id: i32) -> bool {
        for connector in &mut self.connectors {
            if connector.transaction_id() == Some(transaction_id)
                && connector.has_active_transaction()
            {
                connector.end_transaction(StopReason::Remote, None);
                return true;
            }
        }
        false
    }

    /// 2.0.1 transaction ids are client-generated `"<evse>-<txNr>"`
    /// strings.
    pub fn remote_stop_by_ref(&mut self, transaction_ref: &str) -> bool {
        for connector in &mut self.connectors {
            let matches = connector.transaction().is_some_and(|tx| {
                let tx = tx.borrow();
                format!("{}-{}", tx.connector_id, tx.tx_nr) == transaction_ref
            });
            if matches && connector.has_active_transaction() {
                connector.end_transaction(StopReason::Remote, None);
                return true;
            }
        }
        false
    }

    /// Stop every running transaction (Reset, shutdown).
    pub fn stop_all_transactions(&mut self, reason: StopReason) {
        for connector in &mut self.connectors {
            if connector.has_active_transaction() {
                connector.end_transaction(reason, None);
            }
        }
    }

    // ── TriggerMessage dispatch ────────────────────────────

    pub fn trigger_message(&mut self, requested: &str, connector_id: Option<u32>) -> TriggerResult {
        match requested {
            "BootNotification" => {
                self.boot.set_triggered();
                TriggerResult::Accepted
            }
            "Heartbeat" => {
                self.heartbeat.trigger();
                TriggerResult::Accepted
            }
            "StatusNotification" => {
                let mut any = false;
                for connector in &mut self.connectors {
                    if connector_id.is_none() || connector_id == Some(connector.id()) {
                        connector.trigger_status_notification();
                        any = true;
                    }
                }
                if any {
                    TriggerResult::Accepted
                } else {
                    TriggerResult::Rejected
                }
            }
            "MeterValues" => {
                let mut any = false;
                for (idx, metering) in self.metering.iter_mut().enumerate() {
                    let id = idx as u32 + 1;
                    if connector_id.is_none() || connector_id == Some(id) {
                        metering.trigger();
                        any = true;
                    }
                }
                if any {
                    TriggerResult::Accepted
                } else {
                    TriggerResult::Rejected
                }
            }
            "DiagnosticsStatusNotification" => {
                self.diagnostics.trigger();
                TriggerResult::Accepted
            }
            "FirmwareStatusNotification" => {
                self.firmware.trigger();
                TriggerResult::Accepted
            }
            _ => TriggerResult::NotImplemented,
        }
    }

    // ── Host hooks ─────────────────────────────────────────

    pub fn set_unlock_handler(&mut self, handler: Box<dyn Fn(u32) -> UnlockStatus>) {
        self.unlock_handler = Some(handler);
    }

    pub fn unlock_connector(&mut self, connector_id: u32) -> UnlockStatus {
        if self.connector(connector_id).is_none() {
            return UnlockStatus::UnlockFailed;
        }
        let Some(handler) = &self.unlock_handler else {
            return UnlockStatus::NotSupported;
        };
        let status = handler(connector_id);
        if status == UnlockStatus::Unlocked {
            if let Some(connector) = self.connector_mut(connector_id) {
                if connector.has_active_transaction() {
                    connector.end_transaction(StopReason::UnlockCommand, None);
                }
            }
        }
        status
    }

    pub fn set_data_transfer_handler(&mut self, handler: DataTransferHandler) {
        self.data_transfer_handler = Some(handler);
    }

    pub fn handle_data_transfer(
        &self,
        vendor_id: &str,
        message_id: Option<&str>,
        data: Option<&Value>,
    ) -> DataTransferResult {
        match &self.data_transfer_handler {
            Some(handler) => handler(vendor_id, message_id, data),
            None => DataTransferResult::UnknownVendorId,
        }
    }

    /// Host-initiated vendor DataTransfer. The listener sees the response
    /// payload when the server answers.
    pub fn send_data_transfer(
        &mut self,
        vendor_id: &str,
        message_id: Option<&str>,
        data: Option<Value>,
        on_conf: Option<Box<dyn FnMut(&Value)>>,
    ) {
        let op = crate::operations::v16::data_transfer::DataTransfer::outbound(
            ci_string(vendor_id, 255),
            message_id.map(|m| ci_string(m, 50)),
            data,
        );
        let mut request =
            Request::new(Box::new(op)).with_op_nr_hint(self.req_store.op_end());
        if let Some(listener) = on_conf {
            request = request.on_conf(listener);
        }
        self.outbox.push(request);
    }

    /// Queue a SecurityEventNotification (pre-boot eligible).
    pub fn notify_security_event(&mut self, event_type: &str, tech_info: Option<&str>) {
        let op = crate::operations::v16::security_event_notification::SecurityEventNotification::new(
            ci_string(event_type, 50),
            tech_info.map(|t| ci_string(t, 255)),
            self.clock.timestamp(),
        );
        self.outbox.push(
            Request::new(Box::new(op))
                .pre_boot_eligible()
                .with_op_nr_hint(self.req_store.op_end()),
        );
    }

    // ── ClearCache ─────────────────────────────────────────

    /// ClearCache handler marks; the context completes the sweep so the
    /// queue can drop its live persistent requests too.
    pub fn request_cache_clear(&mut self) {
        self.cache_clear_requested = true;
    }

    pub fn take_cache_clear_request(&mut self) -> bool {
        std::mem::take(&mut self.cache_clear_requested)
    }

    /// Delete all `sd*`, `tx*`, `op*` files and collapse the OpNr window.
    pub fn clear_cache_files(&mut self) {
        let names = self.fs.entries().unwrap_or_default();
        for name in names {
            if name.starts_with("sd-") || name.starts_with("tx-") || name.starts_with("op-") {
                let _ = self.fs.remove(&name);
            }
        }
        self.req_store.clear();
        info!("cache cleared");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    Accepted,
    Rejected,
    NotImplemented,
}

impl TriggerResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::NotImplemented => "NotImplemented",
        }
    }
}
