//! Per-connector charging state machine.
//!
//! Continuous inputs (cable, EV/EVSE readiness, occupancy, faults) are
//! registered closures polled every cycle; discrete events (authorization,
//! local stop, remote commands) arrive through methods. Each cycle the
//! connector re-derives its OCPP status and emits a StatusNotification when
//! it changed.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info, warn};

use super::metering::{MeteringConnector, ReadingContext};
use super::reservation::ReservationService;
use super::transaction::{StopReason, Transaction};
use super::{push_persistent_request, ServiceCx};
use crate::operations::v16::start_transaction::StartTransaction;
use crate::operations::v16::status_notification::StatusNotification;
use crate::operations::v16::stop_transaction::StopTransaction;
use crate::rpc::Request;
use crate::storage::configuration::{ConfigHandle, ConfigService};

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePointStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ChargePointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEV => "SuspendedEV",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Available" => Some(Self::Available),
            "Preparing" => Some(Self::Preparing),
            "Charging" => Some(Self::Charging),
            "SuspendedEV" => Some(Self::SuspendedEV),
            "SuspendedEVSE" => Some(Self::SuspendedEVSE),
            "Finishing" => Some(Self::Finishing),
            "Reserved" => Some(Self::Reserved),
            "Unavailable" => Some(Self::Unavailable),
            "Faulted" => Some(Self::Faulted),
            _ => None,
        }
    }

    /// OCPP 2.0.1 aggregates the session states into `Occupied`.
    pub fn as_v201_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing
            | Self::Charging
            | Self::SuspendedEV
            | Self::SuspendedEVSE
            | Self::Finishing => "Occupied",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }
}

/// Error report attached to a Faulted status.
#[derive(Debug, Clone, Default)]
pub struct ErrorData {
    pub error_code: String,
    pub info: Option<String>,
    pub vendor_id: Option<String>,
    pub vendor_error_code: Option<String>,
}

impl ErrorData {
    pub fn new(error_code: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            ..Default::default()
        }
    }
}

// ── Availability ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Operative,
    Inoperative,
    /// Inoperative requested while a transaction runs; applied after it
    /// ends.
    InoperativeScheduled,
}

/// Outcome of a ChangeAvailability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityChange {
    Accepted,
    Scheduled,
}

// ── Session ────────────────────────────────────────────────────

struct AuthSession {
    id_tag: String,
    parent_id_tag: Option<String>,
    accepted: bool,
    began_tick: u64,
}

type BoolInput = Box<dyn Fn() -> bool>;
type ErrorInput = Box<dyn Fn() -> Option<ErrorData>>;

// ── Connector ──────────────────────────────────────────────────

pub struct Connector {
    id: u32,
    plugged_input: Option<BoolInput>,
    ev_ready_input: Option<BoolInput>,
    evse_ready_input: Option<BoolInput>,
    occupied_inputs: Vec<BoolInput>,
    error_inputs: Vec<ErrorInput>,

    session: Option<AuthSession>,
    transaction: Option<Rc<RefCell<Transaction>>>,
    pending_stop: Option<(StopReason, Option<String>)>,
    finishing: bool,

    availability: Availability,
    availability_state: ConfigHandle,
    reported_status: Option<ChargePointStatus>,
    reported_status_state: ConfigHandle,
    trigger_status: bool,

    connection_timeout: ConfigHandle,
    stop_on_ev_side_disconnect: ConfigHandle,

    current_error: Option<ErrorData>,
}

impl Connector {
    pub fn new(id: u32, cfg: &ConfigService) -> Self {
        let availability_state = cfg.declare_state_int(&format!("AvailabilityState-{id}"), 0);
        let reported_status_state = cfg.declare_state_string(&format!("ReportedStatus-{id}"), "");
        let availability = if availability_state.int() == 0 {
            Availability::Operative
        } else {
            Availability::Inoperative
        };
        let reported_status = ChargePointStatus::from_str(&reported_status_state.string());
        Self {
            id,
            plugged_input: None,
            ev_ready_input: None,
            evse_ready_input: None,
            occupied_inputs: Vec::new(),
            error_inputs: Vec::new(),
            session: None,
            transaction: None,
            pending_stop: None,
            finishing: false,
            availability,
            availability_state,
            reported_status,
            reported_status_state,
            trigger_status: false,
            connection_timeout: cfg.declare_int("ConnectionTimeOut", 120),
            stop_on_ev_side_disconnect: cfg.declare_bool("StopTransactionOnEVSideDisconnect", true),
            current_error: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    // ── Integrator inputs ──────────────────────────────────

    pub fn set_connector_plugged_input(&mut self, input: BoolInput) {
        self.plugged_input = Some(input);
    }

    pub fn set_ev_ready_input(&mut self, input: BoolInput) {
        self.ev_ready_input = Some(input);
    }

    pub fn set_evse_ready_input(&mut self, input: BoolInput) {
        self.evse_ready_input = Some(input);
    }

    pub fn add_connector_occupied_input(&mut self, input: BoolInput) {
        self.occupied_inputs.push(input);
    }

    pub fn add_error_data_input(&mut self, input: ErrorInput) {
        self.error_inputs.push(input);
    }

    // ── Session / authorization ────────────────────────────

    /// Open an authorization session. The caller decides whether the tag is
    /// already authorized (local list / remote start) or pending an
    /// Authorize exchange.
    pub fn begin_session(&mut self, id_tag: &str, accepted: bool, began_tick: u64) -> bool {
        if self.session.is_some() || self.transaction.is_some() {
            return false;
        }
        if !matches!(self.availability, Availability::Operative) {
            return false;
        }
        self.finishing = false;
        self.session = Some(AuthSession {
            id_tag: id_tag.to_string(),
            parent_id_tag: None,
            accepted,
            began_tick,
        });
        true
    }

    /// Authorize.conf arrived for this session's tag.
    pub fn authorize_result(&mut self, id_tag: &str, accepted: bool, parent_id_tag: Option<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id_tag != id_tag {
            return;
        }
        if accepted {
            session.accepted = true;
            session.parent_id_tag = parent_id_tag;
            info!(connector_id = self.id, id_tag, "authorization accepted");
        } else {
            info!(connector_id = self.id, id_tag, "authorization rejected");
            self.session = None;
        }
    }

    pub fn session_id_tag(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id_tag.as_str())
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn cancel_session(&mut self) {
        self.session = None;
    }

    // ── Transaction control ────────────────────────────────

    pub fn transaction(&self) -> Option<&Rc<RefCell<Transaction>>> {
        self.transaction.as_ref()
    }

    pub fn has_active_transaction(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|tx| tx.borrow().active)
    }

    pub fn transaction_id(&self) -> Option<i32> {
        self.transaction.as_ref().and_then(|tx| tx.borrow().transaction_id)
    }

    /// Local end of session; takes effect on the next poll.
    pub fn end_transaction(&mut self, reason: StopReason, id_tag: Option<String>) {
        if self.has_active_transaction() {
            self.pending_stop = Some((reason, id_tag));
        } else {
            self.session = None;
        }
    }

    // ── Availability ───────────────────────────────────────

    pub fn set_availability(&mut self, operative: bool) -> AvailabilityChange {
        if operative {
            self.availability = Availability::Operative;
            self.availability_state.set_int(0);
            return AvailabilityChange::Accepted;
        }
        if self.has_active_transaction() {
            self.availability = Availability::InoperativeScheduled;
            AvailabilityChange::Scheduled
        } else {
            self.availability = Availability::Inoperative;
            self.availability_state.set_int(1);
            AvailabilityChange::Accepted
        }
    }

    pub fn is_operative(&self) -> bool {
        matches!(self.availability, Availability::Operative)
    }

    /// Force re-emission of the current status (TriggerMessage).
    pub fn trigger_status_notification(&mut self) {
        self.trigger_status = true;
    }

    // ── Boot recovery ──────────────────────────────────────

    /// Re-adopt a transaction that was live when the process died. The
    /// session is closed with reason `Reboot` unless a stop was already
    /// issued before the restart.
    pub fn recover(&mut self, tx: Rc<RefCell<Transaction>>) {
        let (active, stop_sent) = {
            let t = tx.borrow();
            (t.active, t.stop_sent)
        };
        if active && !stop_sent {
            info!(
                connector_id = self.id,
                tx_nr = tx.borrow().tx_nr,
                "recovering interrupted transaction"
            );
            self.transaction = Some(tx);
            self.pending_stop = Some((StopReason::Reboot, None));
        }
    }

    // ── Poll cycle ─────────────────────────────────────────

    pub fn poll(
        &mut self,
        cx: &mut ServiceCx<'_>,
        metering: &mut MeteringConnector,
        reservations: &mut ReservationService,
    ) {
        let now = cx.clock.tick_ms();
        let plugged = self.plugged_input.as_ref().map_or(false, |f| f());
        self.current_error = self.error_inputs.iter().find_map(|f| f());
        let faulted = self.current_error.is_some();

        // Scheduled unavailability applies once the connector is idle.
        if matches!(self.availability, Availability::InoperativeScheduled)
            && !self.has_active_transaction()
        {
            self.availability = Availability::Inoperative;
            self.availability_state.set_int(1);
        }

        if !plugged {
            self.finishing = false;
        }

        // Authorization expires if the cable never arrives.
        if self.transaction.is_none() {
            if let Some(session) = &self.session {
                let timeout_s = self.connection_timeout.int().max(0) as u64;
                if !plugged
                    && timeout_s > 0
                    && now.saturating_sub(session.began_tick) >= timeout_s * 1000
                {
                    info!(connector_id = self.id, "authorization timed out without plug-in");
                    self.session = None;
                }
            }
        }

        self.check_tx_begin(cx, metering, reservations, plugged, faulted);
        self.check_tx_end(cx, metering, plugged, faulted);
        self.emit_status(cx, plugged, faulted, reservations);
    }

    fn check_tx_begin(
        &mut self,
        cx: &mut ServiceCx<'_>,
        metering: &mut MeteringConnector,
        reservations: &mut ReservationService,
        plugged: bool,
        faulted: bool,
    ) {
        if self.transaction.is_some() {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        if !session.accepted
            || !plugged
            || faulted
            || !matches!(self.availability, Availability::Operative)
        {
            return;
        }

        let reservation_id = match reservations.for_connector(self.id) {
            Some(res) => {
                let matches = res.id_tag == session.id_tag
                    || (res.parent_id_tag.is_some()
                        && res.parent_id_tag == session.parent_id_tag);
                if !matches {
                    debug!(connector_id = self.id, "connector reserved for another tag");
                    return;
                }
                Some(res.reservation_id)
            }
            None => None,
        };
        if let Some(id) = reservation_id {
            reservations.consume(id);
        }

        let tx_nr = cx.tx_store.next_tx_nr(self.id);
        let tx = cx.tx_store.create(self.id, tx_nr, false);
        {
            let mut t = tx.borrow_mut();
            t.id_tag = session.id_tag.clone();
            t.parent_id_tag = session.parent_id_tag.clone();
            t.authorized = true;
            t.begin_timestamp = Some(cx.clock.timestamp());
            t.meter_start = metering.read_energy(ReadingContext::TransactionBegin);
            t.reservation_id = reservation_id;
            t.running = true;
        }
        if let Err(e) = cx.tx_store.commit(&tx.borrow()) {
            warn!(connector_id = self.id, tx_nr, "transaction commit failed: {e}");
        }
        metering.begin_tx(cx.clock, tx_nr);

        info!(
            connector_id = self.id,
            tx_nr,
            id_tag = %tx.borrow().id_tag,
            "transaction started"
        );

        let op = StartTransaction::new(cx.version, self.id, tx_nr);
        let payload = op.build_payload(cx.clock, &tx.borrow());
        let action = op.action_name();
        push_persistent_request(
            cx,
            Box::new(op),
            action,
            payload,
            Some(self.id),
            Some(tx_nr),
        );
        self.transaction = Some(tx);
    }

    fn check_tx_end(
        &mut self,
        cx: &mut ServiceCx<'_>,
        metering: &mut MeteringConnector,
        plugged: bool,
        faulted: bool,
    ) {
        let Some(tx) = self.transaction.clone() else {
            return;
        };

        let stop = {
            let t = tx.borrow();
            if !t.active {
                None
            } else if let Some(pending) = self.pending_stop.take() {
                Some(pending)
            } else if t.deauthorized {
                Some((StopReason::DeAuthorized, None))
            } else if !plugged && self.stop_on_ev_side_disconnect.boolean() {
                Some((StopReason::EVDisconnected, None))
            } else if faulted {
                Some((StopReason::Other, None))
            } else {
                None
            }
        };

        let Some((reason, stop_id_tag)) = stop else {
            // A settled handle is released; the store keeps the weak ref.
            if tx.borrow().is_settled() {
                self.transaction = None;
            }
            return;
        };

        let tx_nr = tx.borrow().tx_nr;
        {
            let mut t = tx.borrow_mut();
            t.active = false;
            t.running = false;
            t.stop_timestamp = Some(cx.clock.timestamp());
            t.meter_stop = metering.read_energy(ReadingContext::TransactionEnd);
            t.stop_reason = Some(reason);
            t.stop_id_tag = stop_id_tag;
        }

        info!(connector_id = self.id, tx_nr, reason = reason.as_str(), "transaction ended");

        if tx.borrow().silent {
            metering.abort_tx(tx_nr);
            let _ = cx.tx_store.commit(&tx.borrow());
            self.transaction = None;
            self.session = None;
            self.finishing = plugged;
            return;
        }

        let tx_data = metering.end_tx(cx.clock, tx_nr);
        if let Err(e) = cx.tx_store.commit(&tx.borrow()) {
            warn!(connector_id = self.id, tx_nr, "transaction commit failed: {e}");
        }

        let op = StopTransaction::new(cx.version, self.id, tx_nr);
        let payload = op.build_payload(cx.clock, &tx.borrow(), &tx_data);
        let action = op.action_name();
        let persisted = push_persistent_request(
            cx,
            Box::new(op),
            action,
            payload,
            Some(self.id),
            Some(tx_nr),
        );
        if persisted {
            // The stop record carries the data now.
            metering.purge_tx_files(tx_nr);
        }

        self.transaction = None;
        self.session = None;
        self.finishing = plugged;
    }

    fn infer_status(
        &self,
        plugged: bool,
        faulted: bool,
        reservations: &ReservationService,
    ) -> ChargePointStatus {
        if faulted {
            return ChargePointStatus::Faulted;
        }
        if !matches!(self.availability, Availability::Operative) {
            return ChargePointStatus::Unavailable;
        }
        if let Some(tx) = &self.transaction {
            if tx.borrow().active {
                let ev_ready = self.ev_ready_input.as_ref().map_or(true, |f| f());
                let evse_ready = self.evse_ready_input.as_ref().map_or(true, |f| f());
                return if ev_ready && evse_ready {
                    ChargePointStatus::Charging
                } else if !evse_ready {
                    ChargePointStatus::SuspendedEVSE
                } else {
                    ChargePointStatus::SuspendedEV
                };
            }
            return ChargePointStatus::Finishing;
        }
        if self.finishing && plugged {
            return ChargePointStatus::Finishing;
        }
        if reservations.for_connector(self.id).is_some() {
            return ChargePointStatus::Reserved;
        }
        if plugged || self.session.is_some() || self.occupied_inputs.iter().any(|f| f()) {
            return ChargePointStatus::Preparing;
        }
        ChargePointStatus::Available
    }

    fn emit_status(
        &mut self,
        cx: &mut ServiceCx<'_>,
        plugged: bool,
        faulted: bool,
        reservations: &ReservationService,
    ) {
        let status = self.infer_status(plugged, faulted, reservations);
        if self.reported_status == Some(status) && !self.trigger_status {
            return;
        }
        self.trigger_status = false;
        debug!(connector_id = self.id, status = status.as_str(), "status changed");

        let op = StatusNotification::new(
            cx.version,
            self.id,
            status,
            self.current_error.clone(),
            cx.clock.timestamp(),
        );
        cx.outbox
            .push(Request::new(Box::new(op)).with_op_nr_hint(cx.req_store.op_end()));

        self.reported_status = Some(status);
        self.reported_status_state.set_string(status.as_str());
    }

    /// Current status as last derived; for ChangeAvailability checks and
    /// the host API.
    pub fn reported_status(&self) -> Option<ChargePointStatus> {
        self.reported_status
    }
}
