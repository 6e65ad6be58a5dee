//! Outbound request objects.
//!
//! An OCPP operation is two things: the RPC envelope that gets the message
//! to the other side (owned by [`Request`] and the queue), and the
//! application payload plus its completion logic (an [`Operation`]
//! implementation). The queue owns the request until its terminal event.

use serde_json::Value;

use crate::model::Model;
use crate::rpc::store::StoredRequestRecord;
use crate::support::errors::{HandlerError, PersistError, RpcError};
use crate::support::poll::PollResult;

/// Default answer window for volatile requests.
pub const DEFAULT_TIMEOUT_MS: u64 = 40_000;

/// What the error callback decided about a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Give up; the store record (if any) is advanced.
    Abort,
    /// Re-enqueue at the head and send again.
    Retry,
}

/// How long a sent Call may wait for its CallResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Counts wall time since the first send.
    Fixed(u64),
    /// Only accumulates while the transport is believed healthy.
    OfflineSensitive(u64),
}

impl TimeoutPolicy {
    pub fn window_ms(&self) -> u64 {
        match self {
            Self::Fixed(ms) | Self::OfflineSensitive(ms) => *ms,
        }
    }
}

/// Payload semantics of one OCPP action, in both directions.
///
/// `create_req` / `create_conf` may return `Pending` to yield; the queue
/// calls again next loop. Handlers receive the model through the call, never
/// through stored pointers.
pub trait Operation {
    fn operation_type(&self) -> &'static str;

    // ── Outbound: we issued the Call ───────────────────────

    /// Build the Call payload. Called again next tick on `Pending`.
    fn create_req(&mut self, model: &mut Model) -> PollResult<Value> {
        let _ = model;
        PollResult::Ready(Value::Object(Default::default()))
    }

    /// The matching CallResult arrived.
    fn process_conf(&mut self, model: &mut Model, payload: &Value) {
        let _ = (model, payload);
    }

    /// A CallError arrived (or a timeout was synthesized as one).
    fn process_err(&mut self, model: &mut Model, error: &RpcError) -> ErrorDisposition {
        let _ = (model, error);
        ErrorDisposition::Abort
    }

    /// The Call left the transport for the first time.
    fn on_sent(&mut self, model: &mut Model) {
        let _ = model;
    }

    /// Asked before every send attempt; `true` drops the request and
    /// advances its store record. Used by operations whose subject has
    /// become moot (e.g. meter values of a silenced transaction).
    fn should_abandon(&self, model: &Model) -> bool {
        let _ = model;
        false
    }

    // ── Inbound: the CSMS issued the Call ──────────────────

    /// Validate and apply an incoming request payload.
    fn process_req(&mut self, model: &mut Model, payload: &Value) -> Result<(), HandlerError> {
        let _ = (model, payload);
        Err(HandlerError::internal("operation is not peer-callable"))
    }

    /// Build the confirmation payload for a previously accepted request.
    fn create_conf(&mut self, model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        let _ = model;
        PollResult::Ready(Ok(Value::Object(Default::default())))
    }

    // ── Persistence ────────────────────────────────────────

    /// Rebuild operation state from a stored record after reboot.
    fn restore(&mut self, record: &StoredRequestRecord) -> Result<(), PersistError> {
        let _ = record;
        Err(PersistError::Read(format!(
            "{} is not restorable",
            self.operation_type()
        )))
    }
}

type ConfListener = Box<dyn FnMut(&Value)>;
type ErrListener = Box<dyn FnMut(&RpcError)>;
type EventListener = Box<dyn FnMut()>;

/// One logical outbound RPC: the operation plus envelope state, timeout
/// policy and user-facing completion listeners.
pub struct Request {
    operation: Box<dyn Operation>,
    action: String,
    message_id: Option<String>,
    op_nr: Option<u32>,
    /// Ordering hint for volatile requests: the store's `opEnd` at creation.
    op_nr_hint: u32,
    timeout: TimeoutPolicy,
    persistent: bool,
    pre_boot_eligible: bool,
    on_conf: Option<ConfListener>,
    on_err: Option<ErrListener>,
    on_timeout: Option<EventListener>,
    on_abort: Option<EventListener>,
}

impl Request {
    pub fn new(operation: Box<dyn Operation>) -> Self {
        let action = operation.operation_type().to_string();
        Self {
            operation,
            action,
            message_id: None,
            op_nr: None,
            op_nr_hint: 0,
            timeout: TimeoutPolicy::Fixed(DEFAULT_TIMEOUT_MS),
            persistent: false,
            pre_boot_eligible: false,
            on_conf: None,
            on_err: None,
            on_timeout: None,
            on_abort: None,
        }
    }

    /// A request whose record already lives in the store.
    pub fn persistent(operation: Box<dyn Operation>, op_nr: u32) -> Self {
        let mut request = Self::new(operation);
        request.op_nr = Some(op_nr);
        request.op_nr_hint = op_nr;
        request.persistent = true;
        request.timeout = TimeoutPolicy::OfflineSensitive(DEFAULT_TIMEOUT_MS);
        request
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pre_boot_eligible(mut self) -> Self {
        self.pre_boot_eligible = true;
        self
    }

    pub fn with_op_nr_hint(mut self, hint: u32) -> Self {
        if !self.persistent {
            self.op_nr_hint = hint;
        }
        self
    }

    pub fn on_conf(mut self, listener: ConfListener) -> Self {
        self.on_conf = Some(listener);
        self
    }

    pub fn on_err(mut self, listener: ErrListener) -> Self {
        self.on_err = Some(listener);
        self
    }

    pub fn on_timeout(mut self, listener: EventListener) -> Self {
        self.on_timeout = Some(listener);
        self
    }

    pub fn on_abort(mut self, listener: EventListener) -> Self {
        self.on_abort = Some(listener);
        self
    }

    // ── Accessors for the queue ────────────────────────────

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn op_nr(&self) -> Option<u32> {
        self.op_nr
    }

    pub fn op_nr_hint(&self) -> u32 {
        self.op_nr_hint
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Persistence failed at creation; deliver best-effort instead.
    pub fn demote_to_volatile(&mut self, hint: u32) {
        self.persistent = false;
        self.op_nr = None;
        self.op_nr_hint = hint;
    }

    pub fn is_pre_boot_eligible(&self) -> bool {
        self.pre_boot_eligible
    }

    pub fn timeout(&self) -> TimeoutPolicy {
        self.timeout
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The id stays stable across resends so the server can deduplicate.
    pub fn ensure_message_id(&mut self) -> &str {
        if self.message_id.is_none() {
            self.message_id = Some(crate::support::id::message_id());
        }
        self.message_id.as_deref().unwrap()
    }

    pub fn operation(&self) -> &dyn Operation {
        self.operation.as_ref()
    }

    pub fn operation_mut(&mut self) -> &mut dyn Operation {
        self.operation.as_mut()
    }

    // ── Completion paths (invoked by the queue) ────────────

    pub fn complete_conf(&mut self, model: &mut Model, payload: &Value) {
        self.operation.process_conf(model, payload);
        if let Some(listener) = &mut self.on_conf {
            listener(payload);
        }
    }

    pub fn complete_err(&mut self, model: &mut Model, error: &RpcError) -> ErrorDisposition {
        let disposition = self.operation.process_err(model, error);
        if let Some(listener) = &mut self.on_err {
            listener(error);
        }
        if disposition == ErrorDisposition::Abort {
            self.notify_abort();
        }
        disposition
    }

    pub fn notify_timeout(&mut self) {
        if let Some(listener) = &mut self.on_timeout {
            listener();
        }
    }

    pub fn notify_abort(&mut self) {
        if let Some(listener) = &mut self.on_abort {
            listener();
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("action", &self.action)
            .field("message_id", &self.message_id)
            .field("op_nr", &self.op_nr)
            .field("persistent", &self.persistent)
            .field("pre_boot_eligible", &self.pre_boot_eligible)
            .finish()
    }
}
