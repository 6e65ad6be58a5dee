//! The operation runtime's single owner and scheduler.
//!
//! [`Context`] owns the connection, the operation registry, the request
//! queue and the model. `poll()` is the only scheduling entry: it ticks the
//! transport, dispatches inbound frames, drives pending confirmations, runs
//! the queue and the model, and drains the model's outbox into the queue.
//! Nothing blocks; everything long-running yields `Pending` and is asked
//! again next cycle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{Model, ModelSetup};
use crate::operations;
use crate::rpc::frame::{Frame, DEFAULT_MAX_MESSAGE_SIZE};
use crate::rpc::registry::{OperationRegistry, PayloadHook};
use crate::rpc::request::Operation;
use crate::rpc::RequestQueue;
use crate::storage::adapter::SharedFilesystem;
use crate::storage::ConfigService;
use crate::support::errors::{HandlerError, RpcError, RpcErrorCode, SetupError};
use crate::support::poll::PollResult;
use crate::support::time::Clock;
use crate::transport::Connection;

/// Inbound messages parked while the consumer is mid-cycle.
const INBOX_CAP: usize = 64;

/// A CSMS-issued Call whose confirmation is still owed. Confirmations are
/// emitted in receipt order; an entry whose handler yields `Pending` is
/// skipped without blocking the others.
struct InboundCall {
    unique_id: String,
    operation: Box<dyn Operation>,
    on_response: Option<PayloadHook>,
    response: Option<Frame>,
}

pub struct Context {
    connection: Box<dyn Connection>,
    registry: OperationRegistry,
    queue: RequestQueue,
    model: Model,
    inbox: Rc<RefCell<VecDeque<String>>>,
    pending_confs: Vec<InboundCall>,
    max_message_size: usize,
}

impl Context {
    pub fn new(
        connection: Box<dyn Connection>,
        filesystem: SharedFilesystem,
        setup: ModelSetup,
    ) -> Result<Self, SetupError> {
        Self::with_clock(connection, filesystem, setup, Clock::new())
    }

    /// Like [`Context::new`] with an injected tick source (tests, hosts
    /// with their own monotonic timer).
    pub fn with_clock(
        mut connection: Box<dyn Connection>,
        filesystem: SharedFilesystem,
        setup: ModelSetup,
        clock: Clock,
    ) -> Result<Self, SetupError> {
        if setup.boot_data.charge_point_vendor.is_empty()
            || setup.boot_data.charge_point_model.is_empty()
        {
            return Err(SetupError::Invalid(
                "chargePointVendor and chargePointModel are required".into(),
            ));
        }

        let version = setup.version;
        let cfg = ConfigService::new(filesystem.clone());
        let model = Model::new(filesystem, cfg, clock, setup);

        let mut registry = OperationRegistry::new();
        operations::register_all(version, &mut registry);

        let queue = RequestQueue::new(Box::new(move |record| {
            operations::restore_operation(version, record)
        }));

        let inbox = Rc::new(RefCell::new(VecDeque::new()));
        let sink = inbox.clone();
        connection.set_receive_cb(Box::new(move |bytes| {
            if sink.borrow().len() >= INBOX_CAP {
                return false;
            }
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    sink.borrow_mut().push_back(text.to_string());
                    true
                }
                Err(_) => false,
            }
        }));

        Ok(Self {
            connection,
            registry,
            queue,
            model,
            inbox,
            pending_confs: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    pub fn set_max_message_size(&mut self, bytes: usize) {
        self.max_message_size = bytes;
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn registry_mut(&mut self) -> &mut OperationRegistry {
        &mut self.registry
    }

    /// One cooperative scheduling step. Call from the host's main loop.
    pub fn poll(&mut self) {
        self.connection.poll();

        loop {
            let next = self.inbox.borrow_mut().pop_front();
            match next {
                Some(text) => self.handle_inbound(&text),
                None => break,
            }
        }

        self.poll_pending_confs();

        self.queue.set_gate_open(self.model.boot.is_accepted());
        self.queue.poll(&mut self.model, self.connection.as_mut());

        let online = self.connection.is_open();
        let last_recv = self.connection.last_recv_tick_ms();
        let queue_drained = !self.queue.has_in_flight()
            && self.queue.queued_len() == 0
            && self.pending_confs.is_empty();
        self.model.poll(online, last_recv, queue_drained);

        for request in self.model.take_outbox() {
            self.queue.push(request);
        }

        if self.model.take_cache_clear_request() {
            self.model.clear_cache_files();
            self.queue.clear_persistent();
        }

        self.model.cfg.save_dirty();
    }

    /// Drop queued outbound requests matching the predicate.
    pub fn drop_requests_if(&mut self, pred: &dyn Fn(&crate::rpc::Request) -> bool) {
        self.queue.drop_if(&mut self.model.req_store, pred);
    }

    // ── Inbound dispatch ───────────────────────────────────

    fn handle_inbound(&mut self, text: &str) {
        counter!("ocpp_messages_received_total").increment(1);

        if text.len() > self.max_message_size {
            warn!(
                len = text.len(),
                cap = self.max_message_size,
                "inbound message exceeds buffer cap"
            );
            let reply = Frame::buffer_exceeded(self.max_message_size, text.len());
            self.connection.send_text(&reply.serialize());
            return;
        }

        match Frame::parse(text) {
            Ok(Frame::Call {
                unique_id,
                action,
                payload,
            }) => self.handle_call(unique_id, action, payload),
            Ok(frame) => self.queue.handle_response(&mut self.model, frame),
            Err(e) => {
                warn!("malformed frame: {e}");
                let unique_id = salvage_unique_id(text).unwrap_or_default();
                let reply = Frame::error_response(
                    unique_id,
                    &RpcError::new(RpcErrorCode::FormationViolation, e.to_string()),
                );
                self.connection.send_text(&reply.serialize());
            }
        }
    }

    fn handle_call(&mut self, unique_id: String, action: String, payload: Value) {
        debug!(%action, %unique_id, "call received");

        if self.pending_confs.iter().any(|c| c.unique_id == unique_id) {
            warn!(%unique_id, "duplicate call id dropped");
            return;
        }

        let dispatched = self.registry.deserialize(&action);
        let mut call = InboundCall {
            unique_id,
            operation: dispatched.operation,
            on_response: dispatched.on_response,
            response: None,
        };

        match call.operation.process_req(&mut self.model, &payload) {
            Ok(()) => {
                if let Some(hook) = &dispatched.on_request {
                    hook(&payload);
                }
            }
            Err(err) => {
                call.response = Some(handler_error_frame(&call.unique_id, &err));
            }
        }
        self.pending_confs.push(call);
    }

    /// Build and send owed confirmations, preserving receipt order except
    /// for handlers that are still `Pending`. Back-pressure stops the
    /// drain for this tick.
    fn poll_pending_confs(&mut self) {
        for call in &mut self.pending_confs {
            if call.response.is_some() {
                continue;
            }
            match call.operation.create_conf(&mut self.model) {
                PollResult::Pending => {}
                PollResult::Ready(Ok(payload)) => {
                    if let Some(hook) = &call.on_response {
                        hook(&payload);
                    }
                    call.response = Some(Frame::CallResult {
                        unique_id: call.unique_id.clone(),
                        payload,
                    });
                }
                PollResult::Ready(Err(err)) => {
                    call.response = Some(handler_error_frame(&call.unique_id, &err));
                }
            }
        }

        let mut blocked = false;
        let connection = self.connection.as_mut();
        self.pending_confs.retain_mut(|call| {
            if blocked {
                return true;
            }
            let Some(frame) = &call.response else {
                return true;
            };
            if connection.send_text(&frame.serialize()) {
                false
            } else {
                blocked = true;
                true
            }
        });
    }
}

fn handler_error_frame(unique_id: &str, err: &HandlerError) -> Frame {
    Frame::CallError {
        unique_id: unique_id.to_string(),
        error_code: err.code.as_str().to_string(),
        error_description: err.description.clone(),
        error_details: err.details.clone(),
    }
}

/// Best-effort extraction of the unique id from a frame that failed strict
/// parsing, so the error reply can still be correlated.
fn salvage_unique_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let id = value.as_array()?.get(1)?.as_str()?;
    if id.len() <= crate::rpc::frame::MAX_UNIQUE_ID_LEN && id.is_ascii() {
        Some(id.to_string())
    } else {
        None
    }
}
