//! Outgoing-call orchestration.
//!
//! The queue owns every outbound Call from creation to its terminal event
//! and keeps at most one in flight. Tail requests live either in memory
//! (volatile FIFO) or as operation-number references into the request store
//! (persistent tail); both sides implement [`RequestEmitter`] and the queue
//! picks whichever front is oldest in wrap-aware operation-number order.

use std::collections::VecDeque;

use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::model::Model;
use crate::rpc::frame::Frame;
use crate::rpc::request::{ErrorDisposition, Operation, Request, TimeoutPolicy};
use crate::rpc::store::{precedes, RequestStore, StoredRequestRecord};
use crate::support::errors::{RpcError, RpcErrorCode};
use crate::support::poll::PollResult;
use crate::transport::Connection;

/// Per-queue in-flight cap; the serialization invariant of the protocol.
pub const MAX_IN_FLIGHT: usize = 1;

const BACKOFF_INITIAL_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 64_000;

/// Rebuilds an operation from its stored record after a reboot.
pub type OperationRestorer = Box<dyn Fn(&StoredRequestRecord) -> Option<Box<dyn Operation>>>;

/// A source of queued requests. The queue polls emitters round-robin in
/// stable order and takes the front with the smallest wrap-aware distance
/// to `opEnd`.
trait RequestEmitter {
    fn front_op_nr(&self, store: &RequestStore) -> Option<u32>;
    fn fetch_front(
        &mut self,
        store: &mut RequestStore,
        restorer: &OperationRestorer,
    ) -> Option<Request>;
}

// ── Volatile FIFO ──────────────────────────────────────────────

#[derive(Default)]
struct VolatileQueue {
    items: VecDeque<Request>,
}

impl VolatileQueue {
    /// Index of the next sendable request. With the pre-boot gate closed,
    /// non-eligible requests stay parked in order and are skipped.
    fn eligible_index(&self, gate_open: bool) -> Option<usize> {
        if gate_open {
            if self.items.is_empty() {
                None
            } else {
                Some(0)
            }
        } else {
            self.items.iter().position(|r| r.is_pre_boot_eligible())
        }
    }
}

impl RequestEmitter for VolatileQueue {
    fn front_op_nr(&self, _store: &RequestStore) -> Option<u32> {
        self.items.front().map(|r| r.op_nr_hint())
    }

    fn fetch_front(
        &mut self,
        _store: &mut RequestStore,
        _restorer: &OperationRestorer,
    ) -> Option<Request> {
        self.items.pop_front()
    }
}

// ── Persistent tail ────────────────────────────────────────────

/// The window `[opBegin, opEnd)` of the request store, fronted by the live
/// `Request` objects created this session. Entries without a live object
/// (after a reboot) are rebuilt from their stored records on fetch.
#[derive(Default)]
struct PersistentTail {
    live: VecDeque<Request>,
}

impl PersistentTail {
    fn window_contains(store: &RequestStore, op_nr: u32) -> bool {
        let begin = store.op_begin();
        let span = store.pending_count();
        (op_nr + crate::rpc::store::MAX_OPNR - begin) % crate::rpc::store::MAX_OPNR < span
    }
}

impl RequestEmitter for PersistentTail {
    fn front_op_nr(&self, store: &RequestStore) -> Option<u32> {
        (store.pending_count() > 0).then(|| store.op_begin())
    }

    fn fetch_front(
        &mut self,
        store: &mut RequestStore,
        restorer: &OperationRestorer,
    ) -> Option<Request> {
        // Discard live objects whose records were dropped underneath them.
        while let Some(front) = self.live.front() {
            match front.op_nr() {
                Some(nr) if Self::window_contains(store, nr) => break,
                _ => {
                    let mut dropped = self.live.pop_front().unwrap();
                    dropped.notify_abort();
                }
            }
        }

        while store.pending_count() > 0 {
            let nr = store.op_begin();
            if self.live.front().and_then(|r| r.op_nr()) == Some(nr) {
                return self.live.pop_front();
            }
            match store.fetch(nr) {
                Some(record) => match restorer(&record) {
                    Some(operation) => {
                        debug!(op_nr = nr, action = %record.action, "restored stored request");
                        return Some(Request::persistent(operation, nr));
                    }
                    None => {
                        warn!(op_nr = nr, action = %record.action, "stored request not restorable, skipped");
                        store.advance(nr);
                    }
                },
                None => {
                    // A hole at the window head; advance past it.
                    store.advance(nr);
                }
            }
        }
        None
    }
}

// ── In-flight state ────────────────────────────────────────────

struct InFlight {
    request: Request,
    sent: bool,
    first_sent_tick: Option<u64>,
    /// Milliseconds of believed-healthy transport since the first send
    /// (offline-sensitive timeout accounting).
    online_elapsed_ms: u64,
    last_seen_tick: u64,
}

// ── Queue ──────────────────────────────────────────────────────

pub struct RequestQueue {
    volatile: VolatileQueue,
    persistent: PersistentTail,
    head: Option<InFlight>,
    backoff_period_ms: u64,
    backoff_until: u64,
    gate_open: bool,
    drop_head: bool,
    prefer_volatile: bool,
    restorer: OperationRestorer,
}

impl RequestQueue {
    pub fn new(restorer: OperationRestorer) -> Self {
        Self {
            volatile: VolatileQueue::default(),
            persistent: PersistentTail::default(),
            head: None,
            backoff_period_ms: BACKOFF_INITIAL_MS,
            backoff_until: 0,
            gate_open: false,
            drop_head: false,
            prefer_volatile: false,
            restorer,
        }
    }

    /// Pre-boot gate. Closed until BootNotification is Accepted; only
    /// pre-boot-eligible requests are transmitted while closed.
    pub fn set_gate_open(&mut self, open: bool) {
        if open && !self.gate_open {
            info!("post-boot communication activated");
        }
        self.gate_open = open;
    }

    pub fn is_gate_open(&self) -> bool {
        self.gate_open
    }

    pub fn push(&mut self, request: Request) {
        trace!(action = request.action(), persistent = request.is_persistent(), "request enqueued");
        if request.is_persistent() {
            self.persistent.live.push_back(request);
        } else {
            self.volatile.items.push_back(request);
        }
    }

    pub fn has_in_flight(&self) -> bool {
        self.head.as_ref().is_some_and(|h| h.sent)
    }

    pub fn queued_len(&self) -> usize {
        self.volatile.items.len() + self.persistent.live.len()
    }

    /// Drop queued requests matching the predicate. A matching head is only
    /// marked; the actual drop is deferred to its next completion point.
    pub fn drop_if(&mut self, store: &mut RequestStore, pred: &dyn Fn(&Request) -> bool) {
        let mut kept = VecDeque::new();
        for mut request in self.volatile.items.drain(..) {
            if pred(&request) {
                request.notify_abort();
            } else {
                kept.push_back(request);
            }
        }
        self.volatile.items = kept;

        let mut kept = VecDeque::new();
        for mut request in self.persistent.live.drain(..) {
            if pred(&request) {
                if let Some(nr) = request.op_nr() {
                    store.advance(nr);
                }
                request.notify_abort();
            } else {
                kept.push_back(request);
            }
        }
        self.persistent.live = kept;

        if let Some(head) = &self.head {
            if pred(&head.request) {
                self.drop_head = true;
            }
        }
    }

    /// Forget all live persistent requests (their records were cleared).
    pub fn clear_persistent(&mut self) {
        self.persistent.live.clear();
    }

    /// One scheduling step: pick a head if none, then drive send/timeout.
    pub fn poll(&mut self, model: &mut Model, connection: &mut dyn Connection) {
        let now = model.clock.tick_ms();
        let online = connection.is_open();

        if self.head.is_none() {
            self.select_next(model);
        }
        self.update_timeout(model, online, now);
        if self.head.as_ref().is_some_and(|h| !h.sent) {
            self.try_send(model, connection, now);
        }
    }

    fn select_next(&mut self, model: &mut Model) {
        let (volatile_idx, volatile_nr, persistent_nr, end) = {
            let store = &model.req_store;
            let idx = self.volatile.eligible_index(self.gate_open);
            let v_nr = idx.map(|i| self.volatile.items[i].op_nr_hint());
            let p_nr = if self.gate_open {
                self.persistent.front_op_nr(store)
            } else {
                None
            };
            (idx, v_nr, p_nr, store.op_end())
        };

        let choose_persistent = match (volatile_nr, persistent_nr) {
            (None, None) => return,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some(v), Some(p)) => {
                if precedes(p, v, end) {
                    true
                } else if precedes(v, p, end) {
                    false
                } else {
                    // Same age: alternate for fairness.
                    self.prefer_volatile = !self.prefer_volatile;
                    !self.prefer_volatile
                }
            }
        };

        let request = if choose_persistent {
            self.persistent
                .fetch_front(&mut model.req_store, &self.restorer)
        } else {
            volatile_idx.and_then(|i| self.volatile.items.remove(i))
        };

        if let Some(request) = request {
            self.head = Some(InFlight {
                request,
                sent: false,
                first_sent_tick: None,
                online_elapsed_ms: 0,
                last_seen_tick: model.clock.tick_ms(),
            });
        }
    }

    fn try_send(&mut self, model: &mut Model, connection: &mut dyn Connection, now: u64) {
        if now < self.backoff_until {
            return;
        }

        let abandon = self.drop_head
            || self
                .head
                .as_ref()
                .is_some_and(|h| h.request.operation().should_abandon(model));
        if abandon {
            let mut in_flight = self.head.take().unwrap();
            if let Some(nr) = in_flight.request.op_nr() {
                model.req_store.advance(nr);
            }
            in_flight.request.notify_abort();
            self.drop_head = false;
            debug!(action = in_flight.request.action(), "queued request abandoned");
            return;
        }

        let head = self.head.as_mut().unwrap();
        let payload = match head.request.operation_mut().create_req(model) {
            PollResult::Ready(payload) => payload,
            // Handler not ready; release the transport turn for this tick.
            PollResult::Pending => return,
        };

        let unique_id = head.request.ensure_message_id().to_string();
        let frame = Frame::Call {
            unique_id,
            action: head.request.action().to_string(),
            payload,
        };

        if connection.send_text(&frame.serialize()) {
            let first_send = head.first_sent_tick.is_none();
            head.sent = true;
            head.first_sent_tick.get_or_insert(now);
            head.last_seen_tick = now;
            self.backoff_period_ms = BACKOFF_INITIAL_MS;
            self.backoff_until = 0;
            counter!("ocpp_calls_sent_total").increment(1);
            trace!(action = head.request.action(), "call sent");
            if first_send {
                head.request.operation_mut().on_sent(model);
            }
        } else {
            self.backoff_until = now + self.backoff_period_ms;
            self.backoff_period_ms = (self.backoff_period_ms * 2).min(BACKOFF_MAX_MS);
            counter!("ocpp_send_backoffs_total").increment(1);
            debug!(
                action = head.request.action(),
                backoff_ms = self.backoff_period_ms,
                "transport rejected send, backing off"
            );
        }
    }

    fn update_timeout(&mut self, model: &mut Model, online: bool, now: u64) {
        let Some(head) = self.head.as_mut() else {
            return;
        };
        if !head.sent {
            head.last_seen_tick = now;
            return;
        }

        let expired = match head.request.timeout() {
            TimeoutPolicy::Fixed(window) => {
                now.saturating_sub(head.first_sent_tick.unwrap_or(now)) >= window
            }
            TimeoutPolicy::OfflineSensitive(window) => {
                if online {
                    head.online_elapsed_ms += now.saturating_sub(head.last_seen_tick);
                }
                head.last_seen_tick = now;
                head.online_elapsed_ms >= window
            }
        };
        if !expired {
            return;
        }

        counter!("ocpp_call_timeouts_total").increment(1);

        if head.request.is_persistent() {
            // At-least-once delivery: go around again with the same id.
            warn!(action = head.request.action(), "persistent request timed out, resending");
            head.sent = false;
            head.online_elapsed_ms = 0;
            head.request.notify_timeout();
            return;
        }

        let mut in_flight = self.head.take().unwrap();
        warn!(action = in_flight.request.action(), "request timed out");
        in_flight.request.notify_timeout();
        match in_flight
            .request
            .complete_err(model, &RpcError::timeout())
        {
            ErrorDisposition::Retry if !self.drop_head => {
                in_flight.sent = false;
                self.head = Some(in_flight);
            }
            _ => {
                self.drop_head = false;
            }
        }
    }

    /// Route an inbound CallResult / CallError to the in-flight request.
    pub fn handle_response(&mut self, model: &mut Model, frame: Frame) {
        let unique_id = frame.unique_id().to_string();
        let matched = self
            .head
            .as_ref()
            .is_some_and(|h| h.sent && h.request.message_id() == Some(unique_id.as_str()));
        if !matched {
            debug!(%unique_id, "response without matching in-flight call dropped");
            counter!("ocpp_unmatched_responses_total").increment(1);
            return;
        }

        match frame {
            Frame::CallResult { payload, .. } => {
                let mut in_flight = self.head.take().unwrap();
                in_flight.request.complete_conf(model, &payload);
                if let Some(nr) = in_flight.request.op_nr() {
                    model.req_store.advance(nr);
                }
                self.drop_head = false;
                counter!("ocpp_call_results_total").increment(1);
            }
            Frame::CallError {
                error_code,
                error_description,
                error_details,
                ..
            } => {
                let mut in_flight = self.head.take().unwrap();
                let error = RpcError {
                    code: RpcErrorCode::from_wire(&error_code),
                    description: error_description,
                    details: error_details,
                };
                warn!(action = in_flight.request.action(), %error, "call failed");
                counter!("ocpp_call_errors_total").increment(1);
                match in_flight.request.complete_err(model, &error) {
                    ErrorDisposition::Abort => {
                        if let Some(nr) = in_flight.request.op_nr() {
                            model.req_store.advance(nr);
                        }
                        self.drop_head = false;
                    }
                    ErrorDisposition::Retry => {
                        if self.drop_head {
                            if let Some(nr) = in_flight.request.op_nr() {
                                model.req_store.advance(nr);
                            }
                            in_flight.request.notify_abort();
                            self.drop_head = false;
                        } else {
                            in_flight.sent = false;
                            self.head = Some(in_flight);
                        }
                    }
                }
            }
            Frame::Call { .. } => {
                warn!("incoming Call routed to response correlator, dropped");
            }
        }
    }
}
