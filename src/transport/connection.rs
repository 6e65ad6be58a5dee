//! Transport contract consumed by the core.
//!
//! The core never opens sockets; it ticks a [`Connection`], pushes text
//! frames into it and receives text frames through the registered callback.
//! All methods must be non-blocking. Binary and fragmented frames are not
//! supported.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Inbound path. Returning `false` lets the transport count a failed
/// receive (e.g. the consumer's inbox is full).
pub type ReceiveCallback = Box<dyn FnMut(&[u8]) -> bool>;

pub trait Connection {
    /// Tick the transport: progress handshakes, drain socket buffers,
    /// deliver received frames through the callback.
    fn poll(&mut self);

    /// Non-blocking send attempt; `false` on back-pressure or closed link.
    fn send_text(&mut self, text: &str) -> bool;

    fn set_receive_cb(&mut self, cb: ReceiveCallback);

    /// Tick of the last successfully received frame; lets the heartbeat
    /// skip redundant pings.
    fn last_recv_tick_ms(&self) -> u64;

    /// Whether the link is believed healthy (offline-sensitive timeouts
    /// pause while it is not).
    fn is_open(&self) -> bool;
}

// ── Loopback ───────────────────────────────────────────────────

/// Test-side handle of a [`LoopbackConnection`]: the "server" end.
pub struct LoopbackShared {
    open: Cell<bool>,
    tick: Cell<u64>,
    last_recv_tick: Cell<u64>,
    inbound: RefCell<VecDeque<String>>,
    outbound: RefCell<Vec<String>>,
}

impl LoopbackShared {
    /// Deliver a frame from the simulated server.
    pub fn push_inbound(&self, text: impl Into<String>) {
        self.inbound.borrow_mut().push_back(text.into());
    }

    /// Everything the client sent since the last call.
    pub fn take_outbound(&self) -> Vec<String> {
        std::mem::take(&mut self.outbound.borrow_mut())
    }

    pub fn set_open(&self, open: bool) {
        self.open.set(open);
    }

    /// Advance the transport's notion of time (same domain as the test
    /// clock).
    pub fn set_tick(&self, tick_ms: u64) {
        self.tick.set(tick_ms);
    }
}

/// In-memory transport for tests and offline development.
pub struct LoopbackConnection {
    shared: Rc<LoopbackShared>,
    recv_cb: Option<ReceiveCallback>,
}

impl LoopbackConnection {
    pub fn new() -> (Self, Rc<LoopbackShared>) {
        let shared = Rc::new(LoopbackShared {
            open: Cell::new(true),
            tick: Cell::new(0),
            last_recv_tick: Cell::new(0),
            inbound: RefCell::new(VecDeque::new()),
            outbound: RefCell::new(Vec::new()),
        });
        (
            Self {
                shared: shared.clone(),
                recv_cb: None,
            },
            shared,
        )
    }
}

impl Connection for LoopbackConnection {
    fn poll(&mut self) {
        if !self.shared.open.get() {
            return;
        }
        loop {
            let next = self.shared.inbound.borrow_mut().pop_front();
            let Some(text) = next else {
                break;
            };
            if let Some(cb) = &mut self.recv_cb {
                if cb(text.as_bytes()) {
                    self.shared.last_recv_tick.set(self.shared.tick.get());
                } else {
                    // Consumer refused; put it back and retry next tick.
                    self.shared.inbound.borrow_mut().push_front(text);
                    break;
                }
            }
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        if !self.shared.open.get() {
            return false;
        }
        self.shared.outbound.borrow_mut().push(text.to_string());
        true
    }

    fn set_receive_cb(&mut self, cb: ReceiveCallback) {
        self.recv_cb = Some(cb);
    }

    fn last_recv_tick_ms(&self) -> u64 {
        self.shared.last_recv_tick.get()
    }

    fn is_open(&self) -> bool {
        self.shared.open.get()
    }
}
