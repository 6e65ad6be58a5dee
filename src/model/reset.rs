//! Reset orchestration.
//!
//! A Reset request is confirmed immediately; running transactions are
//! stopped with the matching reason and the integrator's `execute_reset`
//! callback fires once the outbound queue drained (or a deadline passed,
//! so an offline charger still restarts).

use tracing::{error, info};

use super::connector::Connector;
use super::ServiceCx;
use crate::storage::configuration::{ConfigHandle, ConfigService};

/// How long to wait for queued messages before resetting anyway.
const RESET_DEADLINE_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

struct PendingReset {
    kind: ResetKind,
    issued_tick: u64,
}

type ResetHook = Box<dyn Fn(ResetKind)>;
type ResetVeto = Box<dyn Fn(ResetKind) -> bool>;

pub struct ResetService {
    execute_reset: Option<ResetHook>,
    pre_reset: Option<ResetVeto>,
    reset_retries: ConfigHandle,
    pending: Option<PendingReset>,
}

impl ResetService {
    pub fn new(cfg: &ConfigService) -> Self {
        Self {
            execute_reset: None,
            pre_reset: None,
            reset_retries: cfg.declare_int("ResetRetries", 1),
            pending: None,
        }
    }

    /// Host hook that actually restarts the process / device.
    pub fn set_execute_reset(&mut self, hook: ResetHook) {
        self.execute_reset = Some(hook);
    }

    /// Optional veto; `false` rejects the Reset request.
    pub fn set_pre_reset(&mut self, veto: ResetVeto) {
        self.pre_reset = Some(veto);
    }

    pub fn retry_budget(&self) -> i32 {
        self.reset_retries.int().max(0)
    }

    /// Accept (or veto) a Reset request. Stopping transactions is the
    /// caller's job; the service only tracks the shutdown.
    pub fn request(&mut self, kind: ResetKind, now_tick: u64) -> bool {
        if let Some(veto) = &self.pre_reset {
            if !veto(kind) {
                return false;
            }
        }
        info!(?kind, "reset scheduled");
        self.pending = Some(PendingReset {
            kind,
            issued_tick: now_tick,
        });
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>, connectors: &[Connector]) {
        let Some(pending) = &self.pending else {
            return;
        };
        let now = cx.clock.tick_ms();
        let tx_running = connectors.iter().any(|c| c.has_active_transaction());
        let deadline = now.saturating_sub(pending.issued_tick) >= RESET_DEADLINE_MS;
        if tx_running && !deadline {
            return;
        }
        if !cx.queue_drained && !deadline {
            return;
        }

        let kind = pending.kind;
        self.pending = None;
        match &self.execute_reset {
            Some(hook) => {
                info!(?kind, "executing reset");
                hook(kind);
            }
            None => error!("reset requested but no execute_reset hook installed"),
        }
    }
}
