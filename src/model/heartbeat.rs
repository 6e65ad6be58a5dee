//! Idle-link heartbeats.
//!
//! A Heartbeat goes out every `HeartbeatInterval` seconds once the boot is
//! accepted. If the link just proved itself with any received message, the
//! due heartbeat is skipped as redundant.

use tracing::debug;

use super::ServiceCx;
use crate::operations::v16::heartbeat::Heartbeat;
use crate::rpc::Request;
use crate::storage::configuration::{ConfigHandle, ConfigService};

/// A message received this recently makes a due heartbeat redundant.
const RECENT_TRAFFIC_MS: u64 = 5_000;

pub struct HeartbeatService {
    interval: ConfigHandle,
    last_heartbeat_tick: u64,
    triggered: bool,
}

impl HeartbeatService {
    pub fn new(cfg: &ConfigService) -> Self {
        Self {
            interval: cfg.declare_int("HeartbeatInterval", 86400),
            last_heartbeat_tick: 0,
            triggered: false,
        }
    }

    /// Server-negotiated interval from BootNotification.conf.
    pub fn set_interval(&mut self, interval_s: i32) {
        if interval_s > 0 {
            self.interval.set_int(interval_s);
        }
    }

    pub fn trigger(&mut self) {
        self.triggered = true;
    }

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>) {
        let now = cx.clock.tick_ms();

        if self.triggered {
            self.triggered = false;
            self.last_heartbeat_tick = now;
            cx.outbox.push(
                Request::new(Box::new(Heartbeat::new(cx.version)))
                    .pre_boot_eligible()
                    .with_op_nr_hint(cx.req_store.op_end()),
            );
            return;
        }

        if !cx.boot_accepted {
            return;
        }
        let interval_ms = (self.interval.int().max(0) as u64) * 1000;
        if interval_ms == 0 {
            return;
        }
        if now.saturating_sub(self.last_heartbeat_tick) < interval_ms {
            return;
        }

        if cx.last_recv_tick > self.last_heartbeat_tick
            && now.saturating_sub(cx.last_recv_tick) < RECENT_TRAFFIC_MS
        {
            debug!("heartbeat skipped, link recently active");
            self.last_heartbeat_tick = now;
            return;
        }

        self.last_heartbeat_tick = now;
        cx.outbox.push(
            Request::new(Box::new(Heartbeat::new(cx.version)))
                .with_op_nr_hint(cx.req_store.op_end()),
        );
    }
}
