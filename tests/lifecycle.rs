//! End-to-end lifecycle scenarios over the loopback transport.
//!
//! Each test drives a full `Context` with a scripted server on the other
//! end of a `LoopbackConnection`, a manual clock and the in-memory
//! filesystem, including reboot simulations via filesystem snapshots.
//!
//! The runtime keeps at most one Call in flight, so the scripted server
//! must confirm every Call it sees; routine StatusNotifications are
//! auto-confirmed, everything else is asserted explicitly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};

use ocpp_client::model::{ModelSetup, ReadingContext};
use ocpp_client::storage::adapter::SharedFilesystem;
use ocpp_client::transport::LoopbackShared;
use ocpp_client::{
    BootData, Clock, Context, FilesystemAdapter, LoopbackConnection, MemFilesystem,
    ProtocolVersion, SampledValueSampler, SamplerProperties, StopReason,
};

struct Harness {
    ctx: Context,
    server: Rc<LoopbackShared>,
    tick: Rc<RefCell<u64>>,
    fs: Rc<MemFilesystem>,
    plugged: Rc<Cell<bool>>,
    energy: Rc<Cell<i64>>,
    /// Calls observed but not yet handled by the scripted server.
    stash: Vec<Value>,
}

impl Harness {
    fn new() -> Self {
        Self::with_fs(Rc::new(MemFilesystem::new()))
    }

    fn with_fs(fs: Rc<MemFilesystem>) -> Self {
        let (connection, server) = LoopbackConnection::new();
        let tick = Rc::new(RefCell::new(0u64));
        let source = tick.clone();
        let clock = Clock::with_source(Box::new(move || *source.borrow()));

        let shared_fs: SharedFilesystem = fs.clone();
        let mut ctx = Context::with_clock(
            Box::new(connection),
            shared_fs,
            ModelSetup {
                version: ProtocolVersion::V16,
                connector_count: 1,
                boot_data: BootData::new("X", "Y"),
            },
            clock,
        )
        .expect("context builds");

        let plugged = Rc::new(Cell::new(false));
        let energy = Rc::new(Cell::new(0i64));
        {
            let plug = plugged.clone();
            ctx.model_mut()
                .connector_mut(1)
                .unwrap()
                .set_connector_plugged_input(Box::new(move || plug.get()));
        }
        {
            let meter = energy.clone();
            ctx.model_mut().metering_mut(1).unwrap().add_sampler(
                SampledValueSampler::new(
                    SamplerProperties::measurand("Energy.Active.Import.Register").with_unit("Wh"),
                    Box::new(move |_: ReadingContext| meter.get().to_string()),
                ),
            );
        }

        Self {
            ctx,
            server,
            tick,
            fs,
            plugged,
            energy,
            stash: Vec::new(),
        }
    }

    /// "Reboot": snapshot the filesystem and rebuild everything from it.
    fn reboot(self) -> Self {
        let dump = self.fs.dump();
        drop(self.ctx);
        Self::with_fs(Rc::new(MemFilesystem::restore(dump)))
    }

    fn poll_n(&mut self, n: usize) {
        for _ in 0..n {
            self.ctx.poll();
        }
    }

    fn advance_ms(&mut self, delta: u64) {
        let now = *self.tick.borrow() + delta;
        *self.tick.borrow_mut() = now;
        self.server.set_tick(now);
        self.poll_n(4);
    }

    fn tick_to(&mut self, tick_ms: u64) {
        *self.tick.borrow_mut() = tick_ms;
        self.server.set_tick(tick_ms);
        self.poll_n(4);
    }

    /// Stashed frames plus everything newly sent by the client.
    fn frames(&mut self) -> Vec<Value> {
        let mut frames = std::mem::take(&mut self.stash);
        frames.extend(
            self.server
                .take_outbound()
                .iter()
                .map(|text| serde_json::from_str::<Value>(text).expect("client sends valid JSON")),
        );
        frames
    }

    fn reply(&mut self, unique_id: &str, payload: Value) {
        self.server
            .push_inbound(json!([3, unique_id, payload]).to_string());
        self.poll_n(3);
    }

    /// Confirm routine notifications; stash everything else.
    fn route_frame(&mut self, frame: Value) {
        if frame[0] == 2 && frame[2] == "StatusNotification" {
            let id = frame[1].as_str().unwrap().to_string();
            self.reply(&id, json!({}));
        } else {
            self.stash.push(frame);
        }
    }

    /// Confirm pending StatusNotifications until the link is quiet.
    fn drain_notifications(&mut self) {
        for _ in 0..10 {
            let frames = self.frames();
            if frames.is_empty() {
                break;
            }
            let mut progressed = false;
            for frame in frames {
                if frame[0] == 2 && frame[2] == "StatusNotification" {
                    progressed = true;
                }
                self.route_frame(frame);
            }
            if !progressed {
                break;
            }
            self.poll_n(2);
        }
    }

    /// Wait for a Call of `action`, confirming it with `payload`; routine
    /// notifications on the way are auto-confirmed. Polls with advancing
    /// ticks so back-off periods elapse.
    fn expect_and_reply(&mut self, action: &str, payload: Value) -> Value {
        for _ in 0..300 {
            let frames = self.frames();
            let mut matched: Option<(String, Value)> = None;
            for frame in frames {
                if matched.is_none() && frame[0] == 2 && frame[2] == action {
                    matched = Some((
                        frame[1].as_str().unwrap().to_string(),
                        frame[3].clone(),
                    ));
                } else {
                    self.route_frame(frame);
                }
            }
            if let Some((id, request_payload)) = matched {
                self.reply(&id, payload);
                return request_payload;
            }
            self.advance_ms(1_000);
        }
        panic!("no {action} call observed");
    }

    /// Wait for the CallResult the client owes for `unique_id`.
    fn expect_conf(&mut self, unique_id: &str) -> Value {
        for _ in 0..50 {
            let frames = self.frames();
            let mut found = None;
            for frame in frames {
                if frame[0] == 3 && frame[1] == unique_id {
                    found = Some(frame[2].clone());
                } else if frame[0] == 2 {
                    self.route_frame(frame);
                }
            }
            if let Some(payload) = found {
                return payload;
            }
            self.poll_n(2);
        }
        panic!("no confirmation for {unique_id}");
    }

    /// Run the boot exchange to Accepted with the given heartbeat interval.
    fn boot_accepted(&mut self, interval: i64) {
        self.poll_n(4);
        let boot_payload = self.expect_and_reply_boot(interval);
        assert_eq!(boot_payload["chargePointVendor"], "X");
        assert_eq!(boot_payload["chargePointModel"], "Y");
        assert!(self.ctx.model().boot.is_accepted());
        self.drain_notifications();
    }

    fn expect_and_reply_boot(&mut self, interval: i64) -> Value {
        self.expect_and_reply(
            "BootNotification",
            json!({
                "status": "Accepted",
                "currentTime": "2024-06-01T12:00:00.000Z",
                "interval": interval,
            }),
        )
    }

    /// Authorize a tag online and confirm it.
    fn authorize_accepted(&mut self, id_tag: &str) {
        assert!(self.ctx.model_mut().begin_authorization(1, id_tag));
        self.poll_n(3);
        let auth_payload =
            self.expect_and_reply("Authorize", json!({ "idTagInfo": { "status": "Accepted" } }));
        assert_eq!(auth_payload["idTag"], id_tag);
        self.drain_notifications();
    }

    fn op_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .fs
            .dump()
            .keys()
            .filter(|k| k.starts_with("op-"))
            .cloned()
            .collect();
        files.sort();
        files
    }
}

// ── S1: happy transaction ──────────────────────────────────────

#[test]
fn happy_transaction_lifecycle() {
    let mut h = Harness::new();
    h.boot_accepted(60);
    h.ctx
        .model()
        .cfg
        .get("MeterValueSampleInterval")
        .unwrap()
        .set_int(60);

    h.authorize_accepted("TAG01");
    h.plugged.set(true);
    h.poll_n(4);

    let start_payload = h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 42, "idTagInfo": { "status": "Accepted" } }),
    );
    assert_eq!(start_payload["connectorId"], 1);
    assert_eq!(start_payload["idTag"], "TAG01");
    assert_eq!(start_payload["meterStart"], 0);
    assert!(start_payload["timestamp"].as_str().unwrap().ends_with('Z'));
    h.drain_notifications();

    // After 65 s both a Heartbeat and a MeterValues go out.
    h.energy.set(1200);
    h.tick_to(65_000);
    let hb_payload = h.expect_and_reply(
        "Heartbeat",
        json!({ "currentTime": "2024-06-01T12:01:05.000Z" }),
    );
    assert_eq!(hb_payload, json!({}));
    let mv_payload = h.expect_and_reply("MeterValues", json!({}));
    assert_eq!(mv_payload["connectorId"], 1);
    assert_eq!(mv_payload["transactionId"], 42);
    assert_eq!(
        mv_payload["meterValue"][0]["sampledValue"][0]["value"],
        "1200"
    );

    // Local stop.
    h.energy.set(5000);
    h.ctx
        .model_mut()
        .connector_mut(1)
        .unwrap()
        .end_transaction(StopReason::Local, None);
    h.poll_n(4);
    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    assert_eq!(stop_payload["transactionId"], 42);
    assert_eq!(stop_payload["meterStop"], 5000);
    assert_eq!(stop_payload["reason"], "Local");

    // Everything settled: no pending operation or transaction records.
    h.drain_notifications();
    h.poll_n(4);
    assert!(h.op_files().is_empty());
    assert_eq!(h.ctx.model().req_store.pending_count(), 0);
    assert!(!h.fs.dump().keys().any(|k| k.starts_with("tx-")));
}

// ── S2: offline stop, delivered after reconnect ────────────────

#[test]
fn offline_stop_delivered_in_order() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.ctx
        .model()
        .cfg
        .get("MeterValueSampleInterval")
        .unwrap()
        .set_int(35);

    h.authorize_accepted("TAG01");
    h.plugged.set(true);
    h.poll_n(4);
    h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 42, "idTagInfo": { "status": "Accepted" } }),
    );
    h.drain_notifications();

    // Sever the link; a sample and the stop happen while offline.
    h.server.set_open(false);
    let t0 = *h.tick.borrow();
    h.energy.set(900);
    h.tick_to(t0 + 36_000);
    h.energy.set(1000);
    h.ctx
        .model_mut()
        .connector_mut(1)
        .unwrap()
        .end_transaction(StopReason::Local, None);
    h.tick_to(t0 + 40_000);

    // Both operations are persisted with consecutive numbers.
    let files = h.op_files();
    assert_eq!(
        files.len(),
        2,
        "MeterValues and StopTransaction persisted: {files:?}"
    );
    assert_eq!(h.ctx.model().req_store.pending_count(), 2);

    // Restore the transport; both are delivered in order, the stop with
    // the server-assigned transaction id.
    h.tick_to(t0 + 120_000);
    h.server.set_open(true);
    let mv_payload = h.expect_and_reply("MeterValues", json!({}));
    assert_eq!(mv_payload["transactionId"], 42);
    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    assert_eq!(stop_payload["transactionId"], 42);
    assert_eq!(h.ctx.model().req_store.pending_count(), 0);
}

// ── S3: boot Pending gates all other traffic ───────────────────

#[test]
fn boot_pending_gates_traffic() {
    let mut h = Harness::new();
    // A status change queues a StatusNotification before boot completes.
    h.plugged.set(true);
    h.poll_n(4);

    let mut boots = 0;
    for window in 0..5u64 {
        let frames = h.frames();
        for frame in &frames {
            assert_eq!(frame[0], 2, "unexpected outbound frame: {frame}");
            assert_eq!(
                frame[2], "BootNotification",
                "only BootNotification may leave pre-boot: {frame}"
            );
            boots += 1;
            let id = frame[1].as_str().unwrap().to_string();
            h.server
                .push_inbound(json!([3, id, { "status": "Pending", "interval": 5 }]).to_string());
        }
        h.tick_to((window + 1) * 5_000);
    }
    assert!(
        boots >= 4,
        "boot retries spaced by the server interval, got {boots}"
    );

    // Accepted: the parked StatusNotification flushes immediately.
    let boot_payload = h.expect_and_reply_boot(60);
    assert_eq!(boot_payload["chargePointVendor"], "X");
    h.poll_n(2);
    let frames = h.frames();
    let status = frames
        .iter()
        .find(|f| f[0] == 2 && f[2] == "StatusNotification")
        .expect("queued StatusNotification flushes after Accepted");
    assert_eq!(status[3]["status"], "Preparing");
}

// ── S4: reset mid-transaction ──────────────────────────────────

#[test]
fn reset_stops_transaction_without_duplicates() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.authorize_accepted("TAG01");
    h.plugged.set(true);
    h.poll_n(4);
    h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 17, "idTagInfo": { "status": "Accepted" } }),
    );
    h.drain_notifications();

    let reset_fired = Rc::new(Cell::new(false));
    {
        let fired = reset_fired.clone();
        h.ctx
            .model_mut()
            .reset
            .set_execute_reset(Box::new(move |_| fired.set(true)));
    }

    h.server
        .push_inbound(json!([2, "r-1", "Reset", { "type": "Soft" }]).to_string());
    h.poll_n(3);
    let conf = h.expect_conf("r-1");
    assert_eq!(conf["status"], "Accepted");

    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    assert_eq!(stop_payload["reason"], "SoftReset");
    assert_eq!(stop_payload["transactionId"], 17);

    // Queue drains, then the host hook fires.
    h.drain_notifications();
    h.advance_ms(2_000);
    assert!(reset_fired.get());

    // After restart no duplicate StopTransaction is emitted.
    let mut h = h.reboot();
    h.boot_accepted(3600);
    h.advance_ms(10_000);
    let frames = h.frames();
    assert!(
        !frames.iter().any(|f| f[0] == 2 && f[2] == "StopTransaction"),
        "no duplicate StopTransaction after restart"
    );
}

// ── S5: operation number wrap ──────────────────────────────────

#[test]
fn op_nr_wraps_across_the_window() {
    let fs = Rc::new(MemFilesystem::new());
    fs.write("client-state.jsn", r#"{"opBegin":9998,"opEnd":9998}"#)
        .unwrap();
    let mut h = Harness::with_fs(fs);
    h.boot_accepted(3600);
    h.ctx
        .model()
        .cfg
        .get("MeterValueSampleInterval")
        .unwrap()
        .set_int(35);
    h.authorize_accepted("TAG01");

    // Offline from here: all three operations pile up in the store.
    h.server.set_open(false);
    h.plugged.set(true);
    let t0 = *h.tick.borrow();
    h.poll_n(4);
    h.tick_to(t0 + 36_000);
    h.ctx
        .model_mut()
        .connector_mut(1)
        .unwrap()
        .end_transaction(StopReason::Local, None);
    h.tick_to(t0 + 40_000);

    let files = h.op_files();
    assert!(files.contains(&"op-9998.jsn".to_string()), "{files:?}");
    assert!(files.contains(&"op-9999.jsn".to_string()), "{files:?}");
    assert!(files.contains(&"op-0.jsn".to_string()), "{files:?}");

    // Confirm in order; opBegin walks 9998 → 9999 → 0 → 1.
    h.server.set_open(true);
    assert_eq!(h.ctx.model().req_store.op_begin(), 9998);
    h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 7, "idTagInfo": { "status": "Accepted" } }),
    );
    assert_eq!(h.ctx.model().req_store.op_begin(), 9999);
    h.expect_and_reply("MeterValues", json!({}));
    assert_eq!(h.ctx.model().req_store.op_begin(), 0);
    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    // The id arrived after the stop was persisted and was back-filled.
    assert_eq!(stop_payload["transactionId"], 7);
    assert_eq!(h.ctx.model().req_store.op_begin(), 1);
}

// ── S6: orphan opEnd repair ────────────────────────────────────

#[test]
fn orphan_op_end_repaired_on_boot() {
    let fs = Rc::new(MemFilesystem::new());
    fs.write("client-state.jsn", r#"{"opBegin":98,"opEnd":101}"#)
        .unwrap();
    fs.write(
        "op-98.jsn",
        r#"{"opNr":98,"action":"MeterValues","payload":{"connectorId":1}}"#,
    )
    .unwrap();
    fs.write(
        "op-99.jsn",
        r#"{"opNr":99,"action":"MeterValues","payload":{"connectorId":1}}"#,
    )
    .unwrap();
    // op-100 was reserved but never committed (crash in between).

    let h = Harness::with_fs(fs);
    assert_eq!(h.ctx.model().req_store.op_begin(), 98);
    assert_eq!(h.ctx.model().req_store.op_end(), 100);
    assert!(h.ctx.model().req_store.fetch(98).is_some());
    assert!(h.ctx.model().req_store.fetch(99).is_some());
}

// ── Reboot mid-transaction recovery ────────────────────────────

#[test]
fn reboot_recovers_transaction_and_meter_data() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.ctx
        .model()
        .cfg
        .get("MeterValueSampleInterval")
        .unwrap()
        .set_int(35);
    h.authorize_accepted("TAG01");
    h.plugged.set(true);
    h.poll_n(4);
    h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 42, "idTagInfo": { "status": "Accepted" } }),
    );
    h.drain_notifications();

    // Power loss while charging, with an undelivered sample.
    h.server.set_open(false);
    let t0 = *h.tick.borrow();
    h.tick_to(t0 + 36_000);
    assert_eq!(h.ctx.model().req_store.pending_count(), 1);

    let mut h = h.reboot();
    // The pending MeterValues survives with its operation number and the
    // interrupted transaction is closed with reason Reboot.
    h.boot_accepted(3600);

    let mv_payload = h.expect_and_reply("MeterValues", json!({}));
    assert_eq!(mv_payload["transactionId"], 42);
    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    assert_eq!(stop_payload["transactionId"], 42);
    assert_eq!(stop_payload["reason"], "Reboot");
}

// ── Framing edge cases through the full stack ──────────────────

#[test]
fn oversized_message_answered_with_generic_error() {
    let mut h = Harness::new();
    let big = format!(
        r#"[2,"big","Heartbeat",{{"filler":"{}"}}]"#,
        "x".repeat(20_000)
    );
    let len = big.len();
    h.server.push_inbound(big);
    h.poll_n(2);
    let frames = h.frames();
    let err = frames
        .iter()
        .find(|f| f[0] == 4)
        .expect("oversized message answered");
    assert_eq!(err[2], "GenericError");
    assert_eq!(err[4]["msg_length"], len);
}

#[test]
fn unknown_response_id_dropped_silently() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.server
        .push_inbound(json!([3, "no-such-call", {}]).to_string());
    h.poll_n(3);
    assert!(h.frames().is_empty());
}

#[test]
fn unknown_action_answered_not_implemented() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.server
        .push_inbound(json!([2, "q-1", "FluxCapacitorStatus", {}]).to_string());
    h.poll_n(2);
    let frames = h.frames();
    let err = frames.iter().find(|f| f[0] == 4).expect("CallError sent");
    assert_eq!(err[1], "q-1");
    assert_eq!(err[2], "NotImplemented");
}

// ── Configuration over the wire ────────────────────────────────

#[test]
fn change_and_get_configuration() {
    let mut h = Harness::new();
    h.boot_accepted(3600);

    h.server.push_inbound(
        json!([2, "c-1", "ChangeConfiguration", { "key": "HeartbeatInterval", "value": "120" }])
            .to_string(),
    );
    h.poll_n(2);
    assert_eq!(h.expect_conf("c-1")["status"], "Accepted");

    h.server.push_inbound(
        json!([2, "c-2", "GetConfiguration", { "key": ["HeartbeatInterval", "NoSuchKey"] }])
            .to_string(),
    );
    h.poll_n(2);
    let conf = h.expect_conf("c-2");
    assert_eq!(conf["configurationKey"][0]["key"], "HeartbeatInterval");
    assert_eq!(conf["configurationKey"][0]["value"], "120");
    assert_eq!(conf["unknownKey"][0], "NoSuchKey");
}

#[test]
fn outbound_data_transfer_delivers_response() {
    let mut h = Harness::new();
    h.boot_accepted(3600);

    let seen = Rc::new(RefCell::new(None::<Value>));
    {
        let seen = seen.clone();
        h.ctx.model_mut().send_data_transfer(
            "com.example",
            Some("ping"),
            Some(json!({"n": 1})),
            Some(Box::new(move |payload| {
                *seen.borrow_mut() = Some(payload.clone());
            })),
        );
    }
    h.poll_n(3);
    let request_payload = h.expect_and_reply(
        "DataTransfer",
        json!({ "status": "Accepted", "data": { "pong": 1 } }),
    );
    assert_eq!(request_payload["vendorId"], "com.example");
    assert_eq!(request_payload["messageId"], "ping");
    assert_eq!(request_payload["data"]["n"], 1);

    let seen = seen.borrow();
    assert_eq!(seen.as_ref().unwrap()["status"], "Accepted");
}

// ── Remote control ─────────────────────────────────────────────

#[test]
fn remote_start_and_stop() {
    let mut h = Harness::new();
    h.boot_accepted(3600);
    h.plugged.set(true);
    h.poll_n(2);
    h.drain_notifications();

    h.server.push_inbound(
        json!([2, "rs-1", "RemoteStartTransaction", { "idTag": "REMOTE01", "connectorId": 1 }])
            .to_string(),
    );
    h.poll_n(3);
    assert_eq!(h.expect_conf("rs-1")["status"], "Accepted");

    let start_payload = h.expect_and_reply(
        "StartTransaction",
        json!({ "transactionId": 9, "idTagInfo": { "status": "Accepted" } }),
    );
    assert_eq!(start_payload["idTag"], "REMOTE01");
    h.drain_notifications();

    h.server.push_inbound(
        json!([2, "rs-2", "RemoteStopTransaction", { "transactionId": 9 }]).to_string(),
    );
    h.poll_n(3);
    assert_eq!(h.expect_conf("rs-2")["status"], "Accepted");

    let stop_payload = h.expect_and_reply("StopTransaction", json!({}));
    assert_eq!(stop_payload["reason"], "Remote");
    assert_eq!(stop_payload["transactionId"], 9);
}
