//! Sampled and clock-aligned metering.
//!
//! Integrators register [`SampledValueSampler`]s; CSV configuration keys
//! select which of them feed the periodic, clock-aligned and
//! StopTransaction builders. Samples taken during a transaction fork into
//! the transaction's meter data record.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::meter_store::{remove_tx_meter_data, TransactionMeterData};
use super::transaction::Transaction;
use super::ServiceCx;
use crate::operations::v16::meter_values::MeterValues;
use crate::storage::adapter::SharedFilesystem;
use crate::storage::configuration::{ConfigHandle, ConfigService};
use crate::support::time::{Clock, Timestamp};

/// The measurand every charge point must supply for `meterStart` /
/// `meterStop`.
pub const ENERGY_MEASURAND: &str = "Energy.Active.Import.Register";

// ── Reading contexts ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingContext {
    InterruptionBegin,
    InterruptionEnd,
    Other,
    SampleClock,
    SamplePeriodic,
    TransactionBegin,
    TransactionEnd,
    Trigger,
}

impl ReadingContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterruptionBegin => "Interruption.Begin",
            Self::InterruptionEnd => "Interruption.End",
            Self::Other => "Other",
            Self::SampleClock => "Sample.Clock",
            Self::SamplePeriodic => "Sample.Periodic",
            Self::TransactionBegin => "Transaction.Begin",
            Self::TransactionEnd => "Transaction.End",
            Self::Trigger => "Trigger",
        }
    }
}

// ── Wire shapes ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Timestamped group of sampled values. The timestamp stays in its
/// possibly-relative form until wire rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: Timestamp,
    pub sampled_value: Vec<SampledValue>,
}

impl MeterValue {
    pub fn render(&self, clock: &Clock) -> Value {
        json!({
            "timestamp": clock.render(&self.timestamp),
            "sampledValue": serde_json::to_value(&self.sampled_value)
                .unwrap_or_else(|_| Value::Array(Vec::new())),
        })
    }
}

// ── Samplers ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SamplerProperties {
    pub measurand: String,
    pub phase: Option<String>,
    pub location: Option<String>,
    pub unit: Option<String>,
    pub format: Option<String>,
}

impl SamplerProperties {
    pub fn measurand(measurand: &str) -> Self {
        Self {
            measurand: measurand.to_string(),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }
}

/// Integrator-supplied reading source for one measurand.
pub struct SampledValueSampler {
    properties: SamplerProperties,
    read: Box<dyn Fn(ReadingContext) -> String>,
}

impl SampledValueSampler {
    pub fn new(properties: SamplerProperties, read: Box<dyn Fn(ReadingContext) -> String>) -> Self {
        Self { properties, read }
    }

    pub fn measurand(&self) -> &str {
        &self.properties.measurand
    }

    fn take(&self, context: ReadingContext) -> SampledValue {
        SampledValue {
            value: (self.read)(context),
            context: Some(context.as_str().to_string()),
            format: self.properties.format.clone(),
            measurand: Some(self.properties.measurand.clone()),
            phase: self.properties.phase.clone(),
            location: self.properties.location.clone(),
            unit: self.properties.unit.clone(),
        }
    }
}

// ── Builder ────────────────────────────────────────────────────

/// Resolves a CSV measurand selection against the registered samplers.
/// Re-reads the selection when the configuration entry changes.
struct MeterValueBuilder {
    select: ConfigHandle,
    tracked_revision: Option<u16>,
    mask: Vec<usize>,
}

impl MeterValueBuilder {
    fn new(select: ConfigHandle) -> Self {
        Self {
            select,
            tracked_revision: None,
            mask: Vec::new(),
        }
    }

    fn refresh(&mut self, samplers: &[SampledValueSampler]) {
        let revision = self.select.write_count();
        if self.tracked_revision == Some(revision) {
            return;
        }
        self.tracked_revision = Some(revision);
        self.mask.clear();
        let csv = self.select.string();
        for name in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match samplers.iter().position(|s| s.measurand() == name) {
                Some(idx) => self.mask.push(idx),
                None => debug!(measurand = name, "no sampler registered, selection ignored"),
            }
        }
    }

    fn build(
        &mut self,
        samplers: &[SampledValueSampler],
        context: ReadingContext,
        timestamp: Timestamp,
    ) -> Option<MeterValue> {
        self.refresh(samplers);
        if self.mask.is_empty() {
            return None;
        }
        Some(MeterValue {
            timestamp,
            sampled_value: self.mask.iter().map(|&i| samplers[i].take(context)).collect(),
        })
    }
}

// ── Per-connector metering ─────────────────────────────────────

pub struct MeteringConnector {
    connector_id: u32,
    fs: SharedFilesystem,
    samplers: Vec<SampledValueSampler>,
    energy_sampler: Option<usize>,

    sampled_builder: MeterValueBuilder,
    aligned_builder: MeterValueBuilder,
    stop_sampled_builder: MeterValueBuilder,
    stop_aligned_builder: MeterValueBuilder,

    sample_interval: ConfigHandle,
    aligned_interval: ConfigHandle,
    in_tx_only: ConfigHandle,
    stop_capture_periodic: ConfigHandle,

    last_sample_tick: Option<u64>,
    next_aligned: Option<DateTime<Utc>>,
    stop_txn_data: Option<TransactionMeterData>,
    track_tx_running: bool,
    triggered: bool,
}

impl MeteringConnector {
    pub fn new(connector_id: u32, fs: SharedFilesystem, cfg: &ConfigService) -> Self {
        Self {
            connector_id,
            fs,
            samplers: Vec::new(),
            energy_sampler: None,
            sampled_builder: MeterValueBuilder::new(cfg.declare_string("MeterValuesSampledData", ENERGY_MEASURAND)),
            aligned_builder: MeterValueBuilder::new(cfg.declare_string("MeterValuesAlignedData", "")),
            stop_sampled_builder: MeterValueBuilder::new(cfg.declare_string("StopTxnSampledData", "")),
            stop_aligned_builder: MeterValueBuilder::new(cfg.declare_string("StopTxnAlignedData", "")),
            sample_interval: cfg.declare_int("MeterValueSampleInterval", 0),
            aligned_interval: cfg.declare_int("ClockAlignedDataInterval", 0),
            in_tx_only: cfg.declare_bool("MeterValuesInTxOnly", true),
            stop_capture_periodic: cfg.declare_bool("StopTxnDataCapturePeriodic", false),
            last_sample_tick: None,
            next_aligned: None,
            stop_txn_data: None,
            track_tx_running: false,
            triggered: false,
        }
    }

    /// TriggerMessage(MeterValues): emit one sample on the next poll.
    pub fn trigger(&mut self) {
        self.triggered = true;
    }

    pub fn add_sampler(&mut self, sampler: SampledValueSampler) {
        if sampler.measurand() == ENERGY_MEASURAND {
            self.energy_sampler = Some(self.samplers.len());
        }
        self.samplers.push(sampler);
    }

    pub fn has_sampler(&self, measurand: &str) -> bool {
        self.samplers.iter().any(|s| s.measurand() == measurand)
    }

    /// Integer reading of the energy register, for meterStart / meterStop.
    pub fn read_energy(&self, context: ReadingContext) -> Option<i32> {
        let idx = self.energy_sampler?;
        let raw = (self.samplers[idx].read)(context);
        match raw.trim().parse::<f64>() {
            Ok(value) => Some(value.round() as i32),
            Err(_) => {
                warn!(connector_id = self.connector_id, value = %raw, "energy reading not numeric");
                None
            }
        }
    }

    // ── Transaction hooks (driven by the connector) ────────

    pub fn begin_tx(&mut self, clock: &Clock, tx_nr: u32) {
        let mut data = TransactionMeterData::restore(&self.fs, self.connector_id, tx_nr);
        if let Some(mv) = self.stop_sampled_builder.build(
            &self.samplers,
            ReadingContext::TransactionBegin,
            clock.timestamp(),
        ) {
            data.add(&self.fs, mv);
        }
        self.stop_txn_data = Some(data);
        self.last_sample_tick = Some(clock.tick_ms());
    }

    /// Close the record and return everything collected, for the
    /// StopTransaction payload.
    pub fn end_tx(&mut self, clock: &Clock, tx_nr: u32) -> Vec<MeterValue> {
        let mut data = match self.stop_txn_data.take() {
            Some(data) if data.tx_nr() == tx_nr => data,
            _ => TransactionMeterData::restore(&self.fs, self.connector_id, tx_nr),
        };
        if let Some(mv) = self.stop_sampled_builder.build(
            &self.samplers,
            ReadingContext::TransactionEnd,
            clock.timestamp(),
        ) {
            data.add(&self.fs, mv);
        }
        self.last_sample_tick = None;
        data.finalize()
    }

    /// Drop the record without reporting it (silent transaction).
    pub fn abort_tx(&mut self, tx_nr: u32) {
        self.stop_txn_data = None;
        self.last_sample_tick = None;
        remove_tx_meter_data(&self.fs, self.connector_id, tx_nr);
    }

    /// The StopTransaction record now carries the data; the batch files
    /// can go.
    pub fn purge_tx_files(&self, tx_nr: u32) {
        remove_tx_meter_data(&self.fs, self.connector_id, tx_nr);
    }

    // ── Sampling drivers ───────────────────────────────────

    pub fn poll(&mut self, cx: &mut ServiceCx<'_>, tx: Option<&Rc<RefCell<Transaction>>>) {
        let tx_running = tx.is_some_and(|t| {
            let t = t.borrow();
            t.active && t.running && !t.silent
        });

        if tx_running != self.track_tx_running {
            self.track_tx_running = tx_running;
            self.last_sample_tick = Some(cx.clock.tick_ms());
        }

        if self.triggered {
            self.triggered = false;
            self.take_triggered(cx, tx);
        }

        self.poll_periodic(cx, tx, tx_running);
        self.poll_aligned(cx, tx, tx_running);
    }

    fn poll_periodic(
        &mut self,
        cx: &mut ServiceCx<'_>,
        tx: Option<&Rc<RefCell<Transaction>>>,
        tx_running: bool,
    ) {
        let interval_s = self.sample_interval.int();
        if interval_s <= 0 {
            return;
        }
        let sampling_enabled = tx_running || !self.in_tx_only.boolean();
        if !sampling_enabled {
            self.last_sample_tick = None;
            return;
        }

        let now = cx.clock.tick_ms();
        let last = *self.last_sample_tick.get_or_insert(now);
        if now.saturating_sub(last) < interval_s as u64 * 1000 {
            return;
        }
        self.last_sample_tick = Some(now);

        let timestamp = cx.clock.timestamp();
        if let Some(mv) = self.sampled_builder.build(
            &self.samplers,
            ReadingContext::SamplePeriodic,
            timestamp,
        ) {
            self.emit(cx, tx.filter(|_| tx_running), mv);
        }
        if tx_running && self.stop_capture_periodic.boolean() {
            if let Some(mv) = self.stop_sampled_builder.build(
                &self.samplers,
                ReadingContext::SamplePeriodic,
                timestamp,
            ) {
                if let Some(data) = self.stop_txn_data.as_mut() {
                    data.add(&self.fs, mv);
                }
            }
        }
    }

    fn poll_aligned(
        &mut self,
        cx: &mut ServiceCx<'_>,
        tx: Option<&Rc<RefCell<Transaction>>>,
        tx_running: bool,
    ) {
        let interval_s = self.aligned_interval.int();
        if interval_s <= 0 {
            self.next_aligned = None;
            return;
        }
        let Some(now) = cx.clock.now() else {
            return;
        };
        let boundary = match self.next_aligned {
            Some(b) => b,
            None => {
                let b = next_aligned_boundary(now, interval_s as u32);
                self.next_aligned = Some(b);
                return;
            }
        };
        if now < boundary {
            return;
        }
        self.next_aligned = Some(next_aligned_boundary(now, interval_s as u32));

        let sampling_enabled = tx_running || !self.in_tx_only.boolean();
        let timestamp = Timestamp::Absolute(boundary);
        if sampling_enabled {
            if let Some(mv) =
                self.aligned_builder
                    .build(&self.samplers, ReadingContext::SampleClock, timestamp)
            {
                self.emit(cx, tx.filter(|_| tx_running), mv);
            }
        }
        if tx_running {
            if let Some(mv) = self.stop_aligned_builder.build(
                &self.samplers,
                ReadingContext::SampleClock,
                timestamp,
            ) {
                if let Some(data) = self.stop_txn_data.as_mut() {
                    data.add(&self.fs, mv);
                }
            }
        }
    }

    /// One immediate sample, pre-boot eligible.
    fn take_triggered(&mut self, cx: &mut ServiceCx<'_>, tx: Option<&Rc<RefCell<Transaction>>>) {
        let timestamp = cx.clock.timestamp();
        if let Some(mv) =
            self.sampled_builder
                .build(&self.samplers, ReadingContext::Trigger, timestamp)
        {
            let tx_nr = bound_tx_nr(tx);
            let op = MeterValues::new(cx.version, self.connector_id, tx_nr, vec![mv]);
            cx.outbox.push(
                crate::rpc::Request::new(Box::new(op))
                    .pre_boot_eligible()
                    .with_op_nr_hint(cx.req_store.op_end()),
            );
        }
    }

    /// Route a sample: transaction-bound values are persisted with an
    /// operation number; idle samples go out best-effort.
    fn emit(&mut self, cx: &mut ServiceCx<'_>, tx: Option<&Rc<RefCell<Transaction>>>, mv: MeterValue) {
        let tx_nr = bound_tx_nr(tx);
        let payload = MeterValues::render_payload(
            cx.version,
            cx.clock,
            self.connector_id,
            tx.and_then(|t| t.borrow().transaction_id),
            &[mv.clone()],
        );
        let op = MeterValues::new(cx.version, self.connector_id, tx_nr, vec![mv]);
        match tx_nr {
            Some(tx_nr) => {
                super::push_persistent_request(
                    cx,
                    Box::new(op),
                    "MeterValues",
                    payload,
                    Some(self.connector_id),
                    Some(tx_nr),
                );
            }
            None => cx.outbox.push(
                crate::rpc::Request::new(Box::new(op)).with_op_nr_hint(cx.req_store.op_end()),
            ),
        }
    }
}

/// Transaction binding of a sample. A not-yet-confirmed transaction still
/// binds: operation-number order delivers the sample after its
/// StartTransaction.
fn bound_tx_nr(tx: Option<&Rc<RefCell<Transaction>>>) -> Option<u32> {
    let tx = tx?.borrow();
    if tx.silent || !(tx.active || tx.accepts_meter_values()) {
        None
    } else {
        Some(tx.tx_nr)
    }
}

/// Next multiple of `interval_s` seconds past midnight UTC.
fn next_aligned_boundary(now: DateTime<Utc>, interval_s: u32) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let since = now.num_seconds_from_midnight();
    let periods = since / interval_s + 1;
    midnight + Duration::seconds((periods * interval_s) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::time::parse_iso;

    #[test]
    fn aligned_boundary_math() {
        let now = parse_iso("2024-06-01T10:17:30.000Z").unwrap();
        let next = next_aligned_boundary(now, 900);
        assert_eq!(next, parse_iso("2024-06-01T10:30:00.000Z").unwrap());

        let now = parse_iso("2024-06-01T23:59:59.000Z").unwrap();
        let next = next_aligned_boundary(now, 3600);
        assert_eq!(next, parse_iso("2024-06-02T00:00:00.000Z").unwrap());
    }

    #[test]
    fn builder_follows_csv_selection() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let cfg = ConfigService::new(fs.clone());
        let select = cfg.declare_string("MeterValuesSampledData", ENERGY_MEASURAND);
        let mut builder = MeterValueBuilder::new(select.clone());

        let samplers = vec![
            SampledValueSampler::new(
                SamplerProperties::measurand(ENERGY_MEASURAND).with_unit("Wh"),
                Box::new(|_| "1500".to_string()),
            ),
            SampledValueSampler::new(
                SamplerProperties::measurand("Power.Active.Import").with_unit("W"),
                Box::new(|_| "7000".to_string()),
            ),
        ];

        let mv = builder
            .build(&samplers, ReadingContext::SamplePeriodic, Timestamp::Relative { tick_ms: 0 })
            .unwrap();
        assert_eq!(mv.sampled_value.len(), 1);
        assert_eq!(mv.sampled_value[0].value, "1500");

        // Selection change is picked up via the write count.
        select.set_string(format!("{ENERGY_MEASURAND},Power.Active.Import"));
        let mv = builder
            .build(&samplers, ReadingContext::SamplePeriodic, Timestamp::Relative { tick_ms: 0 })
            .unwrap();
        assert_eq!(mv.sampled_value.len(), 2);
        assert_eq!(mv.sampled_value[1].value, "7000");

        // Empty selection silences the builder.
        select.set_string("");
        assert!(builder
            .build(&samplers, ReadingContext::SamplePeriodic, Timestamp::Relative { tick_ms: 0 })
            .is_none());
    }

    #[test]
    fn energy_reading_parses_numeric() {
        let fs: SharedFilesystem = Rc::new(crate::storage::MemFilesystem::new());
        let cfg = ConfigService::new(fs.clone());
        let mut metering = MeteringConnector::new(1, fs, &cfg);
        metering.add_sampler(SampledValueSampler::new(
            SamplerProperties::measurand(ENERGY_MEASURAND).with_unit("Wh"),
            Box::new(|_| "1234.6".to_string()),
        ));
        assert_eq!(metering.read_energy(ReadingContext::Other), Some(1235));
    }
}
