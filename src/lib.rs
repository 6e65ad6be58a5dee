//! # OCPP client runtime
//!
//! Charge-point-side implementation of OCPP-J 1.6 and 2.0.1. An EVSE embeds
//! the [`Context`] and ticks it from its main loop; the runtime turns
//! WebSocket frames and local events into correlated, ordered, retryable
//! and persistable OCPP operations.
//!
//! ## Layout
//!
//! - **support**: cross-cutting pieces (errors, clock, ids, `PollResult`)
//! - **storage**: filesystem adapter and the typed configuration registry
//! - **rpc**: OCPP-J framing, operation registry, request store and queue
//! - **model**: connectors, transactions, metering, boot, heartbeat and the
//!   feature services
//! - **operations**: per-action message classes (1.6 set, thin 2.0.1 set)
//! - **transport**: the `Connection` contract, a loopback and a
//!   tokio-tungstenite adapter
//! - **context**: the owner of all of the above and the single `poll()`

pub mod config;
pub mod context;
pub mod model;
pub mod operations;
pub mod rpc;
pub mod storage;
pub mod support;
pub mod transport;

// Re-export the embedding surface at the crate root.
pub use config::{default_config_path, AppConfig};
pub use context::Context;
pub use model::{
    BootData, ChargePointStatus, ErrorData, Model, ModelSetup, ProtocolVersion,
    RegistrationStatus, ResetKind, SampledValueSampler, SamplerProperties, StopReason,
    UnlockStatus,
};
pub use rpc::{Frame, OperationRegistry, Request, RequestQueue, RequestStore};
pub use storage::{FilesystemAdapter, MemFilesystem, SharedFilesystem, StdFilesystem};
pub use support::errors::{RpcError, RpcErrorCode, SetupError};
pub use support::poll::PollResult;
pub use support::time::{Clock, Timestamp};
pub use transport::{Connection, LoopbackConnection, WsConnection};
