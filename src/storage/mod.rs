pub mod adapter;
pub mod configuration;
pub mod memory;

pub use adapter::{FilesystemAdapter, SharedFilesystem, StdFilesystem};
pub use configuration::{ConfigHandle, ConfigService, ConfigValue};
pub use memory::MemFilesystem;

/// Names of everything the runtime persists, under one root prefix.
pub mod files {
    /// Durable configuration container (peer-visible keys).
    pub const CONFIG_FN: &str = "ocpp-config.jsn";
    /// Internal key/values: `opBegin`, `opEnd`, per-connector state.
    pub const CLIENT_STATE_FN: &str = "client-state.jsn";
    /// Slot-indexed reservation records.
    pub const RESERVATIONS_FN: &str = "reservations.jsn";
    /// Local authorization list.
    pub const AUTH_LIST_FN: &str = "auth-list.jsn";

    pub fn op_file(op_nr: u32) -> String {
        format!("op-{op_nr}.jsn")
    }

    pub fn tx_file(connector_id: u32, tx_nr: u32) -> String {
        format!("tx-{connector_id}-{tx_nr}.jsn")
    }

    pub fn sd_file(connector_id: u32, tx_nr: u32, seq: u32) -> String {
        format!("sd-{connector_id}-{tx_nr}-{seq}.jsn")
    }
}
