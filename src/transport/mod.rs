pub mod connection;
pub mod ws;

pub use connection::{Connection, LoopbackConnection, LoopbackShared, ReceiveCallback};
pub use ws::WsConnection;
