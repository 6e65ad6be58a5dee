pub mod frame;
pub mod queue;
pub mod registry;
pub mod request;
pub mod store;

pub use frame::{Frame, FrameError};
pub use queue::{RequestQueue, MAX_IN_FLIGHT};
pub use registry::OperationRegistry;
pub use request::{ErrorDisposition, Operation, Request, TimeoutPolicy};
pub use store::{RequestStore, StoredRequestRecord, MAX_OPNR};
