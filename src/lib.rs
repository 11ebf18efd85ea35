pub mod auth;
pub mod batch;
pub mod ble;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exporter;
pub mod failed;
pub mod learner;
pub mod link;
pub mod pdu;
pub mod registers;
pub mod store;
pub mod timing;
pub mod transport;

#[cfg(test)]
mod mock_link;

pub use auth::{AuthGate, ProtectedRange};
pub use ble::{BleLink, discover_devices};
pub use config::InverterConfig;
pub use coordinator::{
    ConnectionState, Coordinator, CycleReport, Diagnostics, InverterHandle, PollUpdate, Reading,
};
pub use error::{Error, Result};
pub use pdu::{Decoded, FunctionCode, Pdu};
pub use registers::{RegisterDescriptor, RegisterTable, Value};
pub use store::{JsonFileStore, StateStore};
pub use timing::OpKind;
