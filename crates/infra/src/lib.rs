//! Infrastructure layer: stores, ledger, guard, publisher, saga, scheduler,
//! workers and the runtime that wires them together.

pub mod compensation;
pub mod config;
pub mod consumer;
pub mod idempotency;
pub mod ledger;
pub mod publisher;
pub mod replenishment;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod saga;
pub mod store;
pub mod sync;
pub mod workers;

pub use config::{ConfigError, InventoryConfig};
pub use ledger::StockLedger;
pub use runtime::{InventoryRuntime, MaintenanceReport};
