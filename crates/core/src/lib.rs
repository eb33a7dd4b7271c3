//! `stockwise-core`: identifiers, the error taxonomy and aggregate traits.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy shared by every service, and the aggregate
//! traits the stock and order models implement.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, execute};
pub use error::{ErrorKind, InventoryError, InventoryResult};
pub use id::{EventId, OrderId, ProductId, ReplenishmentOrderId};
