//! Orders domain module.
//!
//! The order lifecycle as seen by the inventory side: the status state machine
//! driven by the saga, the inbound order-event wire format and the payloads the
//! saga emits. Pure domain logic (no IO, no storage).

pub mod inbound;
pub mod order;
pub mod stats;

pub use inbound::{OrderEvent, OrderEventKind};
pub use order::{
    ChangeStatus, CompensationEvent, Order, OrderItem, OrderStateChanged, OrderStatus,
};
pub use stats::OrderStats;
