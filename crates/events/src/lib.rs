//! Event mechanics shared by the inventory services.
//!
//! Domain crates define their own payloads and implement [`Event`]; this crate
//! only knows how to wrap them into [`BusMessage`]s and move them across a bus.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod message;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use message::{BusMessage, DeadLetter, MessageError, channels};
