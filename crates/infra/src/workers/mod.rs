//! Background workers draining bus channels.

pub mod pool;

pub use pool::{MessageHandler, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
