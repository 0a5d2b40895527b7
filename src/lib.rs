//! Cross-process multi-producer, multi-consumer event bus built on SysV
//! shared memory and semaphores.
//!
//! See `bus::EventBus` for the main entry point and `manager::EventBusManager`
//! for the asynchronous, batching producer wrapper.

pub mod bus;
pub mod cli;
pub mod error;
pub mod frame;
pub mod manager;
pub mod semlock;
pub mod shm;

pub use bus::EventBus;
pub use error::{BusError, Result};
pub use manager::EventBusManager;
