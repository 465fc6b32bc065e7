//! Common infrastructure for hidlink
//!
//! This crate provides the pieces shared by the coordinator and both
//! transports: the report buffer pool, the bounded per-device input queue,
//! the persistent identity store, the upstream consumer interface with its
//! async channel bridge, logging setup, and test utilities.

pub mod buffer_pool;
pub mod channel;
pub mod error;
pub mod identity_store;
pub mod input_queue;
pub mod logging;
pub mod test_utils;

pub use buffer_pool::{BufferPool, PoolStats};
pub use channel::{ChannelConsumer, EventReceiver, HidConsumer, HidEvent, create_event_channel};
pub use error::{Error, Result};
pub use identity_store::IdentityStore;
pub use input_queue::InputQueue;
pub use logging::setup_logging;
