//! # Utility Modules
//!
//! Supporting utilities shared by the protocol engine and the transaction cache.
//!
//! ## Components
//! - **Expiration Queue**: age-ordered keyed queue with TTL sweeps
//! - **Scheduler**: cooperative alarm registry with cancellable handles
//! - **Time**: clock abstraction (system and manual)
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: structured logging configuration

pub mod expiration_queue;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod time;

pub use expiration_queue::ExpirationQueue;
pub use scheduler::{AlarmQueue, Scheduler, TimerEvent, TimerHandle};
pub use time::{Clock, ManualClock, SystemClock};
