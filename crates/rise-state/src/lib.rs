//! Message bus and advisory lock backends.
//!
//! Rise services coordinate through two primitives:
//!
//! - a [`MessageBus`] carrying work queues (at-least-once delivery with a
//!   visibility timeout) and fan-out event publication to named exchanges
//!   with routing keys;
//! - a [`LockBackend`] handing out non-blocking advisory locks bound to a
//!   logical resource such as a project.
//!
//! In-memory backends back the test suites; the Postgres backends back
//! production. Lock guards release on drop, so a lock never outlives the
//! scope that acquired it, whatever the exit path.

#![forbid(unsafe_code)]

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "postgres")]
mod postgres;

pub use error::{BusError, LockError};
pub use traits::{LockBackend, LockOps, MessageBus};
pub use types::{LockGuard, Message, MessageId, PublishedEvent};

#[cfg(feature = "memory")]
pub use memory::{MemoryBus, MemoryLockProvider};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresBus, PostgresLock};
