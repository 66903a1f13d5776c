//! Core types shared by the groupcast coordination layer.
//!
//! The server crate builds its cache coordinator, duplicate-request guard and
//! group broadcaster on top of the [`SharedBackend`] trait defined here. Two
//! implementations exist: [`MemoryBackend`] (single process, also used to
//! simulate a fleet in tests) and the Redis backend in `groupcast-server`.

pub mod backend;
pub mod error;
pub mod id;
pub mod memory;
pub mod request;

pub use backend::{SharedBackend, Subscription, SubscriptionId};
pub use error::{BackendError, Result};
pub use id::generate_id;
pub use memory::MemoryBackend;
pub use request::{RequestDescriptor, normalize_query};
