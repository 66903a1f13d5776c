//! Duplicate request suppression.
//!
//! A mutating request is fingerprinted by client address and body. While the
//! fingerprint's sentinel lives in the shared backend, identical requests
//! from the same client are rejected with 429.

pub mod duplicate;

pub use duplicate::{DuplicateRequestGuard, GuardError, GuardMode, guard_key};
