//! # Repository Module
//!
//! Repository implementations for buffer storage access.
//!
//! ## The Repository Pattern
//! Each repository wraps the pool and exposes typed operations for one
//! table. Mutating operations run inside a single transaction together
//! with their audit event, so a crash mid-operation leaves the store in
//! either the pre- or post-state, never partial.
//!
//! - [`receipt`] - Active receipt buffer (insert, state machine, batches)
//! - [`dead_letter`] - Receipts that exhausted their retry budget
//! - [`event`] - Append-only audit log

pub mod dead_letter;
pub mod event;
pub mod receipt;
