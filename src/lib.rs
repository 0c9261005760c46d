//! Distributed mutual exclusion with fencing tokens, over pluggable
//! storage backends.
//!
//! This crate implements the lock protocol: acquire/release/extend/
//! `is_locked`/lookup, the invariants they preserve across concurrent
//! contenders and across backends with divergent transaction models,
//! the time-authority discipline that prevents clock-skew bugs, and
//! the fencing-token generator that guarantees strict monotonicity per
//! key.
//!
//! # Overview
//!
//! The core is a thin, backend-neutral contract ([`LockBackend`]) plus
//! three concrete backend implementations, each atop a different
//! storage substrate: a scripted in-memory store (Redis-shaped), a
//! relational database (`PostgreSQL`-shaped), and a document database
//! (Firestore-shaped). Every operation is a single atomic store
//! interaction -- one script execution or one transaction. There is no
//! cross-backend coordination and no in-process queuing.
//!
//! Auto-retry/backoff, telemetry decoration, disposal/RAII sugar,
//! configuration merging, and backend connection setup are treated as
//! external collaborators and are not implemented here.
//!
//! # Module Organization
//!
//! - [`contract`] - the [`LockBackend`] trait and configuration validation
//! - [`key`] - lock-ID generation and caller-key normalization/derivation
//! - [`time_authority`] - the liveness predicate and per-backend clock authority
//! - [`fence`] - fence-counter formatting, parsing, and overflow policy
//! - [`domain`] - persisted record shapes ([`LockRecord`], [`FenceCounter`])
//! - [`types`] - operation result types and the capabilities descriptor
//! - [`error`] - the shared error taxonomy
//! - [`backends`] - concrete backend implementations, each behind a feature flag

pub mod backends;
pub mod constants;
pub mod contract;
pub mod domain;
pub mod error;
pub mod fence;
pub mod key;
pub mod time_authority;
pub mod types;

pub use contract::{LockBackend, LookupBy};
pub use domain::{FenceCounter, LockRecord};
pub use error::LockError;
pub use types::{
    AcquireResult, BackendKind, Capabilities, ExtendResult, FailureReason, LockInfo,
    MutationOutcome, ReleaseResult,
};
