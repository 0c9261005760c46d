//! Concrete [`crate::LockBackend`] implementations, one per supported
//! storage substrate. Each lives behind its own Cargo feature so a
//! caller who only needs one backend doesn't pull in the others'
//! client libraries.

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

#[cfg(feature = "firestore-backend")]
pub mod firestore;
