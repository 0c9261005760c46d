//! The static capabilities descriptor a backend exposes to callers.

use serde::{Deserialize, Serialize};

use crate::time_authority::TimeAuthority;

/// Which concrete backend a [`crate::LockBackend`] instance wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ScriptedStore,
    Relational,
    DocumentStore,
}

/// A static, per-backend-instance record describing what the backend
/// supports and which clock it trusts.
///
/// # Examples
///
/// ```
/// use lockguard::{BackendKind, Capabilities};
/// use lockguard::time_authority::TimeAuthority;
///
/// let caps = Capabilities {
///     backend: BackendKind::ScriptedStore,
///     supports_fencing: true,
///     time_authority: TimeAuthority::Server,
/// };
/// assert!(caps.supports_fencing);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub backend: BackendKind,
    /// All three backends described here support fencing.
    pub supports_fencing: bool,
    pub time_authority: TimeAuthority,
}
