//! Wire/result-shaped types returned by [`crate::LockBackend`]
//! operations.

pub mod capabilities;
pub mod result;

pub use capabilities::*;
pub use result::*;
