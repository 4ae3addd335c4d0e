//! Common types and abstractions
//!
//! - Stream: boxed connection every dial path returns
//! - Address: network address representation
//! - Error: unified error types

mod address;
mod stream;

pub use address::{Address, Network};
pub use stream::{Connection, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
