//! Utilities for testing code that is built on the session engine. They are used for testing the
//!  engine itself, but they are also exported for application testing, which is why they are
//!  part of the crate's regular (non-#[cfg(test)]) code.

pub mod broker;
pub mod data_plane;
pub mod session;
