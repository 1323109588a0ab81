//! FFI bindings for the native capture app
//!
//! This module provides the interface exposed via uniffi to Kotlin/Swift.

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
