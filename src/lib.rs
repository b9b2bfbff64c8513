//! Trust-layer injection for container images.
//!
//! Drives the external layer, volume, and container tools to replace a
//! previously injected certificate layer with a freshly built one.

pub mod command;
pub mod config;
pub mod error;
pub mod injector;

pub use error::{InjectError, Result};
