//! CLI-related shared utilities.
//!
//! Centralizes CLI policy so binaries don't duplicate behavior.

mod color;

pub use color::ColorWhen;
