//! Tracing initialization.
//!
//! Centralizes tracing config so every binary behaves the same.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`, falling back to `default_directive`
///   (e.g. `"info"` or `"receiver=debug,info"`).
/// - ANSI color controlled by `ColorWhen`.
pub fn init_tracing(color: ColorWhen, default_directive: &str) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| anyhow!("invalid log directive {default_directive:?}: {e}"))?;

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
