//! Logging setup
//!
//! Library code only emits `tracing` events. Applications and demos call
//! [`init_logging`] once to install a formatted subscriber.

use crate::config::LoggingConfig;
use peerlink_core::{PeerLinkError, PeerLinkResult};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `config.default_directive`.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> PeerLinkResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_directive).map_err(|e| {
            PeerLinkError::invalid_param(format!(
                "log directive '{}': {}",
                config.default_directive, e
            ))
        })?,
    };

    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig {
            default_directive: "peerlink=debug".to_string(),
            ..LoggingConfig::default()
        };
        let _ = init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
