//! Shared pieces for Canvascast: signaling protocol, signaling channel,
//! error types and logging setup.
//!
//! Both the broadcast server and the pairing relay speak the same
//! `{"event", "data"}` envelope over a WebSocket, so everything that touches
//! that envelope lives here.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;
pub mod signaling;

pub use error::{Error, Result};
pub use protocol::*;
pub use signaling::SignalingChannel;

/// Initialize tracing. `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Reads a boolean switch from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Refuses non-loopback listen addresses unless `CANVASCAST_ALLOW_PUBLIC_BIND` is set.
pub fn check_public_bind_allowed(addr: std::net::SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() || env_bool("CANVASCAST_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(Error::config(format!(
        "refusing non-loopback bind {addr} without CANVASCAST_ALLOW_PUBLIC_BIND=1"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_bind_always_allowed() {
        assert!(check_public_bind_allowed("127.0.0.1:8080".parse().unwrap()).is_ok());
        assert!(check_public_bind_allowed("[::1]:8080".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_env_bool_default_when_unset() {
        assert!(env_bool("CANVASCAST_TEST_SWITCH_THAT_IS_NEVER_SET", true));
        assert!(!env_bool("CANVASCAST_TEST_SWITCH_THAT_IS_NEVER_SET", false));
    }
}
