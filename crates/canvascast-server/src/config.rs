use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::keyframe::{KeyframeScope, DEFAULT_KEYFRAME_INTERVAL};
use crate::relay::DEFAULT_RELAY_QUEUE;
use crate::webrtc_bridge::DEFAULT_STUN_SERVER;

/// Runtime configuration of the broadcast server, independent of how it
/// was collected.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub stun_servers: Vec<String>,
    /// Static frontend served for every path the router does not handle.
    pub frontend_dir: Option<PathBuf>,
    pub keyframe_interval: Duration,
    pub keyframe_scope: KeyframeScope,
    /// Capacity of the queue between producer readers and the normalizer.
    pub relay_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            frontend_dir: None,
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
            keyframe_scope: KeyframeScope::default(),
            relay_queue: DEFAULT_RELAY_QUEUE,
        }
    }
}
