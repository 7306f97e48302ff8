//! Canvascast broadcast server.
//!
//! Browsers connect over a WebSocket, negotiate a WebRTC session and either
//! publish their whiteboard canvas or just watch. Every inbound video track
//! is funnelled through one relay that re-times the stream and writes it to
//! a single shared outbound track subscribed by every connection.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod hub;
pub mod keyframe;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod webrtc_bridge;

pub use config::ServerConfig;
pub use hub::{BroadcastHub, HubSnapshot};
pub use keyframe::KeyframeScope;
pub use server::router;
pub use webrtc_bridge::WebRtcEngine;
