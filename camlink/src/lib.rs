//! # camlink - Phone camera as a desktop webcam
//!
//! camlink takes the H.264 stream a phone sends over an existing device
//! connection and exposes it as a V4L2 virtual camera that any desktop
//! application can open.
//!
//! ## Key Features
//!
//! - **Capability negotiation**: start requests are checked against what the
//!   phone announced before anything is sent
//! - **Decode-order enforcement**: configuration before keyframes, keyframes
//!   before deltas, resync after gaps and settings changes
//! - **Bounded recovery**: keyframe requests with backoff, then a limited
//!   number of stream restarts
//! - **Low-latency output**: small bounded queues that drop stale frames
//!   instead of blocking ingestion
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use camlink::{BridgeConfig, ChannelPacketSender, SessionRegistry, SystemMediaBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     camlink::init_logging()?;
//!
//!     let (sender, _outbound) = ChannelPacketSender::new();
//!     let registry = SessionRegistry::new(
//!         BridgeConfig::default().with_device("/dev/video10"),
//!         Arc::new(SystemMediaBackend),
//!         Arc::new(sender),
//!     )?;
//!
//!     // hand the outbound receiver to the transport, and feed it inbound packets with
//!     // `registry.handle_packet(device_id, packet, payload)`
//!     let mut events = registry.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {}", event.device_id, event.kind.event_type());
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod event;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types
pub use config::{BridgeConfig, SessionConfig};
pub use event::{SessionEvent, SessionEventKind};
pub use registry::SessionRegistry;
pub use session::{Inbound, SessionAction, SessionCore, SessionFailure, SessionSnapshot, SessionState};
pub use transport::{ChannelPacketSender, OutboundPacket, PacketSender};

// Re-export component crates
pub use camlink_core::{
    CamLinkError, CameraDescriptor, CapabilitySet, CoreResult, FrameHeader, FrameType,
    NegotiatedSettings, NegotiationError, Packet, PacketBody, Resolution, ResolutionPolicy,
    StatusReport, StreamRequest, StreamSettings, StreamingStatus,
};
pub use camlink_diagnostics::{init_logging, try_init_logging, StreamStats};
pub use camlink_media::{MediaBackend, MemorySink, SystemMediaBackend, VideoSink, WriterConfig};

/// Current version of camlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
