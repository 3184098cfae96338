//! Outbound packet delivery

use async_trait::async_trait;
use camlink_core::{CamLinkError, CoreResult, Packet};
use tokio::sync::mpsc;

/// Delivers control packets to a phone
///
/// The bridge does not own the connection; whatever carries packets to the
/// device implements this.
#[async_trait]
pub trait PacketSender: Send + Sync {
    /// Send one packet to `device_id`
    async fn send_packet(&self, device_id: &str, packet: Packet) -> CoreResult<()>;
}

/// A packet addressed to a device
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// Destination device
    pub device_id: String,
    /// Packet to deliver
    pub packet: Packet,
}

/// Forwards packets into a channel read by the transport
#[derive(Debug, Clone)]
pub struct ChannelPacketSender {
    tx: mpsc::UnboundedSender<OutboundPacket>,
}

impl ChannelPacketSender {
    /// Create a sender and the receiving end for the transport
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PacketSender for ChannelPacketSender {
    async fn send_packet(&self, device_id: &str, packet: Packet) -> CoreResult<()> {
        self.tx
            .send(OutboundPacket {
                device_id: device_id.to_string(),
                packet,
            })
            .map_err(|_| CamLinkError::Transport {
                reason: format!("outbound channel for {} closed", device_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::{PacketBody, StopRequest};

    #[tokio::test]
    async fn test_channel_sender_delivers_in_order() {
        let (sender, mut rx) = ChannelPacketSender::new();
        let stop = StopRequest {}.to_packet().unwrap();
        sender.send_packet("phone-1", stop.clone()).await.unwrap();
        sender.send_packet("phone-2", stop).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.device_id, "phone-1");
        assert_eq!(first.packet.packet_type, "cconnect.camera.stop");
        assert_eq!(rx.recv().await.unwrap().device_id, "phone-2");
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (sender, rx) = ChannelPacketSender::new();
        drop(rx);
        let err = sender
            .send_packet("phone-1", StopRequest {}.to_packet().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
    }
}
