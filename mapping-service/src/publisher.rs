//! UDP egress for rendered outbound messages.
//!
//! Frames use the same `topic \0 payload` layout as ingress, so a broker
//! bridge can forward them unchanged.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::codec;
use crate::outbound::OutboundMessage;
use crate::topic;

pub struct UdpPublisher {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpPublisher {
    /// Bind an ephemeral local socket of the same address family as `target`.
    pub async fn bind(target: SocketAddr) -> std::io::Result<Self> {
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send every message as one frame; returns how many were sent.
    /// Messages whose topic still holds a wildcard have no concrete
    /// destination and are skipped.
    pub async fn publish(&self, messages: &[OutboundMessage]) -> usize {
        let mut sent = 0;
        for message in messages {
            if topic::is_wildcard(&message.topic) {
                warn!(mapping = %message.mapping_id, topic = %message.topic, "unresolved publish topic, not sent");
                continue;
            }
            let payload = match serde_json::to_vec(&message.payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(mapping = %message.mapping_id, error = %e, "outbound payload not serialisable");
                    continue;
                }
            };
            let frame = codec::encode(&message.topic, &payload);
            match self.socket.send_to(&frame, self.target).await {
                Ok(_) => {
                    debug!(mapping = %message.mapping_id, topic = %message.topic, "outbound message published");
                    sent += 1;
                }
                Err(e) => warn!(addr = %self.target, error = %e, "UDP send_to error"),
            }
        }
        sent
    }
}
