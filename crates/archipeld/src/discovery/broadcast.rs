//! HELLO announcements.

use std::sync::Arc;

use anyhow::Result;
use archipel_core::unix_millis;
use archipel_core::wire::{HelloBody, PacketType, RevocationBody};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;
use zerocopy::byteorder::{BigEndian, U16, U64};
use zerocopy::AsBytes;

use super::group_addr;
use crate::context::NodeContext;

pub fn hello_body(tcp_port: u16) -> HelloBody {
    HelloBody {
        tcp_port: U16::<BigEndian>::new(tcp_port),
        reserved: [0; 2],
        timestamp_ms: U64::<BigEndian>::new(unix_millis()),
    }
}

/// Send a signed HELLO every hello interval until shutdown.
pub async fn hello_loop(
    ctx: NodeContext,
    socket: Arc<UdpSocket>,
    tcp_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) {
    let dest = group_addr(&ctx.config.network);
    let period = ctx.config.network.hello_interval();
    let mut interval = time::interval(period);

    tracing::info!(%dest, tcp_port, interval_secs = period.as_secs(), "hello broadcast starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("hello broadcast shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let body = hello_body(tcp_port);
        let frame = match ctx.encode_plain(PacketType::Hello, body.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode HELLO");
                continue;
            }
        };
        match socket.send_to(&frame, dest).await {
            Ok(n) => tracing::trace!(bytes = n, "hello sent"),
            Err(e) => tracing::warn!(error = %e, "hello send failed"),
        }
    }
}

/// Multicast a revocation certificate once.
pub async fn send_revocation(ctx: &NodeContext, socket: &UdpSocket, body: &RevocationBody) -> Result<()> {
    let frame = ctx.encode_plain(PacketType::Revoke, body.as_bytes())?;
    socket.send_to(&frame, group_addr(&ctx.config.network)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_core::wire::read_body;

    #[test]
    fn hello_carries_port_and_clock() {
        let before = unix_millis();
        let body = hello_body(7777);
        let parsed: HelloBody = read_body(body.as_bytes()).unwrap();
        assert_eq!(parsed.tcp_port.get(), 7777);
        assert_eq!(parsed.reserved, [0, 0]);
        assert!(parsed.timestamp_ms.get() >= before);
    }
}
