//! Byte stream over an SSH channel
//!
//! russh's own `ChannelStream` only sends EOF on shutdown and nothing on
//! drop, so a relayed channel would stay open on the server. Instead each
//! channel is pumped by a task that owns it and sends CHANNEL_CLOSE exactly
//! once, as soon as the local end is shut down or dropped.

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Buffer between the local stream and the pump task
const BRIDGE_BUFFER: usize = 32 * 1024;

/// What the channel delivered
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    Eof,
    Closed,
}

/// The operations the pump needs from a channel
#[async_trait]
pub(crate) trait ChannelEnd: Send + 'static {
    /// Next data or state change from the far side
    async fn next_inbound(&mut self) -> Inbound;

    /// Send bytes to the far side
    async fn send(&mut self, data: &[u8]) -> Result<(), russh::Error>;

    /// Send CHANNEL_CLOSE
    async fn close_channel(&mut self);
}

#[async_trait]
impl ChannelEnd for Channel<Msg> {
    async fn next_inbound(&mut self) -> Inbound {
        loop {
            match self.wait().await {
                Some(ChannelMsg::Data { data }) => return Inbound::Data(data.to_vec()),
                Some(ChannelMsg::Eof) => return Inbound::Eof,
                Some(ChannelMsg::Close) | None => return Inbound::Closed,
                // Window adjustments, exit status and the like
                Some(_) => {}
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), russh::Error> {
        self.data(data).await
    }

    async fn close_channel(&mut self) {
        if let Err(e) = self.close().await {
            tracing::debug!("Failed to close channel {}: {}", self.id(), e);
        }
    }
}

/// Turn `channel` into a stream, spawning the task that pumps it
pub(crate) fn bridge<C: ChannelEnd>(channel: C) -> DuplexStream {
    let (local, pumped) = tokio::io::duplex(BRIDGE_BUFFER);
    tokio::spawn(pump(channel, pumped));
    local
}

async fn pump<C: ChannelEnd>(mut channel: C, stream: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; BRIDGE_BUFFER];
    let mut far_side_sending = true;

    loop {
        tokio::select! {
            inbound = channel.next_inbound(), if far_side_sending => match inbound {
                Inbound::Data(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Inbound::Eof => {
                    let _ = writer.shutdown().await;
                    far_side_sending = false;
                }
                Inbound::Closed => break,
            },
            read = reader.read(&mut buf) => match read {
                // Local end shut down or dropped
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = channel.send(&buf[..n]).await {
                        tracing::debug!("Channel write failed: {}", e);
                        break;
                    }
                }
            },
        }
    }

    channel.close_channel().await;
}
