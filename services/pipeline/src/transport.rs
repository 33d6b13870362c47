//! UDP frame source standing in for the wireless link.
//!
//! Every datagram carries exactly one frame. Datagrams of the wrong size are
//! passed through and rejected by the codec like any other malformed frame.

use crate::coordinator::Pipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Large enough that an oversized datagram is never truncated to a valid
/// frame length.
const RECV_BUFFER_LEN: usize = 512;

/// Errors from the frame transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Receive failed: {0}")]
    Receive(#[from] std::io::Error),
}

/// Receives frames over UDP and pushes them into the pipeline.
pub struct UdpFrameSource {
    socket: UdpSocket,
}

impl UdpFrameSource {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let bind_error = |source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
        let local = socket.local_addr().map_err(bind_error)?;
        info!(addr = %local, "Frame transport listening");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until cancelled. Returns the number of datagrams received.
    #[instrument(skip(self, pipeline, shutdown))]
    pub async fn run(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: CancellationToken,
    ) -> Result<u64, TransportError> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut received = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            received += 1;
                            if pipeline.on_frame(&buf[..len]).is_none() {
                                debug!(%peer, len, "Frame dropped");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Frame receive failed");
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        info!(received, "Frame transport stopped");
        Ok(received)
    }
}
