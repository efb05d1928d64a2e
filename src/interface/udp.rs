//! # UDP Interface
//!
//! Datagram link for SITL and network-attached ground stations. Each datagram
//! carries one or more complete SLIP frames.
//!
//! Without a configured remote, replies go to whichever peer last sent a
//! valid packet.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Interface, InterfaceIndex};
use crate::comm::manager::CommManager;
use crate::comm::receiver::FrameReceiver;
use crate::error::{FlightLinkError, Result};

/// Largest datagram accepted
const MAX_DATAGRAM_SIZE: usize = 2048;

/// UDP transport
#[derive(Debug)]
pub struct UdpInterface {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    fixed_peer: bool,
}

impl UdpInterface {
    /// Bind a local socket
    ///
    /// # Arguments
    ///
    /// * `bind` - Local address (e.g., "0.0.0.0:14550")
    /// * `remote` - Fixed peer, or `None` to learn it from incoming packets
    ///
    /// # Errors
    ///
    /// Returns `Io` if the socket cannot be bound
    pub async fn bind(bind: &str, remote: Option<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        info!("Bound UDP interface on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peer: Mutex::new(remote),
            fixed_peer: remote.is_some(),
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current transmit destination
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn learn_peer(&self, from: SocketAddr) {
        if self.fixed_peer {
            return;
        }

        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if *peer != Some(from) {
            info!("UDP peer is now {}", from);
            *peer = Some(from);
        }
    }

    /// Spawn the receive task
    ///
    /// Runs until the socket errors, storing every valid packet in the
    /// manager's queue tagged with `index`.
    pub fn spawn_receiver(self: &Arc<Self>, manager: Arc<CommManager>, index: InterfaceIndex) -> JoinHandle<()> {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut receiver = FrameReceiver::new();
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let (len, from) = match this.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP receive error on interface {}: {}", index, e);
                        break;
                    }
                };

                let delivered = receiver.feed(&buf[..len], |packet| {
                    let _ = manager.store_received_packet(index, packet);
                });

                if delivered > 0 {
                    this.learn_peer(from);
                }
            }

            debug!("Interface {} receiver stopped: {:?}", index, receiver.stats());
        })
    }
}

#[async_trait]
impl Interface for UdpInterface {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let peer = self
            .peer()
            .ok_or_else(|| FlightLinkError::Interface("UDP peer not known yet".to_string()))?;

        self.socket.send_to(frame, peer).await?;
        debug!("Sent {} bytes to {}", frame.len(), peer);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.peer().is_some()
    }
}
