/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! TCP/UDP transport plumbing shared by every Donet cluster role.
//!
//! A [`Client`] wraps one TCP stream (a downstream subscriber's
//! connection, or our own uplink to an upstream service) with a send
//! queue and two Tokio tasks: one reads datagrams off the wire and
//! forwards them through an `mpsc` channel to the owning service's
//! main loop, the other drains the send queue back onto the wire.
//! This lets the single-threaded-per-service model receive from many
//! peers concurrently without giving up the `Arc<Mutex<Service>>` lock
//! discipline described in `donet-daemon`.

pub mod tcp;
pub mod udp;

use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use log::{debug, trace, warn};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A datagram received off the wire, paired with the peer it came from.
///
/// Both a fresh [`DatagramIterator`] (for consuming the message) and
/// the original [`Datagram`] (for re-broadcasting it verbatim) are
/// kept, since the Message Director needs to replicate the exact
/// bytes it received to every subscriber.
pub struct RecvData {
    pub dg: Datagram,
    pub dgi: DatagramIterator,
    pub remote: SocketAddr,
}

/// Join handles for the two background tasks spawned by
/// [`Client::spawn_recv_send_tasks`].
pub struct RecvSendHandles {
    pub recv_handle: JoinHandle<Result<()>>,
    pub send_handle: JoinHandle<Result<()>>,
}

/// Implemented by anything that owns a connection to another Donet
/// cluster role (an uplink Message Director, a downstream subscriber)
/// so the `donet-daemon` subscriber traits can stage control messages
/// without knowing which role is on the other end.
pub trait HasClient {
    fn get_client(&self) -> Arc<Mutex<Client>>;
}

/// One TCP connection to a peer, plus its outgoing send queue.
///
/// `Client` itself does no I/O until [`Self::spawn_recv_send_tasks`] is
/// called, which consumes the socket and hands back two join handles.
/// Sends afterward go through [`Self::stage_datagram`], which pushes
/// onto an internal `mpsc` queue drained by the send task.
pub struct Client {
    remote: SocketAddr,
    local: SocketAddr,
    socket: Option<TcpStream>,
    outgoing_tx: Option<mpsc::Sender<Datagram>>,
}

impl From<TcpStream> for Client {
    fn from(socket: TcpStream) -> Self {
        let remote = socket.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let local = socket.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());

        Self {
            remote,
            local,
            socket: Some(socket),
            outgoing_tx: None,
        }
    }
}

impl From<tcp::Connection> for Client {
    fn from(conn: tcp::Connection) -> Self {
        Self::from(conn.socket)
    }
}

impl Client {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Pushes a datagram onto the send queue for this client's send task.
    ///
    /// Must be called after [`Self::spawn_recv_send_tasks`], as the
    /// queue is only created once the send task is spawned.
    pub async fn stage_datagram(&mut self, dg: Datagram) -> Result<()> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(dg)
                .await
                .map_err(|_| Error::new(ErrorKind::BrokenPipe, "Send task is no longer running.")),
            None => Err(Error::new(
                ErrorKind::NotConnected,
                "Tried to stage a datagram before spawning the send task.",
            )),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(sock) = &mut self.socket {
            sock.shutdown().await?;
        } else {
            debug!("Tried to disconnect client with no existing socket!");
            return Err(Error::new(ErrorKind::NotConnected, "Client has no socket!"));
        }
        let _: TcpStream = self.socket.take().unwrap();
        Ok(())
    }

    /// Consumes this client's socket and spawns a recv task (reads
    /// length-prefixed datagrams off the wire and forwards them via
    /// `tx`) and a send task (drains the internal queue onto the wire).
    pub async fn spawn_recv_send_tasks(&mut self, tx: mpsc::Sender<RecvData>) -> RecvSendHandles {
        let socket = self.socket.take().expect("Client socket already consumed.");
        let (mut read_half, mut write_half) = socket.into_split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Datagram>(64);
        self.outgoing_tx = Some(outgoing_tx);

        let remote = self.remote;

        let recv_handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            loop {
                let mut size_buf = [0u8; 2];

                if let Err(e) = read_half.read_exact(&mut size_buf).await {
                    trace!("Connection from {} closed: {}", remote, e);
                    return Ok(());
                }
                let dg_size: u16 = u16::from_le_bytes(size_buf);

                let mut payload = vec![0u8; usize::from(dg_size)];

                if let Err(e) = read_half.read_exact(&mut payload).await {
                    warn!("Failed to read datagram payload from {}: {}", remote, e);
                    return Ok(());
                }

                let mut dg = Datagram::default();
                if dg.add_data(payload).is_err() {
                    warn!("Received oversized datagram from {}; dropping connection.", remote);
                    return Ok(());
                }

                let recv_data = RecvData {
                    dgi: DatagramIterator::from(dg.clone()),
                    dg,
                    remote,
                };

                if tx.send(recv_data).await.is_err() {
                    // owning service's main loop has shut down
                    return Ok(());
                }
            }
        });

        let send_handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            while let Some(dg) = outgoing_rx.recv().await {
                let payload = dg.get_data();
                let size_tag = (payload.len() as u16).to_le_bytes();

                if let Err(e) = write_half.write_all(&size_tag).await {
                    warn!("Failed to write to {}: {}", remote, e);
                    return Ok(());
                }
                if let Err(e) = write_half.write_all(&payload).await {
                    warn!("Failed to write to {}: {}", remote, e);
                    return Ok(());
                }
            }
            Ok(())
        });

        RecvSendHandles {
            recv_handle,
            send_handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_roundtrip_over_loopback() {
        let acceptor = tcp::Acceptor::bind("127.0.0.1:0").await.unwrap();
        let bound_addr = acceptor.socket.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (socket, _) = acceptor.socket.accept().await.unwrap();
            let mut client: Client = socket.into();

            let (tx, mut rx) = mpsc::channel::<RecvData>(4);
            let _handles = client.spawn_recv_send_tasks(tx).await;

            let recv = rx.recv().await.unwrap();
            assert_eq!(recv.dg.get_data(), vec![1, 2, 3]);
        });

        let conn = tcp::Connection::connect(&bound_addr.to_string()).await.unwrap();
        let mut client: Client = conn.into();

        let (tx, _rx) = mpsc::channel::<RecvData>(4);
        let _handles = client.spawn_recv_send_tasks(tx).await;

        let mut dg = Datagram::default();
        dg.add_data(vec![1, 2, 3]).unwrap();
        client.stage_datagram(dg).await.unwrap();

        server_task.await.unwrap();
    }
}
