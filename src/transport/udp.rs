//! UDP link to one vehicle.
//!
//! Binds a local port and learns the remote endpoint from the first inbound
//! datagram. WiFi links drop and reconnect, so a datagram from a different
//! source replaces the learned peer; outbound traffic follows it.
//!
//! The receive thread hands each datagram to a sink which must drain the
//! frame codec before the next `recv_from`. The socket runs with a short
//! read timeout so `stop()` can flip the exit flag and join the thread
//! without a platform-specific socket shutdown.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, LinkError};

/// Enough for MTU 1500 plus headroom.
const RECV_BUFFER_LEN: usize = 2048;

/// Poll interval for the exit flag while no traffic arrives.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct LinkShared {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    should_exit: AtomicBool,
}

/// Datagram link bound to a local port, sending to the learned peer.
pub struct UdpLink {
    shared: Arc<LinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpLink {
    /// Bind `0.0.0.0:<local_port>`. Port 0 binds an ephemeral port.
    pub fn bind(local_port: u16) -> Result<Self, ConnectionError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).map_err(ConnectionError::BindError)?;
        socket
            .set_read_timeout(Some(RECV_POLL_TIMEOUT))
            .map_err(ConnectionError::SocketError)?;

        Ok(Self {
            shared: Arc::new(LinkShared {
                socket,
                peer: Mutex::new(None),
                should_exit: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the receive thread feeding `sink` with raw datagrams.
    pub fn start<F>(&self, sink: F) -> Result<(), ConnectionError>
    where
        F: Fn(&[u8]) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("groundlink-recv".into())
            .spawn(move || receive_loop(&shared, sink))
            .map_err(|_| ConnectionError::ConnectionsExhausted)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the receive thread. Idempotent and safe from `Drop`.
    pub fn stop(&self) {
        self.shared.should_exit.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Send one datagram to the learned peer.
    pub fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        let peer = (*self.shared.peer.lock()).ok_or(LinkError::PeerUnknown)?;
        let sent = self.shared.socket.send_to(data, peer)?;
        if sent != data.len() {
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short datagram send",
            )));
        }
        Ok(())
    }

    /// The learned remote endpoint, if any datagram has arrived yet.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.shared.peer.lock()
    }

    /// The locally bound address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop<F: Fn(&[u8])>(shared: &LinkShared, sink: F) {
    let mut buffer = [0u8; RECV_BUFFER_LEN];

    while !shared.should_exit.load(Ordering::Acquire) {
        let (len, source) = match shared.socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                if !shared.should_exit.load(Ordering::Acquire) {
                    warn!("recv error: {e}");
                }
                continue;
            }
        };

        adopt_peer(shared, source);

        if len > 0 {
            sink(&buffer[..len]);
        }
    }
    debug!("receive loop exited");
}

/// Learn the peer from the first datagram; follow it when it moves.
fn adopt_peer(shared: &LinkShared, source: SocketAddr) {
    let mut peer = shared.peer.lock();
    match *peer {
        None => {
            info!("new vehicle on: {source}");
            *peer = Some(source);
        }
        Some(current) if current != source => {
            info!("vehicle changed to: {source}");
            *peer = Some(source);
        }
        _ => {}
    }
}
