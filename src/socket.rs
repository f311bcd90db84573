//! `UdpSocket`-backed `Socket` implementation, the real collaborator
//! this crate ships instead of leaving the transport as a pure
//! interface. Local interface discovery reuses `get_if_addrs`, already a
//! dependency of the teacher's LAN-IP listing in its GUI.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::collaborators::Socket;
use crate::error::SetupError;

/// Binds an ephemeral UDP port on `0.0.0.0`, the way `net::pick_free_port`
/// probed a free TCP port in the teacher, adapted here to UDP since the
/// wire protocol is UDP end to end.
pub fn pick_free_udp_port() -> Result<u16> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("bind ephemeral udp port")?;
    Ok(socket.local_addr()?.port())
}

/// `std::net::UdpSocket` has no `shutdown()`: dropping one of its clones
/// does not interrupt a `recv_from` already blocked on another clone's
/// fd. A short read timeout instead makes `receive()` wake up on its own
/// so `Controller::stop()`'s `close()` is guaranteed to be observed
/// within one tick rather than risking the receive thread never
/// rejoining.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct UdpTransport {
    socket: Arc<Mutex<Option<UdpSocket>>>,
    local_port: u16,
    on_interface_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl UdpTransport {
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(SetupError::SocketBind)?;
        let local_port = socket.local_addr()?.port();
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT)).context("set read timeout")?;
        Ok(Self { socket: Arc::new(Mutex::new(Some(socket))), local_port, on_interface_changed: Mutex::new(None) })
    }
}

impl Socket for UdpTransport {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        // Dropping the bound socket unblocks any thread parked in
        // `recv_from` with an error, which `receive()` treats as EOF.
        *self.socket.lock().unwrap() = None;
    }

    fn send(&self, addr: IpAddr, port: u16, bytes: &[u8]) -> Result<()> {
        let guard = self.socket.lock().unwrap();
        let socket = guard.as_ref().context("socket closed")?;
        socket.send_to(bytes, SocketAddr::new(addr, port))?;
        Ok(())
    }

    /// Returns `None` both on the read-timeout wakeup (caller should
    /// just loop and re-check whether it should keep running) and once
    /// the socket has actually been closed; the caller can't tell those
    /// apart from this return value alone, but it doesn't need to: its
    /// own `stopping` flag is what decides whether to keep receiving.
    fn receive(&self) -> Option<(IpAddr, u16, Vec<u8>)> {
        let socket = {
            let guard = self.socket.lock().unwrap();
            guard.as_ref()?.try_clone().ok()?
        };
        let mut buf = vec![0u8; 2048];
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                Some((from.ip(), from.port(), buf))
            }
            Err(_) => None,
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn local_interface(&self, v4: bool) -> Option<String> {
        let interfaces = get_if_addrs::get_if_addrs().ok()?;
        interfaces
            .into_iter()
            .find(|i| !i.is_loopback() && i.ip().is_ipv4() == v4)
            .map(|i| i.name)
    }

    fn on_active_interface_changed(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.on_interface_changed.lock().unwrap() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_an_ephemeral_port() {
        let port = pick_free_udp_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn loopback_send_receive_round_trips() {
        let a = UdpTransport::bind(0).unwrap();
        let b = UdpTransport::bind(0).unwrap();
        a.send(IpAddr::from([127, 0, 0, 1]), b.local_port(), b"hello").unwrap();
        let (_, _, data) = b.receive().expect("datagram");
        assert_eq!(data, b"hello");
    }
}
