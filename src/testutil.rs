//! Always-available, non-mock-but-trivial collaborator implementations:
//! an in-memory loopback [`Socket`] pair (used by the handshake
//! integration test so the suite never touches a real UDP stack) and
//! no-op `Encoder`/`Decoder`/`JitterBuffer`/`EchoCanceller` doubles a
//! `Controller` can be constructed with before an embedder supplies the
//! real codec/DSP stack.

use std::net::IpAddr;
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};

use crate::collaborators::{Decoder, EchoCanceller, Encoder, JitterBuffer, Socket};

/// One end of an in-process loopback UDP pair. `send` on one end
/// delivers to the peer's `receive`; `close` unblocks any thread parked
/// in `receive` the same way dropping a real `UdpSocket` does.
pub struct LoopbackSocket {
    local_port: u16,
    peer_addr: IpAddr,
    peer_port: u16,
    outbox: Sender<(IpAddr, u16, Vec<u8>)>,
    inbox: Receiver<(IpAddr, u16, Vec<u8>)>,
    closed: StdMutex<bool>,
}

impl LoopbackSocket {
    /// Builds a connected pair: `a`'s sends arrive at `b`'s `receive`
    /// and vice versa, both reporting `127.0.0.1` as the peer address.
    pub fn pair(port_a: u16, port_b: u16) -> (Self, Self) {
        let (tx_a_to_b, rx_a_to_b) = crossbeam_channel::unbounded();
        let (tx_b_to_a, rx_b_to_a) = crossbeam_channel::unbounded();
        let loopback = IpAddr::from([127, 0, 0, 1]);
        let a = Self { local_port: port_a, peer_addr: loopback, peer_port: port_b, outbox: tx_a_to_b, inbox: rx_b_to_a, closed: StdMutex::new(false) };
        let b = Self { local_port: port_b, peer_addr: loopback, peer_port: port_a, outbox: tx_b_to_a, inbox: rx_a_to_b, closed: StdMutex::new(false) };
        (a, b)
    }
}

impl Socket for LoopbackSocket {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn send(&self, _addr: IpAddr, _port: u16, bytes: &[u8]) -> Result<()> {
        let _ = self.outbox.send((self.peer_addr, self.local_port, bytes.to_vec()));
        Ok(())
    }

    fn receive(&self) -> Option<(IpAddr, u16, Vec<u8>)> {
        loop {
            if *self.closed.lock().unwrap() {
                return None;
            }
            match self.inbox.recv_timeout(std::time::Duration::from_millis(50)) {
                Ok((addr, port, data)) => return Some((addr, port, data)),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn local_interface(&self, _v4: bool) -> Option<String> {
        Some("lo".to_owned())
    }

    fn on_active_interface_changed(&self, _callback: Box<dyn Fn() + Send + Sync>) {}
}

#[derive(Default)]
pub struct NullEncoder {
    bitrate: u32,
}

impl Encoder for NullEncoder {
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }
    fn get_bitrate(&self) -> u32 {
        self.bitrate
    }
    fn set_packet_loss(&mut self, _percent: u32) {}
    fn set_output_frame_duration(&mut self, _ms: u16) {}
    fn set_echo_canceller(&mut self, _canceller: Option<Box<dyn EchoCanceller>>) {}
    fn set_callback(&mut self, _callback: Box<dyn FnMut(&[u8], u32) + Send>) {}
}

#[derive(Default)]
pub struct NullDecoder;

impl Decoder for NullDecoder {
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn set_echo_canceller(&mut self, _canceller: Option<Box<dyn EchoCanceller>>) {}
    fn set_jitter_buffer(&mut self, _jitter_buffer: Box<dyn JitterBuffer>) {}
    fn set_frame_duration(&mut self, _ms: u16) {}
    fn reset_queue(&mut self) {}
}

/// Plain FIFO stand-in for the real playout-scheduling jitter buffer:
/// records arrivals for `handle_input` and reports a lost count derived
/// from gaps the caller tells it about via `note_gap`, enough to drive
/// the loss-adaptive bitrate policy in tests without a real scheduler.
#[derive(Default)]
pub struct SimpleJitterBuffer {
    pub received: Vec<(Vec<u8>, u32)>,
    pub lost: u64,
    pub min_packet_count: u32,
}

impl JitterBuffer for SimpleJitterBuffer {
    fn handle_input(&mut self, data: &[u8], pts: u32) {
        self.received.push((data.to_vec(), pts));
    }
    fn tick(&mut self) {}
    fn reset(&mut self) {
        self.received.clear();
        self.lost = 0;
    }
    fn set_min_packet_count(&mut self, n: u32) {
        self.min_packet_count = n;
    }
    fn average_delay(&self) -> f64 {
        0.0
    }
    fn lost_packet_count(&self) -> u64 {
        self.lost
    }
}

/// Like [`SimpleJitterBuffer`] but shares its received-frame list via an
/// `Arc` so a test can install it into a `Controller` (which takes
/// ownership of the boxed trait object) and still inspect what arrived.
#[derive(Clone, Default)]
pub struct RecordingJitterBuffer {
    pub received: std::sync::Arc<StdMutex<Vec<(Vec<u8>, u32)>>>,
    pub lost: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl JitterBuffer for RecordingJitterBuffer {
    fn handle_input(&mut self, data: &[u8], pts: u32) {
        self.received.lock().unwrap().push((data.to_vec(), pts));
    }
    fn tick(&mut self) {}
    fn reset(&mut self) {
        self.received.lock().unwrap().clear();
    }
    fn set_min_packet_count(&mut self, _n: u32) {}
    fn average_delay(&self) -> f64 {
        0.0
    }
    fn lost_packet_count(&self) -> u64 {
        self.lost.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct NullEchoCanceller;

impl EchoCanceller for NullEchoCanceller {
    fn speaker_out_callback(&mut self, _data: &mut [i16]) {}
    fn process_input(&mut self, _data: &mut [i16]) {}
    fn enable(&mut self, _enabled: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loopback_pair_delivers_both_directions() {
        let (a, b) = LoopbackSocket::pair(1000, 2000);
        a.send(IpAddr::from([127, 0, 0, 1]), 2000, b"ping").unwrap();
        let (_, from_port, data) = b.receive().expect("datagram");
        assert_eq!(from_port, 1000);
        assert_eq!(data, b"ping");
        b.send(IpAddr::from([127, 0, 0, 1]), 1000, b"pong").unwrap();
        let (_, _, data) = a.receive().expect("datagram");
        assert_eq!(data, b"pong");
    }

    #[test]
    fn close_unblocks_receive() {
        let (a, _b) = LoopbackSocket::pair(1000, 2000);
        a.close();
        assert!(a.receive().is_none());
    }
}
