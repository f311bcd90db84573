//! Narrow trait interfaces for everything the controller treats as an
//! external collaborator: the datagram socket, audio devices, the
//! codec, the DSP chain, and the jitter buffer. None of these are
//! reimplemented here beyond what's needed to exercise the controller;
//! `socket.rs` and `audio.rs` provide the two concrete, non-mock
//! implementations this crate ships.

use std::net::IpAddr;

use anyhow::Result;

pub trait Socket: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self);
    fn send(&self, addr: IpAddr, port: u16, bytes: &[u8]) -> Result<()>;
    /// Blocks until a datagram arrives or a bounded poll interval
    /// elapses, whichever comes first, returning `None` in the latter
    /// case (and once the socket has been closed) so a caller looping on
    /// a `stopping` flag is never stuck past one poll interval.
    fn receive(&self) -> Option<(IpAddr, u16, Vec<u8>)>;
    fn local_port(&self) -> u16;
    fn local_interface(&self, v4: bool) -> Option<String>;
    fn on_active_interface_changed(&self, callback: Box<dyn Fn() + Send + Sync>);
}

pub trait AudioDevice: Send + Sync {
    fn configure(&mut self, sample_rate: u32, bits_per_sample: u16, channels: u16) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn is_initialized(&self) -> bool;
    fn is_playing(&self) -> bool;
    fn get_level(&self) -> f32;
    fn set_current_device(&mut self, name: &str) -> Result<()>;
    fn enumerate_devices(&self) -> Vec<String>;
}

pub trait AudioInput: AudioDevice {}
pub trait AudioOutput: AudioDevice {}

pub trait Encoder: Send + Sync {
    fn start(&mut self);
    fn stop(&mut self);
    fn set_bitrate(&mut self, bitrate: u32);
    fn get_bitrate(&self) -> u32;
    fn set_packet_loss(&mut self, percent: u32);
    fn set_output_frame_duration(&mut self, ms: u16);
    fn set_echo_canceller(&mut self, canceller: Option<Box<dyn EchoCanceller>>);
    fn set_callback(&mut self, callback: Box<dyn FnMut(&[u8], u32) + Send>);
}

pub trait Decoder: Send + Sync {
    fn start(&mut self);
    fn stop(&mut self);
    fn set_echo_canceller(&mut self, canceller: Option<Box<dyn EchoCanceller>>);
    fn set_jitter_buffer(&mut self, jitter_buffer: Box<dyn JitterBuffer>);
    fn set_frame_duration(&mut self, ms: u16);
    fn reset_queue(&mut self);
}

pub trait JitterBuffer: Send + Sync {
    fn handle_input(&mut self, data: &[u8], pts: u32);
    fn tick(&mut self);
    fn reset(&mut self);
    fn set_min_packet_count(&mut self, n: u32);
    fn average_delay(&self) -> f64;
    fn lost_packet_count(&self) -> u64;
}

pub trait EchoCanceller: Send + Sync {
    fn speaker_out_callback(&mut self, data: &mut [i16]);
    fn process_input(&mut self, data: &mut [i16]);
    fn enable(&mut self, enabled: bool);
}
