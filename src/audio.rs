//! `cpal`-backed `AudioInput`/`AudioOutput`, adapted directly from the
//! teacher's capture/playback stream plumbing (`build_input_stream`,
//! `spawn_output_thread`) but behind the collaborator traits and
//! producing/consuming fixed 960-sample 16-bit PCM frames every 20ms
//! instead of raw length-prefixed byte chunks over a channel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::Mutex as PLMutex;

use crate::collaborators::{AudioDevice, AudioInput, AudioOutput};

pub const FRAME_SAMPLES: usize = 960; // 20ms at 48kHz mono

fn list_devices() -> Result<(Vec<Device>, Vec<Device>)> {
    let host = cpal::default_host();
    let inputs: Vec<_> = host.input_devices().context("input_devices")?.collect();
    let outputs: Vec<_> = host.output_devices().context("output_devices")?.collect();
    Ok((inputs, outputs))
}

fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// Real `cpal` input device names, for `Controller::enumerate_audio_inputs`.
pub fn enumerate_input_devices() -> Vec<String> {
    list_devices().map(|(inputs, _)| inputs.iter().map(device_name).collect()).unwrap_or_default()
}

/// Real `cpal` output device names, for `Controller::enumerate_audio_outputs`.
pub fn enumerate_output_devices() -> Vec<String> {
    list_devices().map(|(_, outputs)| outputs.iter().map(device_name).collect()).unwrap_or_default()
}

pub struct CpalAudioInput {
    stream: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    frame_callback: Arc<Mutex<Option<Box<dyn FnMut(&[i16]) + Send>>>>,
    selected_device: Option<String>,
}

impl Default for CpalAudioInput {
    fn default() -> Self {
        Self {
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
            level: Arc::new(AtomicU32::new(0)),
            frame_callback: Arc::new(Mutex::new(None)),
            selected_device: None,
        }
    }
}

impl CpalAudioInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the callback invoked once per captured 20ms frame.
    /// `Controller` wires this to its `HandleAudioInput`-equivalent send
    /// path rather than to the raw encoder, since the encoder itself is
    /// out of scope.
    pub fn set_frame_callback(&self, callback: Box<dyn FnMut(&[i16]) + Send>) {
        *self.frame_callback.lock().unwrap() = Some(callback);
    }

    fn open_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        if let Some(name) = &self.selected_device {
            let (inputs, _) = list_devices()?;
            if let Some(dev) = inputs.into_iter().find(|d| device_name(d) == *name) {
                return Ok(dev);
            }
        }
        host.default_input_device().context("no default input device")
    }
}

impl AudioDevice for CpalAudioInput {
    fn configure(&mut self, _sample_rate: u32, _bits_per_sample: u16, _channels: u16) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let dev = self.open_device()?;
        let cfg = dev.default_input_config()?;
        let sample_format = cfg.sample_format();
        let config: StreamConfig = cfg.clone().into();
        let running = self.running.clone();
        let level = self.level.clone();
        let callback = self.frame_callback.clone();
        running.store(true, Ordering::Relaxed);

        let pcm_buf: Arc<PLMutex<Vec<i16>>> = Arc::new(PLMutex::new(Vec::with_capacity(FRAME_SAMPLES * 2)));

        let deliver = move |samples: &[i16]| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
            level.store(peak as u32, Ordering::Relaxed);
            let mut buf = pcm_buf.lock();
            buf.extend_from_slice(samples);
            while buf.len() >= FRAME_SAMPLES {
                let frame: Vec<i16> = buf.drain(0..FRAME_SAMPLES).collect();
                if let Some(cb) = callback.lock().unwrap().as_mut() {
                    cb(&frame);
                }
            }
        };

        let stream = match sample_format {
            SampleFormat::I16 => {
                let mut deliver = deliver;
                dev.build_input_stream(&config, move |data: &[i16], _| deliver(data), move |e| eprintln!("[audio][input] {e}"), None)?
            }
            SampleFormat::F32 => {
                let mut deliver = deliver;
                dev.build_input_stream(
                    &config,
                    move |data: &[f32], _| {
                        let converted: Vec<i16> = data.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).collect();
                        deliver(&converted);
                    },
                    move |e| eprintln!("[audio][input] {e}"),
                    None,
                )?
            }
            other => anyhow::bail!("unsupported input sample format {other:?}"),
        };
        stream.play()?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.stream = None;
    }

    fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    fn is_playing(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn get_level(&self) -> f32 {
        self.level.load(Ordering::Relaxed) as f32 / i16::MAX as f32
    }

    fn set_current_device(&mut self, name: &str) -> Result<()> {
        self.selected_device = Some(name.to_owned());
        Ok(())
    }

    fn enumerate_devices(&self) -> Vec<String> {
        list_devices().map(|(inputs, _)| inputs.iter().map(device_name).collect()).unwrap_or_default()
    }
}

impl AudioInput for CpalAudioInput {}

pub struct CpalAudioOutput {
    stream: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
    pending: Arc<PLMutex<Vec<i16>>>,
    selected_device: Option<String>,
}

impl Default for CpalAudioOutput {
    fn default() -> Self {
        Self { stream: None, running: Arc::new(AtomicBool::new(false)), pending: Arc::new(PLMutex::new(Vec::new())), selected_device: None }
    }
}

impl CpalAudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes one decoded 20ms frame for playback (fed by the jitter
    /// buffer's playout callback).
    pub fn push_frame(&self, frame: &[i16]) {
        self.pending.lock().extend_from_slice(frame);
    }

    fn open_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        if let Some(name) = &self.selected_device {
            let (_, outputs) = list_devices()?;
            if let Some(dev) = outputs.into_iter().find(|d| device_name(d) == *name) {
                return Ok(dev);
            }
        }
        host.default_output_device().context("no default output device")
    }
}

impl AudioDevice for CpalAudioOutput {
    fn configure(&mut self, _sample_rate: u32, _bits_per_sample: u16, _channels: u16) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let dev = self.open_device()?;
        let cfg = dev.default_output_config()?;
        let sample_format = cfg.sample_format();
        let config: StreamConfig = cfg.clone().into();
        let running = self.running.clone();
        let pending = self.pending.clone();
        running.store(true, Ordering::Relaxed);

        let stream = match sample_format {
            SampleFormat::F32 => {
                let running = self.running.clone();
                let pending = self.pending.clone();
                dev.build_output_stream(
                    &config,
                    move |out: &mut [f32], _| {
                        if !running.load(Ordering::Relaxed) {
                            out.fill(0.0);
                            return;
                        }
                        let mut buf = pending.lock();
                        let take = out.len().min(buf.len());
                        for (o, s) in out.iter_mut().zip(buf.drain(0..take)) {
                            *o = s as f32 / i16::MAX as f32;
                        }
                        for o in out.iter_mut().skip(take) {
                            *o = 0.0;
                        }
                    },
                    move |e| eprintln!("[audio][output] {e}"),
                    None,
                )?
            }
            SampleFormat::I16 => {
                let running = self.running.clone();
                let pending = self.pending.clone();
                dev.build_output_stream(
                    &config,
                    move |out: &mut [i16], _| {
                        if !running.load(Ordering::Relaxed) {
                            out.fill(0);
                            return;
                        }
                        let mut buf = pending.lock();
                        let take = out.len().min(buf.len());
                        for (o, s) in out.iter_mut().zip(buf.drain(0..take)) {
                            *o = s;
                        }
                        for o in out.iter_mut().skip(take) {
                            *o = 0;
                        }
                    },
                    move |e| eprintln!("[audio][output] {e}"),
                    None,
                )?
            }
            other => anyhow::bail!("unsupported output sample format {other:?}"),
        };
        stream.play()?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.stream = None;
    }

    fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    fn is_playing(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn get_level(&self) -> f32 {
        let buf = self.pending.lock();
        buf.iter().map(|s| s.unsigned_abs() as f32).fold(0.0, f32::max) / i16::MAX as f32
    }

    fn set_current_device(&mut self, name: &str) -> Result<()> {
        self.selected_device = Some(name.to_owned());
        Ok(())
    }

    fn enumerate_devices(&self) -> Vec<String> {
        list_devices().map(|(_, outputs)| outputs.iter().map(device_name).collect()).unwrap_or_default()
    }
}

impl AudioOutput for CpalAudioOutput {}
