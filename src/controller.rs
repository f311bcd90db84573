//! The call controller: lifecycle, the three worker threads plus the
//! audio callback, and the public facade. This is where the framing,
//! KDF, sequence/ack, congestion, reliable queue, endpoint table,
//! handshake, and bitrate modules are wired together into one running
//! call.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::bitrate::{BitrateConfig, BitratePolicy};
use crate::collaborators::{AudioInput, AudioOutput, Decoder, Encoder, JitterBuffer, Socket};
use crate::config::{Config, ServerConfig};
use crate::congestion::CongestionController;
use crate::crypto::{call_id as derive_call_id, key_fingerprint, Crypto, DefaultCrypto};
use crate::endpoint::{Endpoint, EndpointId, EndpointTable};
use crate::error::{ControllerError, SetupError};
use crate::framing::{self, ExtendedFields, Frame};
use crate::handshake::{self, InitAckPayload, InitPayload};
use crate::reliable::{QueuedReliable, ReliableQueue};
use crate::seq::SeqState;
use crate::stats::{ControllerStats, DebugInfo, DebugLog, StatsSnapshot};
use crate::time::now;
use crate::types::{
    ControllerState, EndpointKind, NetworkType, PacketType, Stream, StreamKind,
    INIT_FLAG_DATA_SAVING, MIN_PROTOCOL_VERSION, PROTOCOL_NAME, PROTOCOL_VERSION,
};

const TICK_INTERVAL: f64 = 0.1;
const RELIABLE_RETRY_SCAN_INTERVAL: f64 = 0.1;
const STALL_SCAN_INTERVAL: f64 = 0.5;
const LOSS_SCAN_INTERVAL: f64 = 1.0;
const PING_INTERVAL: f64 = 10.0;
const REFLECTOR_RETRY_INTERVAL: f64 = 5.0;
const INIT_RETRANSMIT_INTERVAL: f64 = 0.5;
const RELAY_SWITCH_THRESHOLD: f64 = 0.8;
const RELAY_TO_P2P_THRESHOLD: f64 = 0.8;
const P2P_TO_RELAY_THRESHOLD: f64 = 0.6;

enum OutFraming {
    Legacy { pkt_type: u8, ack_id: u32, seq: u32, ack_mask: u32, payload: Vec<u8> },
    Extended { pkt_type: u8, fields: ExtendedFields, data: Option<Vec<u8>> },
    /// Sent to the wire verbatim, with no encryption/hash/seq wrapper:
    /// the reflector probe and reply (§4.6) are the one part of the
    /// wire protocol that isn't an authenticated frame.
    Raw(Vec<u8>),
}

struct OutPacket {
    addr: IpAddr,
    port: u16,
    tag: [u8; 16],
    framing: OutFraming,
}

struct Inner {
    crypto: Arc<dyn Crypto>,
    outgoing: bool,
    shared_key: RwLock<Option<[u8; 256]>>,
    fingerprint: AtomicU64,
    call_id: Mutex<[u8; 16]>,
    socket: Arc<dyn Socket>,
    endpoints: Mutex<EndpointTable>,
    seq: SeqState,
    congestion: Mutex<CongestionController>,
    reliable: Mutex<ReliableQueue>,
    bitrate: Mutex<BitratePolicy>,
    state: Mutex<ControllerState>,
    state_change_time: Mutex<f64>,
    last_error: Mutex<Option<ControllerError>>,
    state_callback: Mutex<Option<Box<dyn Fn(ControllerState) + Send + Sync>>>,
    config: RwLock<Config>,
    server_config: Arc<dyn ServerConfig>,
    network_type: Mutex<NetworkType>,
    data_saving_requested_by_peer: AtomicBool,
    allow_p2p: AtomicBool,
    stopping: AtomicBool,
    waiting_for_relay_info: AtomicBool,
    relay_request_time: Mutex<f64>,
    send_tx: Sender<Option<OutPacket>>,
    send_rx: Receiver<Option<OutPacket>>,
    local_streams: Mutex<Vec<Stream>>,
    peer_streams: Mutex<Vec<Stream>>,
    peer_version: AtomicU32,
    connection_init_time: Mutex<f64>,
    stats: Arc<ControllerStats>,
    debug_log: Mutex<DebugLog>,
    audio_input: Mutex<Option<Box<dyn AudioInput>>>,
    audio_output: Mutex<Option<Box<dyn AudioOutput>>>,
    mic_muted: AtomicBool,
    last_recv_time: Mutex<f64>,
    encoder: Mutex<Option<Box<dyn Encoder>>>,
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    jitter_buffer: Mutex<Option<Box<dyn JitterBuffer>>>,
    last_loss_sample_lost: Mutex<u64>,
}

/// Lifecycle entry point and public facade. Cheaply cloneable (`Arc`
/// internally) so the three worker threads and the audio callback can
/// all hold a handle.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Controller {
    pub fn new(socket: Arc<dyn Socket>, server_config: Arc<dyn ServerConfig>, outgoing: bool) -> Self {
        let (send_tx, send_rx) = crossbeam_channel::bounded(256);
        let inner = Inner {
            crypto: Arc::new(DefaultCrypto),
            outgoing,
            shared_key: RwLock::new(None),
            fingerprint: AtomicU64::new(0),
            call_id: Mutex::new([0u8; 16]),
            socket,
            endpoints: Mutex::new(EndpointTable::new()),
            seq: SeqState::new(),
            congestion: Mutex::new(CongestionController::new()),
            reliable: Mutex::new(ReliableQueue::new()),
            bitrate: Mutex::new(BitratePolicy::new(BitrateConfig::default())),
            state: Mutex::new(ControllerState::WaitInit),
            state_change_time: Mutex::new(now()),
            last_error: Mutex::new(None),
            state_callback: Mutex::new(None),
            config: RwLock::new(Config::default()),
            server_config,
            network_type: Mutex::new(NetworkType::Unknown),
            data_saving_requested_by_peer: AtomicBool::new(false),
            allow_p2p: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            waiting_for_relay_info: AtomicBool::new(false),
            relay_request_time: Mutex::new(0.0),
            send_tx,
            send_rx,
            local_streams: Mutex::new(vec![Stream { id: 0, kind: StreamKind::Audio, codec_tag: 1, frame_duration_ms: 60, enabled: true }]),
            peer_streams: Mutex::new(Vec::new()),
            peer_version: AtomicU32::new(0),
            connection_init_time: Mutex::new(0.0),
            stats: Arc::new(ControllerStats::new()),
            debug_log: Mutex::new(DebugLog::new()),
            audio_input: Mutex::new(None),
            audio_output: Mutex::new(None),
            mic_muted: AtomicBool::new(false),
            last_recv_time: Mutex::new(now()),
            encoder: Mutex::new(None),
            decoder: Mutex::new(None),
            jitter_buffer: Mutex::new(None),
            last_loss_sample_lost: Mutex::new(0),
        };
        Self { inner: Arc::new(inner), threads: Arc::new(Mutex::new(Vec::new())) }
    }

    // -- public facade ----------------------------------------------------

    /// Must precede `start()`.
    pub fn set_encryption_key(&self, key: [u8; 256]) -> Result<()> {
        if !self.threads.lock().is_empty() {
            return Err(SetupError::AlreadyStarted.into());
        }
        let fp = key_fingerprint(self.inner.crypto.as_ref(), &key);
        let cid = derive_call_id(self.inner.crypto.as_ref(), &key);
        *self.inner.call_id.lock() = cid;
        self.inner.fingerprint.store(fp, Ordering::Relaxed);
        *self.inner.shared_key.write() = Some(key);
        Ok(())
    }

    pub fn set_remote_endpoints(&self, endpoints: Vec<Endpoint>, allow_p2p: bool) {
        self.inner.allow_p2p.store(allow_p2p, Ordering::Relaxed);
        let mut table = self.inner.endpoints.lock();
        table.clear();
        let mut first = None;
        for e in endpoints {
            let id = table.insert(e);
            first.get_or_insert(id);
        }
        table.current = first;
        table.preferred_relay = first;
        // Both sides are handed the same relay set in the common case;
        // absent a signal from the peer about which one it prefers,
        // assume it picked the same first entry we did.
        table.peer_preferred_relay = first;
    }

    pub fn set_network_type(&self, network: NetworkType) {
        *self.inner.network_type.lock() = network;
    }

    pub fn set_config(&self, config: Config) {
        *self.inner.config.write() = config;
    }

    pub fn set_state_callback(&self, callback: Box<dyn Fn(ControllerState) + Send + Sync>) {
        *self.inner.state_callback.lock() = Some(callback);
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.lock()
    }

    pub fn last_error(&self) -> Option<ControllerError> {
        *self.inner.last_error.lock()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn get_debug_log(&self) -> Vec<String> {
        self.inner.debug_log.lock().entries()
    }

    pub fn get_average_rtt(&self) -> f64 {
        self.inner.seq.average_rtt()
    }

    pub fn server_config(&self) -> &Arc<dyn ServerConfig> {
        &self.inner.server_config
    }

    pub fn set_current_audio_input(&self, input: Box<dyn AudioInput>) {
        *self.inner.audio_input.lock() = Some(input);
    }

    pub fn set_current_audio_output(&self, output: Box<dyn AudioOutput>) {
        *self.inner.audio_output.lock() = Some(output);
    }

    /// Installs the codec encoder. The controller never pushes audio
    /// into it directly (that path is `capture -> encoder ->
    /// handle_audio_input`, owned by the embedder); it only drives the
    /// control-plane calls (`set_bitrate`, `set_packet_loss`) from the
    /// adaptive policy.
    pub fn set_encoder(&self, encoder: Box<dyn Encoder>) {
        *self.inner.encoder.lock() = Some(encoder);
    }

    pub fn set_decoder(&self, decoder: Box<dyn Decoder>) {
        *self.inner.decoder.lock() = Some(decoder);
    }

    /// Installs the jitter buffer that receives every decoded
    /// `PKT_STREAM_DATA`/`_X2`/`_X3` payload via `handle_input`.
    pub fn set_jitter_buffer(&self, jitter_buffer: Box<dyn JitterBuffer>) {
        *self.inner.jitter_buffer.lock() = Some(jitter_buffer);
    }

    pub fn enumerate_audio_inputs(&self) -> Vec<String> {
        crate::audio::enumerate_input_devices()
    }

    pub fn enumerate_audio_outputs(&self) -> Vec<String> {
        crate::audio::enumerate_output_devices()
    }

    /// Tells the peer the local network interface changed: per §4.6 this
    /// invalidates any negotiated P2P candidate, so this also drops the
    /// local P2P/LAN endpoints and re-requests a reflector probe.
    pub fn notify_network_changed(&self) {
        self.send_reliably(PacketType::NetworkChanged, Vec::new(), 0.5, 10.0);
        self.reset_p2p_candidates_and_reprobe();
    }

    fn reset_p2p_candidates_and_reprobe(&self) {
        {
            let mut table = self.inner.endpoints.lock();
            table.remove_all_of_kind(EndpointKind::P2pInet);
            table.remove_all_of_kind(EndpointKind::P2pLan);
            if let Some(relay) = table.preferred_relay {
                table.current = Some(relay);
            }
        }
        if self.inner.allow_p2p.load(Ordering::Relaxed) {
            self.request_reflector_probe();
        }
    }

    /// `audio_input->Stop()` then `IsInitialized()`: a failing
    /// re-initialization after stop deliberately surfaces as `AudioIo`,
    /// matching the original's preserved ordering (see DESIGN.md).
    pub fn set_mic_mute(&self, muted: bool) {
        self.inner.mic_muted.store(muted, Ordering::Relaxed);
        let mut guard = self.inner.audio_input.lock();
        if let Some(input) = guard.as_mut() {
            input.stop();
            if muted {
                return;
            }
            if !input.is_initialized() {
                self.fail(ControllerError::AudioIo);
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.inner.shared_key.read().is_none() {
            return Err(SetupError::KeyNotSet.into());
        }
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        let recv_ctl = self.clone();
        threads.push(std::thread::spawn(move || recv_ctl.run_recv_thread()));
        let send_ctl = self.clone();
        threads.push(std::thread::spawn(move || send_ctl.run_send_thread()));
        let tick_ctl = self.clone();
        threads.push(std::thread::spawn(move || tick_ctl.run_tick_thread()));
        Ok(())
    }

    pub fn connect(&self) {
        *self.inner.state.lock() = ControllerState::WaitInitAck;
        *self.inner.state_change_time.lock() = now();
        *self.inner.connection_init_time.lock() = now();
        self.notify_state(ControllerState::WaitInitAck);
        self.send_init();
    }

    /// Tears down in the dependency order the original observes: signal
    /// shutdown, unblock the receive thread by closing the socket,
    /// poison the send queue, join every worker, then release audio
    /// devices and zero the key material.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Relaxed);
        self.inner.socket.close();
        let _ = self.inner.send_tx.send(None);
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(input) = self.inner.audio_input.lock().as_mut() {
            input.stop();
        }
        if let Some(output) = self.inner.audio_output.lock().as_mut() {
            output.stop();
        }
        if let Some(key) = self.inner.shared_key.write().as_mut() {
            key.fill(0);
        }
    }

    // -- send path (HandleAudioInput) -------------------------------------

    /// Invoked from the audio capture callback with one encoded frame.
    /// Drops the frame while stopping, stalled, or within the post-stall
    /// suppression window. `audio_packet_grouping` is pinned to 1 per the
    /// preserved upstream behavior (see DESIGN.md) so every frame becomes
    /// its own `PKT_STREAM_DATA` packet.
    pub fn handle_audio_input(&self, stream_id: u8, pts: u32, frame: &[u8]) {
        if self.inner.stopping.load(Ordering::Relaxed) || self.inner.seq.should_suppress_sends() {
            return;
        }
        let mut payload = Vec::with_capacity(7 + frame.len());
        let len16 = frame.len() > 255;
        let flags = stream_id | if len16 { crate::types::STREAM_DATA_FLAG_LEN16 } else { 0 };
        payload.push(flags);
        if len16 {
            payload.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        } else {
            payload.push(frame.len() as u8);
        }
        payload.extend_from_slice(&pts.to_le_bytes());
        payload.extend_from_slice(frame);
        while payload.len() % 4 != 0 {
            payload.push(0);
        }
        self.send_legacy(PacketType::StreamData, payload, None);
    }

    fn send_legacy(&self, pkt_type: PacketType, payload: Vec<u8>, only_to: Option<EndpointId>) {
        let (seq, ack_id, ack_mask) = self.inner.seq.on_send(now());
        self.send_legacy_framed(pkt_type, payload, seq, ack_id, ack_mask, only_to);
    }

    /// Shares the framing/enqueue path with `send_legacy`, but takes an
    /// already-allocated seq/ack triple — used by the reliable queue,
    /// which must frame a retransmission with the exact seq it recorded
    /// for ack matching rather than allocate a fresh one. `only_to`, when
    /// set, addresses the packet to that specific endpoint rather than
    /// `current` — used for per-endpoint pinging, where the destination
    /// is the endpoint under test, not wherever traffic currently flows.
    fn send_legacy_framed(&self, pkt_type: PacketType, payload: Vec<u8>, seq: u32, ack_id: u32, ack_mask: u32, only_to: Option<EndpointId>) {
        let target = match only_to {
            Some(id) => self.endpoint_address(id),
            None => self.current_endpoint_address(),
        };
        let Some((addr, port, tag)) = target else { return };
        if pkt_type.is_data() {
            self.inner.congestion.lock().packet_sent(seq, payload.len() as u32, now());
        }
        let pkt = OutPacket { addr, port, tag, framing: OutFraming::Legacy { pkt_type: pkt_type.as_u8(), ack_id, seq, ack_mask, payload } };
        self.enqueue(pkt);
    }

    fn current_endpoint_address(&self) -> Option<(IpAddr, u16, [u8; 16])> {
        let id = self.inner.endpoints.lock().current?;
        self.endpoint_address(id)
    }

    /// Resolves a specific endpoint's destination address/port/tag —
    /// relay endpoints address by `peer_tag`, P2P/LAN endpoints by our
    /// own `call_id`.
    fn endpoint_address(&self, id: EndpointId) -> Option<(IpAddr, u16, [u8; 16])> {
        let table = self.inner.endpoints.lock();
        let e = table.get(id)?;
        let addr = e.addr_v4.map(IpAddr::V4).or_else(|| e.addr_v6.map(IpAddr::V6))?;
        let tag = if e.kind.is_relay() { e.peer_tag } else { *self.inner.call_id.lock() };
        Some((addr, e.port, tag))
    }

    fn enqueue(&self, pkt: OutPacket) {
        if self.inner.send_tx.try_send(Some(pkt)).is_err() {
            eprintln!("[send] queue full, dropping packet");
        }
    }

    // -- reliable control messages ----------------------------------------

    pub fn send_reliably(&self, pkt_type: PacketType, payload: Vec<u8>, retry_interval: f64, timeout: f64) {
        self.inner.reliable.lock().enqueue(QueuedReliable::new(pkt_type, payload, retry_interval, timeout));
    }

    /// Toggles one of our own outgoing streams and informs the peer.
    pub fn set_stream_enabled(&self, stream_id: u8, enabled: bool) {
        if let Some(stream) = self.inner.local_streams.lock().iter_mut().find(|s| s.id == stream_id) {
            stream.enabled = enabled;
        }
        self.send_reliably(PacketType::StreamState, vec![stream_id, enabled as u8], 0.5, 10.0);
    }

    fn send_init(&self) {
        let network = *self.inner.network_type.lock();
        let data_saving = self.inner.config.read().data_saving;
        let mut flags = 0u32;
        if data_saving == crate::types::DataSavingMode::Always || (data_saving == crate::types::DataSavingMode::Mobile && network.is_mobile()) {
            flags |= INIT_FLAG_DATA_SAVING;
        }
        let payload = InitPayload { proto_ver: PROTOCOL_VERSION, min_proto_ver: MIN_PROTOCOL_VERSION, flags, audio_codecs: vec![1], video_codecs: vec![] };
        let data = handshake::encode_init(&payload);
        self.broadcast_extended(PacketType::Init, Some(data));
    }

    fn send_init_ack(&self) {
        let streams = self.inner.local_streams.lock().clone();
        let payload = InitAckPayload { proto_ver: PROTOCOL_VERSION, min_proto_ver: MIN_PROTOCOL_VERSION, streams };
        let peer_version = self.inner.peer_version.load(Ordering::Relaxed).max(PROTOCOL_VERSION);
        let data = handshake::encode_init_ack(&payload, peer_version);
        self.broadcast_extended(PacketType::InitAck, Some(data));
    }

    fn broadcast_extended(&self, pkt_type: PacketType, data: Option<Vec<u8>>) {
        let now_t = now();
        let (seq, ack_id, ack_mask) = self.inner.seq.on_send(now_t);
        let targets: Vec<(IpAddr, u16, [u8; 16])> = {
            let table = self.inner.endpoints.lock();
            table
                .iter()
                .filter_map(|(_, e)| {
                    let addr = e.addr_v4.map(IpAddr::V4).or_else(|| e.addr_v6.map(IpAddr::V6))?;
                    let tag = if e.kind.is_relay() { e.peer_tag } else { *self.inner.call_id.lock() };
                    Some((addr, e.port, tag))
                })
                .collect()
        };
        let mut fields = ExtendedFields::default();
        fields.proto = Some(PROTOCOL_NAME);
        fields.call_id = Some(*self.inner.call_id.lock());
        fields.seq = Some(seq);
        fields.recent_recv = Some((ack_id, ack_mask));
        for (addr, port, tag) in targets {
            self.enqueue(OutPacket { addr, port, tag, framing: OutFraming::Extended { pkt_type: pkt_type.as_u8(), fields: fields.clone(), data: data.clone() } });
        }
    }

    // -- threads -----------------------------------------------------------

    fn run_send_thread(&self) {
        loop {
            let Ok(item) = self.inner.send_rx.recv() else { break };
            let Some(pkt) = item else { break };
            let network = *self.inner.network_type.lock();

            let wire = match pkt.framing {
                OutFraming::Raw(body) => body,
                OutFraming::Legacy { pkt_type, ack_id, seq, ack_mask, payload } => {
                    let Some(key) = *self.inner.shared_key.read() else { continue };
                    let fp = self.inner.fingerprint.load(Ordering::Relaxed);
                    let x = if self.inner.outgoing { 0 } else { 8 };
                    framing::encode_legacy(self.inner.crypto.as_ref(), pkt.tag, fp, &key, x, pkt_type, ack_id, seq, ack_mask, &payload)
                }
                OutFraming::Extended { pkt_type, fields, data } => {
                    let Some(key) = *self.inner.shared_key.read() else { continue };
                    let fp = self.inner.fingerprint.load(Ordering::Relaxed);
                    let x = if self.inner.outgoing { 0 } else { 8 };
                    framing::encode_extended(self.inner.crypto.as_ref(), pkt.tag, fp, &key, x, pkt_type, &fields, data.as_deref())
                }
            };
            self.inner.stats.record_sent(network, wire.len());
            if let Err(e) = self.inner.socket.send(pkt.addr, pkt.port, &wire) {
                eprintln!("[send] {e}");
            }
        }
    }

    /// `receive()` is expected to wake periodically (on a read timeout)
    /// even when no datagram is pending, so this loop re-checks
    /// `stopping` on every such wakeup rather than parking forever in a
    /// single blocking call `close()` might not actually interrupt.
    fn run_recv_thread(&self) {
        loop {
            if self.inner.stopping.load(Ordering::Relaxed) {
                break;
            }
            let Some((addr, port, datagram)) = self.inner.socket.receive() else { continue };
            if self.try_handle_raw_reflector_reply(addr, port, &datagram) {
                continue;
            }
            let Some(key) = *self.inner.shared_key.read() else { continue };
            let fp = self.inner.fingerprint.load(Ordering::Relaxed);
            let x = if self.inner.outgoing { 8 } else { 0 };
            let expect_tag = self.expected_tag_for(addr, port);
            let Some(expect_tag) = expect_tag else { continue };
            match framing::decode(self.inner.crypto.as_ref(), &datagram, &key, x, expect_tag, fp) {
                Ok(frame) => self.handle_frame(addr, port, frame, datagram.len()),
                Err(_rejected) => continue,
            }
        }
    }

    /// A reflector reply is never encrypted/framed (§4.6): it's the
    /// relay's `peer_tag[16] || 0xFF×16` echoed back, followed by the
    /// raw `TLID_UDP_REFLECTOR_PEER_INFO` body. Recognized here before
    /// the normal decode path, which would otherwise just drop it as a
    /// hash mismatch. Returns `true` if the datagram was consumed.
    fn try_handle_raw_reflector_reply(&self, addr: IpAddr, port: u16, datagram: &[u8]) -> bool {
        if datagram.len() < 32 || !datagram[16..32].iter().all(|&b| b == 0xFF) {
            return false;
        }
        let tag: [u8; 16] = datagram[0..16].try_into().unwrap();
        let table = self.inner.endpoints.lock();
        let is_known_relay = table.iter().any(|(_, e)| e.kind.is_relay() && e.peer_tag == tag);
        drop(table);
        if !is_known_relay {
            return false;
        }
        self.handle_reflector_reply(&datagram[32..], addr, port);
        true
    }

    fn expected_tag_for(&self, addr: IpAddr, port: u16) -> Option<[u8; 16]> {
        let table = self.inner.endpoints.lock();
        for (_, e) in table.iter() {
            let matches_addr = e.addr_v4.map(IpAddr::V4) == Some(addr) || e.addr_v6.map(IpAddr::V6) == Some(addr);
            if matches_addr && e.port == port {
                return Some(if e.kind.is_relay() { e.peer_tag } else { *self.inner.call_id.lock() });
            }
        }
        // Unknown source (e.g. a reflector reply from the relay's own
        // address): accept relay-tagged traffic so the reflector
        // handshake can proceed before the endpoint exists.
        let preferred_relay = table.preferred_relay;
        drop(table);
        preferred_relay.and_then(|id| self.inner.endpoints.lock().get(id).map(|e| e.peer_tag))
    }

    fn handle_frame(&self, addr: IpAddr, port: u16, frame: Frame, wire_len: usize) {
        *self.inner.last_recv_time.lock() = now();
        let network = *self.inner.network_type.lock();
        self.inner.stats.record_received(network, wire_len);

        match frame {
            Frame::Legacy { pkt_type, ack_id, seq, ack_mask, payload } => {
                let Some(pt) = PacketType::from_u8(pkt_type) else { return };
                if self.anti_hijack_should_drop(addr, port, pt) {
                    return;
                }
                self.handle_seq_ack(seq, ack_id, ack_mask);
                self.dispatch_legacy(pt, payload, addr, port);
            }
            Frame::Extended { pkt_type, data, fields } => {
                if let Some(seq) = fields.seq {
                    let ack_id = fields.recent_recv.map(|(a, _)| a).unwrap_or(0);
                    let ack_mask = fields.recent_recv.map(|(_, m)| m).unwrap_or(0);
                    self.handle_seq_ack(seq, ack_id, ack_mask);
                }
                if let Some(cid) = fields.call_id {
                    if cid != *self.inner.call_id.lock() {
                        self.fail(ControllerError::Unknown);
                        return;
                    }
                }
                if let Some(pt) = PacketType::from_u8(pkt_type) {
                    self.dispatch_extended(pt, data, addr, port);
                }
            }
        }
    }

    fn handle_seq_ack(&self, pseq: u32, ack_id: u32, ack_mask: u32) {
        use crate::seq::RecvOutcome;
        let now_t = now();
        match self.inner.seq.on_receive(pseq, now_t) {
            RecvOutcome::Duplicate | RecvOutcome::TooOld => return,
            RecvOutcome::Fresh => {}
        }
        if let Some(update) = self.inner.seq.on_ack(ack_id, ack_mask, now_t) {
            {
                let mut cc = self.inner.congestion.lock();
                for &s in &update.acked_seqs {
                    cc.packet_acknowledged(s, now_t);
                }
                cc.on_ack_horizon_advanced(ack_id);
            }
            self.inner.reliable.lock().apply_ack(self.inner.seq.last_remote_ack_seq(), &update.acked_seqs);
            self.inner.seq.maybe_clear_stall(&update.acked_seqs);
        }
    }

    fn dispatch_legacy(&self, pkt_type: PacketType, payload: Vec<u8>, addr: IpAddr, port: u16) {
        match pkt_type {
            PacketType::Ping => self.send_legacy(PacketType::Pong, payload, None),
            PacketType::Pong => self.handle_pong(payload, addr, port),
            PacketType::LanEndpoint => self.handle_lan_endpoint(payload),
            PacketType::StreamData | PacketType::StreamDataX2 | PacketType::StreamDataX3 => self.handle_stream_data(payload),
            PacketType::StreamState => self.handle_stream_state(payload),
            PacketType::NetworkChanged => self.reset_p2p_candidates_and_reprobe(),
            PacketType::Nop => {}
            _ => {}
        }
    }

    /// A data packet arriving from a relay address while `current` is
    /// P2P is spurious unless the P2P path has gone quiet for 32+
    /// sequences without an ack, in which case it's read as the peer
    /// having migrated networks: switch to that relay and re-probe.
    fn anti_hijack_should_drop(&self, addr: IpAddr, port: u16, pkt_type: PacketType) -> bool {
        if !pkt_type.is_data() {
            return false;
        }
        let mut table = self.inner.endpoints.lock();
        let current_is_p2p = table.current.map(|id| table.get(id).map(|e| e.kind.is_p2p()).unwrap_or(false)).unwrap_or(false);
        if !current_is_p2p {
            return false;
        }
        let relay_id = table
            .iter()
            .find(|(_, e)| e.kind.is_relay() && e.port == port && (e.addr_v4.map(IpAddr::V4) == Some(addr) || e.addr_v6.map(IpAddr::V6) == Some(addr)))
            .map(|(id, _)| id);
        let Some(relay_id) = relay_id else { return false };
        let stale = self.inner.seq.out_seq().wrapping_sub(self.inner.seq.last_remote_ack_seq()) >= 32;
        if !stale {
            return true;
        }
        table.current = Some(relay_id);
        drop(table);
        self.request_reflector_probe();
        false
    }

    /// Un-groups a `PKT_STREAM_DATA`/`_X2`/`_X3` payload into its
    /// constituent `(stream_id, pts, bytes)` frames (§4.9) and hands each
    /// to the jitter buffer. Grouping is pinned to 1 on send but decode
    /// still accepts however many frames the peer packed in.
    fn handle_stream_data(&self, payload: Vec<u8>) {
        let mut off = 0usize;
        while off + 6 <= payload.len() {
            let flags_byte = payload[off];
            let _stream_id = flags_byte & !crate::types::STREAM_DATA_FLAG_LEN16;
            let len16 = flags_byte & crate::types::STREAM_DATA_FLAG_LEN16 != 0;
            off += 1;
            let len = if len16 {
                if off + 2 > payload.len() {
                    break;
                }
                let l = u16::from_le_bytes(payload[off..off + 2].try_into().unwrap()) as usize;
                off += 2;
                l
            } else {
                let l = payload[off] as usize;
                off += 1;
                l
            };
            if off + 4 > payload.len() {
                break;
            }
            let pts = u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
            off += 4;
            if off + len > payload.len() {
                break;
            }
            let bytes = &payload[off..off + len];
            off += len;
            if let Some(jb) = self.inner.jitter_buffer.lock().as_mut() {
                jb.handle_input(bytes, pts);
            }
            if len == 0 {
                break;
            }
        }
    }

    /// `(stream_id, enabled)` pairs; updates the controller's view of
    /// which peer streams are currently live.
    fn handle_stream_state(&self, payload: Vec<u8>) {
        let mut peer_streams = self.inner.peer_streams.lock();
        for chunk in payload.chunks_exact(2) {
            let id = chunk[0];
            let enabled = chunk[1] != 0;
            if let Some(stream) = peer_streams.iter_mut().find(|s| s.id == id) {
                stream.enabled = enabled;
            }
        }
    }

    fn dispatch_extended(&self, pkt_type: PacketType, data: Option<Vec<u8>>, _addr: IpAddr, _port: u16) {
        match pkt_type {
            PacketType::Init => self.handle_init(data),
            PacketType::InitAck => self.handle_init_ack(data),
            _ => {}
        }
    }

    fn handle_init(&self, data: Option<Vec<u8>>) {
        let Some(data) = data else { return };
        let Some(payload) = handshake::decode_init(&data) else { return };
        if !handshake::version_compatible(PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, payload.proto_ver, payload.min_proto_ver) {
            self.fail(ControllerError::Incompatible);
            return;
        }
        if self.inner.peer_version.load(Ordering::Relaxed) == 0 {
            self.inner.peer_version.store(payload.proto_ver, Ordering::Relaxed);
            if payload.flags & INIT_FLAG_DATA_SAVING != 0 {
                self.inner.data_saving_requested_by_peer.store(true, Ordering::Relaxed);
            }
        }
        self.send_init_ack();
    }

    fn handle_init_ack(&self, data: Option<Vec<u8>>) {
        if *self.inner.state.lock() != ControllerState::WaitInitAck {
            return;
        }
        let Some(data) = data else { return };
        let peer_version = self.inner.peer_version.load(Ordering::Relaxed).max(MIN_PROTOCOL_VERSION);
        let Some(payload) = handshake::decode_init_ack(&data, peer_version) else { return };
        if !handshake::version_compatible(PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, payload.proto_ver, payload.min_proto_ver) {
            self.fail(ControllerError::Incompatible);
            return;
        }
        self.inner.peer_version.store(payload.proto_ver, Ordering::Relaxed);
        *self.inner.peer_streams.lock() = payload.streams;
        *self.inner.state.lock() = ControllerState::Established;
        *self.inner.state_change_time.lock() = now();
        self.notify_state(ControllerState::Established);
        if self.inner.allow_p2p.load(Ordering::Relaxed) {
            self.request_reflector_probe();
        }
    }

    /// Sends a 32-byte reflector probe to the preferred relay and, if
    /// different, the peer's preferred relay (§4.6).
    fn request_reflector_probe(&self) {
        let table = self.inner.endpoints.lock();
        let mut targets = Vec::with_capacity(2);
        for relay_id in [table.preferred_relay, table.peer_preferred_relay].into_iter().flatten() {
            if targets.iter().any(|(id, ..): &(EndpointId, IpAddr, u16, [u8; 16])| *id == relay_id) {
                continue;
            }
            let Some(relay) = table.get(relay_id) else { continue };
            let Some(addr) = relay.addr_v4.map(IpAddr::V4).or_else(|| relay.addr_v6.map(IpAddr::V6)) else { continue };
            targets.push((relay_id, addr, relay.port, relay.peer_tag));
        }
        drop(table);
        if targets.is_empty() {
            return;
        }
        self.inner.waiting_for_relay_info.store(true, Ordering::Relaxed);
        *self.inner.relay_request_time.lock() = now();
        for (_, addr, port, tag) in targets {
            let mut body = tag.to_vec();
            body.extend_from_slice(&[0xFFu8; 16]);
            self.enqueue(OutPacket { addr, port, tag, framing: OutFraming::Raw(body) });
        }
    }

    /// Our own reflector reply encoding: TLID(4) | my_ip(4) | my_port(2)
    /// | peer_ip(4) | peer_port(2), all in network byte order.
    fn handle_reflector_reply(&self, data: &[u8], _addr: IpAddr, _port: u16) {
        if data.len() < 4 + 4 + 2 + 4 + 2 {
            return;
        }
        let tlid = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if tlid != crate::types::TLID_UDP_REFLECTOR_PEER_INFO {
            return;
        }
        let my_ip = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]);
        let peer_ip = std::net::Ipv4Addr::new(data[10], data[11], data[12], data[13]);
        let peer_port = u16::from_be_bytes(data[14..16].try_into().unwrap());
        self.inner.waiting_for_relay_info.store(false, Ordering::Relaxed);

        let mut table = self.inner.endpoints.lock();
        table.remove_all_of_kind(EndpointKind::P2pInet);
        table.remove_all_of_kind(EndpointKind::P2pLan);
        let endpoint = Endpoint::new(0, EndpointKind::P2pInet, Some(peer_ip), None, peer_port, [0u8; 16]);
        table.insert(endpoint);
        let shared_nat = my_ip == peer_ip;
        drop(table);

        if shared_nat {
            if let Some(local_ip) = local_ipv4_address() {
                let mut payload = local_ip.octets().to_vec();
                payload.extend_from_slice(&self.inner.socket.local_port().to_le_bytes());
                self.send_reliably(PacketType::LanEndpoint, payload, 0.5, 10.0);
            }
        }
    }

    fn handle_lan_endpoint(&self, payload: Vec<u8>) {
        if payload.len() < 6 {
            return;
        }
        let addr = std::net::Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
        let port = u16::from_le_bytes(payload[4..6].try_into().unwrap());
        let mut table = self.inner.endpoints.lock();
        let endpoint = Endpoint::new(0, EndpointKind::P2pLan, Some(addr), None, port, [0u8; 16]);
        table.replace_kind(EndpointKind::P2pLan, endpoint);
    }

    fn handle_pong(&self, payload: Vec<u8>, addr: IpAddr, port: u16) {
        if payload.len() < 4 {
            return;
        }
        let echoed_seq = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let now_t = now();
        let mut table = self.inner.endpoints.lock();
        for (_, e) in table.iter_mut() {
            let matches = e.addr_v4.map(IpAddr::V4) == Some(addr) || e.addr_v6.map(IpAddr::V6) == Some(addr);
            if matches && e.port == port && e.last_ping_seq == echoed_seq {
                e.push_rtt(now_t - e.last_ping_time);
            }
        }
    }

    // -- tick thread ---------------------------------------------------

    fn run_tick_thread(&self) {
        let mut last_stall_scan = now();
        let mut last_loss_scan = now();
        while !self.inner.stopping.load(Ordering::Relaxed) {
            let now_t = now();
            self.tick_handshake_retransmit(now_t);
            self.tick_reliable_queue(now_t);
            self.tick_pings(now_t);
            self.tick_path_switching(now_t);
            self.tick_congestion_and_bitrate(now_t);
            self.inner.seq.tick_suppression_counter();

            if now_t - last_stall_scan >= STALL_SCAN_INTERVAL {
                last_stall_scan = now_t;
                let low_speed = self.inner.network_type.lock().is_low_speed();
                self.inner.seq.tick_stall_detection(low_speed);
            }
            if now_t - last_loss_scan >= LOSS_SCAN_INTERVAL {
                last_loss_scan = now_t;
                self.tick_loss_sample();
            }

            self.check_timeouts(now_t);
            std::thread::sleep(std::time::Duration::from_secs_f64(TICK_INTERVAL));
        }
    }

    fn tick_handshake_retransmit(&self, now_t: f64) {
        if *self.inner.state.lock() == ControllerState::WaitInitAck {
            let change_time = *self.inner.state_change_time.lock();
            if now_t - change_time > INIT_RETRANSMIT_INTERVAL {
                self.send_init();
                *self.inner.state_change_time.lock() = now_t;
            }
        }
    }

    fn tick_reliable_queue(&self, now_t: f64) {
        let to_send = self.inner.reliable.lock().tick(now_t, || self.inner.seq.on_send(now_t));
        for (pkt_type, payload, seq, ack_id, ack_mask) in to_send {
            self.send_legacy_framed(pkt_type, payload, seq, ack_id, ack_mask, None);
        }
    }

    fn tick_pings(&self, now_t: f64) {
        let mut table = self.inner.endpoints.lock();
        let mut due = Vec::new();
        for (id, e) in table.iter_mut() {
            if now_t - e.last_ping_time >= PING_INTERVAL {
                e.last_ping_seq = e.last_ping_seq.wrapping_add(1);
                e.last_ping_time = now_t;
                due.push((id, e.last_ping_seq));
            }
        }
        drop(table);
        for (id, seq) in due {
            self.send_legacy(PacketType::Ping, seq.to_le_bytes().to_vec(), Some(id));
        }
        if self.inner.waiting_for_relay_info.load(Ordering::Relaxed) {
            let req_time = *self.inner.relay_request_time.lock();
            if now_t - req_time >= REFLECTOR_RETRY_INTERVAL {
                self.request_reflector_probe();
            }
        }
    }

    /// The relay/P2P/LAN switching policy, evaluated every tick while
    /// `Established`.
    fn tick_path_switching(&self, _now_t: f64) {
        if *self.inner.state.lock() != ControllerState::Established {
            return;
        }
        let mut table = self.inner.endpoints.lock();
        if let (Some(preferred), Some(best)) = (table.preferred_relay, table.best_relay()) {
            if best != preferred {
                let preferred_rtt = table.get(preferred).map(|e| e.average_rtt).unwrap_or(f64::MAX);
                let best_rtt = table.get(best).map(|e| e.average_rtt).unwrap_or(f64::MAX);
                if best_rtt > 0.0 && best_rtt < preferred_rtt * RELAY_SWITCH_THRESHOLD {
                    table.preferred_relay = Some(best);
                }
            }
        }

        let current_is_relay = table.current.map(|id| table.get(id).map(|e| e.kind.is_relay()).unwrap_or(false)).unwrap_or(false);
        if current_is_relay {
            let min_ping = table.current.and_then(|id| table.get(id)).map(|e| e.average_rtt).unwrap_or(f64::MAX);
            if let Some(lan) = table.find_by_kind(EndpointKind::P2pLan) {
                let rtt = table.get(lan).map(|e| e.average_rtt).unwrap_or(0.0);
                if rtt > 0.0 && rtt < min_ping * RELAY_TO_P2P_THRESHOLD {
                    table.current = Some(lan);
                }
            } else if let Some(inet) = table.find_by_kind(EndpointKind::P2pInet) {
                let rtt = table.get(inet).map(|e| e.average_rtt).unwrap_or(0.0);
                if rtt > 0.0 && rtt < min_ping * RELAY_TO_P2P_THRESHOLD {
                    table.current = Some(inet);
                }
            }
        } else if let (Some(current), Some(preferred)) = (table.current, table.preferred_relay) {
            let current_rtt = table.get(current).map(|e| e.average_rtt).unwrap_or(f64::MAX);
            let relay_rtt = table.get(preferred).map(|e| e.average_rtt).unwrap_or(f64::MAX);
            if relay_rtt > 0.0 && relay_rtt < current_rtt * P2P_TO_RELAY_THRESHOLD {
                table.current = Some(preferred);
            }
        }
    }

    fn tick_congestion_and_bitrate(&self, now_t: f64) {
        if *self.inner.state.lock() != ControllerState::Established {
            return;
        }
        self.inner.congestion.lock().tick(now_t);
        let action = self.inner.congestion.lock().get_bandwidth_control_action();
        let network = *self.inner.network_type.lock();
        let data_saving = self.inner.config.read().data_saving;
        let peer_saving = self.inner.data_saving_requested_by_peer.load(Ordering::Relaxed);
        let mut bitrate = self.inner.bitrate.lock();
        let ceiling = bitrate.ceiling(network, data_saving, peer_saving);
        let new_bitrate = bitrate.apply_bandwidth_action(action, ceiling);
        drop(bitrate);
        if let Some(encoder) = self.inner.encoder.lock().as_mut() {
            encoder.set_bitrate(new_bitrate);
        }
    }

    /// Every 1s: derive a per-frame loss fraction from the jitter
    /// buffer's cumulative lost-packet counter, feed it into the
    /// 10-sample sliding window, and push the resulting FEC/packet-loss
    /// hint to the encoder once a full window is available (§4.8).
    fn tick_loss_sample(&self) {
        let Some(jb) = self.inner.jitter_buffer.lock().as_ref().map(|jb| jb.lost_packet_count()) else { return };
        let mut last = self.inner.last_loss_sample_lost.lock();
        let delta = jb.saturating_sub(*last);
        *last = jb;
        drop(last);

        let frame_ms = self.inner.local_streams.lock().first().map(|s| s.frame_duration_ms).unwrap_or(60).max(1);
        let expected_per_sec = (1000 / frame_ms as u32).max(1);
        let loss_fraction = (delta as f64 / expected_per_sec as f64).min(1.0);

        let hint = self.inner.bitrate.lock().sample_loss(loss_fraction);
        if let Some(hint) = hint {
            if let Some(encoder) = self.inner.encoder.lock().as_mut() {
                encoder.set_packet_loss(hint);
            }
        }
    }

    fn check_timeouts(&self, now_t: f64) {
        let state = *self.inner.state.lock();
        match state {
            ControllerState::WaitInit | ControllerState::WaitInitAck => {
                let init_time = *self.inner.connection_init_time.lock();
                let timeout = self.inner.config.read().init_timeout;
                if init_time > 0.0 && now_t - init_time >= timeout {
                    self.fail(ControllerError::Timeout);
                }
            }
            ControllerState::Established => {
                let recv_timeout = self.inner.config.read().recv_timeout;
                let last_recv = *self.inner.last_recv_time.lock();
                if now_t - last_recv >= recv_timeout {
                    let mut table = self.inner.endpoints.lock();
                    let current_is_p2p = table.current.map(|id| table.get(id).map(|e| e.kind.is_p2p()).unwrap_or(false)).unwrap_or(false);
                    if current_is_p2p {
                        if let Some(relay) = table.preferred_relay {
                            table.current = Some(relay);
                        }
                        for (_, e) in table.iter_mut() {
                            if e.kind.is_p2p() {
                                e.clear_rtts();
                            }
                        }
                        let all_relays_timed_out = table.iter().filter(|(_, e)| e.kind.is_relay()).all(|(_, e)| e.average_rtt == 0.0);
                        drop(table);
                        if all_relays_timed_out {
                            self.fail(ControllerError::Timeout);
                        } else {
                            self.request_reflector_probe();
                        }
                    }
                }
            }
            ControllerState::Failed => {}
        }
    }

    fn fail(&self, error: ControllerError) {
        *self.inner.last_error.lock() = Some(error);
        *self.inner.state.lock() = ControllerState::Failed;
        *self.inner.state_change_time.lock() = now();
        self.notify_state(ControllerState::Failed);
    }

    fn notify_state(&self, state: ControllerState) {
        if let Some(cb) = self.inner.state_callback.lock().as_ref() {
            cb(state);
        }
        let snapshot = DebugInfo {
            timestamp: now(),
            state: format!("{state:?}"),
            current_endpoint: self.inner.endpoints.lock().current.map(|id| format!("{id:?}")),
            average_rtt: self.inner.seq.average_rtt(),
            bitrate: self.inner.bitrate.lock().current_bitrate(),
            send_loss_percent: 0.0,
        };
        self.inner.debug_log.lock().push(&snapshot);
    }
}

/// First non-loopback IPv4 address on the host, used to fill in the LAN
/// candidate announced to the peer once a reflector reply shows both
/// sides share a public address (same NAT).
fn local_ipv4_address() -> Option<std::net::Ipv4Addr> {
    let interfaces = get_if_addrs::get_if_addrs().ok()?;
    interfaces.into_iter().find(|i| !i.is_loopback() && i.ip().is_ipv4()).and_then(|i| match i.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::JsonServerConfig;
    use crate::testutil::{LoopbackSocket, RecordingJitterBuffer};

    fn fresh_controller() -> Controller {
        let (sock, _peer) = LoopbackSocket::pair(1, 2);
        let ctl = Controller::new(Arc::new(sock), Arc::new(JsonServerConfig::new()), true);
        ctl.set_encryption_key([1u8; 256]).unwrap();
        ctl
    }

    #[test]
    fn handle_stream_data_delivers_single_frame_to_jitter_buffer() {
        let ctl = fresh_controller();
        let jb = RecordingJitterBuffer::default();
        let received = jb.received.clone();
        ctl.set_jitter_buffer(Box::new(jb));

        let mut payload = vec![0u8, 5u8]; // stream_id 0, len 5 (8-bit)
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(b"hello");
        ctl.handle_stream_data(payload);

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (b"hello".to_vec(), 42));
    }

    #[test]
    fn handle_stream_data_decodes_grouped_x2_frames() {
        let ctl = fresh_controller();
        let jb = RecordingJitterBuffer::default();
        let received = jb.received.clone();
        ctl.set_jitter_buffer(Box::new(jb));

        let mut payload = Vec::new();
        for (pts, bytes) in [(1u32, b"ab".as_slice()), (2u32, b"cde".as_slice())] {
            payload.push(0u8); // flags: stream_id 0, len16 unset
            payload.push(bytes.len() as u8);
            payload.extend_from_slice(&pts.to_le_bytes());
            payload.extend_from_slice(bytes);
        }
        ctl.handle_stream_data(payload);

        let got = received.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (b"ab".to_vec(), 1));
        assert_eq!(got[1], (b"cde".to_vec(), 2));
    }

    #[test]
    fn handle_stream_state_updates_matching_peer_stream() {
        let ctl = fresh_controller();
        *ctl.inner.peer_streams.lock() = vec![Stream { id: 3, kind: StreamKind::Audio, codec_tag: 1, frame_duration_ms: 60, enabled: true }];
        ctl.handle_stream_state(vec![3, 0]);
        assert!(!ctl.inner.peer_streams.lock()[0].enabled);
    }

    #[test]
    fn anti_hijack_drops_relay_sourced_data_while_p2p_is_fresh() {
        let ctl = fresh_controller();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(addr), None, 9000, [7u8; 16]);
        let p2p = Endpoint::new(2, EndpointKind::P2pInet, Some(Ipv4Addr::new(10, 0, 0, 2)), None, 9001, [0u8; 16]);
        let mut table = ctl.inner.endpoints.lock();
        let relay_id = table.insert(relay);
        let p2p_id = table.insert(p2p);
        table.current = Some(p2p_id);
        table.preferred_relay = Some(relay_id);
        drop(table);

        assert!(ctl.anti_hijack_should_drop(IpAddr::V4(addr), 9000, PacketType::StreamData));
    }

    #[test]
    fn anti_hijack_treats_stale_p2p_as_migration_and_switches_to_relay() {
        let ctl = fresh_controller();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(addr), None, 9000, [7u8; 16]);
        let p2p = Endpoint::new(2, EndpointKind::P2pInet, Some(Ipv4Addr::new(10, 0, 0, 2)), None, 9001, [0u8; 16]);
        let mut table = ctl.inner.endpoints.lock();
        let relay_id = table.insert(relay);
        let p2p_id = table.insert(p2p);
        table.current = Some(p2p_id);
        table.preferred_relay = Some(relay_id);
        drop(table);

        for _ in 0..40 {
            ctl.inner.seq.on_send(now());
        }

        assert!(!ctl.anti_hijack_should_drop(IpAddr::V4(addr), 9000, PacketType::StreamData));
        assert_eq!(ctl.inner.endpoints.lock().current, Some(relay_id));
    }

    /// §4.6 "Periodic pinging": every endpoint due for a ping gets one
    /// addressed to *itself*, not just whichever is `current` — a relay
    /// or P2P candidate that never becomes current must still be able
    /// to earn an RTT sample so the switching policy can see it.
    #[test]
    fn tick_pings_addresses_every_due_endpoint_not_just_current() {
        let ctl = fresh_controller();
        let current_relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(Ipv4Addr::new(10, 0, 0, 1)), None, 9000, [1u8; 16]);
        let other_relay = Endpoint::new(2, EndpointKind::UdpRelay, Some(Ipv4Addr::new(10, 0, 0, 2)), None, 9001, [2u8; 16]);

        let mut table = ctl.inner.endpoints.lock();
        let current_id = table.insert(current_relay);
        let other_id = table.insert(other_relay);
        table.current = Some(current_id);
        table.preferred_relay = Some(current_id);
        drop(table);

        ctl.tick_pings(now());

        let mut seen_addrs = Vec::new();
        while let Ok(Some(pkt)) = ctl.inner.send_rx.try_recv() {
            seen_addrs.push(pkt.addr);
        }
        assert_eq!(seen_addrs.len(), 2, "both endpoints are due for a ping this tick");
        assert!(seen_addrs.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(
            seen_addrs.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            "the non-current endpoint must be pinged at its own address, not silently dropped or redirected to current"
        );

        let table = ctl.inner.endpoints.lock();
        assert!(table.get(other_id).unwrap().last_ping_time > 0.0, "the non-current endpoint's ping bookkeeping must still advance");
    }

    /// Scenario 5 (§8): a P2P path gone quiet past `recv_timeout` falls
    /// back to the preferred relay, with its RTT history cleared so the
    /// switching policy doesn't immediately pull it back.
    #[test]
    fn established_p2p_receive_timeout_falls_back_to_preferred_relay() {
        let ctl = fresh_controller();
        *ctl.inner.state.lock() = ControllerState::Established;
        ctl.inner.config.write().recv_timeout = 5.0;

        // A relay only counts as reachable once it has an RTT sample
        // (pinged by `tick_pings` every 10s regardless of the current
        // path); a relay that's never answered looks identical to a
        // relay that's timed out, so give it one here the way a real
        // call would have accumulated before `recv_timeout` (20s
        // default) elapses.
        let mut relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(Ipv4Addr::new(10, 0, 0, 1)), None, 9000, [7u8; 16]);
        relay.push_rtt(0.05);
        let mut p2p = Endpoint::new(2, EndpointKind::P2pInet, Some(Ipv4Addr::new(10, 0, 0, 2)), None, 9001, [0u8; 16]);
        p2p.push_rtt(0.1);
        let mut table = ctl.inner.endpoints.lock();
        let relay_id = table.insert(relay);
        let p2p_id = table.insert(p2p);
        table.current = Some(p2p_id);
        table.preferred_relay = Some(relay_id);
        drop(table);

        let stale_recv = now() - 10.0;
        *ctl.inner.last_recv_time.lock() = stale_recv;
        ctl.check_timeouts(now());

        let table = ctl.inner.endpoints.lock();
        assert_eq!(table.current, Some(relay_id));
        assert_eq!(table.get(p2p_id).unwrap().average_rtt, 0.0);
        assert_eq!(ctl.state(), ControllerState::Established, "a still-live relay must not fail the call");
    }

    #[test]
    fn raw_reflector_reply_is_recognized_and_installs_p2p_endpoint() {
        let ctl = fresh_controller();
        let relay_addr = Ipv4Addr::new(10, 0, 0, 1);
        let relay_tag = [9u8; 16];
        let relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(relay_addr), None, 9000, relay_tag);
        ctl.inner.endpoints.lock().insert(relay);

        let mut datagram = relay_tag.to_vec();
        datagram.extend_from_slice(&[0xFFu8; 16]);
        datagram.extend_from_slice(&crate::types::TLID_UDP_REFLECTOR_PEER_INFO.to_le_bytes());
        datagram.extend_from_slice(&[203, 0, 113, 5]); // my_ip, as seen by relay
        datagram.extend_from_slice(&[0u8; 2]); // unused
        datagram.extend_from_slice(&[203, 0, 113, 9]); // peer_ip
        datagram.extend_from_slice(&9050u16.to_be_bytes()); // peer_port

        let consumed = ctl.try_handle_raw_reflector_reply(IpAddr::V4(relay_addr), 9000, &datagram);
        assert!(consumed);

        let table = ctl.inner.endpoints.lock();
        assert!(table.iter().any(|(_, e)| e.kind == EndpointKind::P2pInet && e.addr_v4 == Some(Ipv4Addr::new(203, 0, 113, 9)) && e.port == 9050));
    }

    #[test]
    fn reflector_reply_with_wrong_tlid_is_ignored() {
        let ctl = fresh_controller();
        let relay_addr = Ipv4Addr::new(10, 0, 0, 1);
        let relay_tag = [9u8; 16];
        let relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(relay_addr), None, 9000, relay_tag);
        ctl.inner.endpoints.lock().insert(relay);

        let mut datagram = relay_tag.to_vec();
        datagram.extend_from_slice(&[0xFFu8; 16]);
        datagram.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes()); // wrong TLID
        datagram.extend_from_slice(&[203, 0, 113, 5]);
        datagram.extend_from_slice(&[0u8; 2]);
        datagram.extend_from_slice(&[203, 0, 113, 9]);
        datagram.extend_from_slice(&9050u16.to_be_bytes());

        // still consumed (it matches the raw envelope) but must not
        // install a P2P endpoint since the TLID doesn't match.
        let consumed = ctl.try_handle_raw_reflector_reply(IpAddr::V4(relay_addr), 9000, &datagram);
        assert!(consumed);

        let table = ctl.inner.endpoints.lock();
        assert!(!table.iter().any(|(_, e)| e.kind == EndpointKind::P2pInet));
    }

    #[test]
    fn non_reflector_datagram_is_not_consumed_as_raw() {
        let ctl = fresh_controller();
        let relay_addr = Ipv4Addr::new(10, 0, 0, 1);
        let relay = Endpoint::new(1, EndpointKind::UdpRelay, Some(relay_addr), None, 9000, [9u8; 16]);
        ctl.inner.endpoints.lock().insert(relay);

        // Looks like a framed packet (doesn't end in 16 bytes of 0xFF).
        let datagram = vec![0u8; 40];
        assert!(!ctl.try_handle_raw_reflector_reply(IpAddr::V4(relay_addr), 9000, &datagram));
    }
}
