//! Wire protocol constants and small enums shared across modules.

pub const PROTOCOL_NAME: u32 = 0x4772_5650; // "GrVP", little-endian
pub const PROTOCOL_VERSION: u32 = 3;
pub const MIN_PROTOCOL_VERSION: u32 = 3;

pub const TLID_DECRYPTED_AUDIO_BLOCK: u32 = 0xDBF9_48C1;
pub const TLID_SIMPLE_AUDIO_BLOCK: u32 = 0xCC0D_0E76;
pub const TLID_UDP_REFLECTOR_PEER_INFO: u32 = 0x27D9_371C;

pub const PFLAG_DATA: u32 = 1;
pub const PFLAG_EXTRA: u32 = 2;
pub const PFLAG_CALL_ID: u32 = 4;
pub const PFLAG_PROTO: u32 = 8;
pub const PFLAG_SEQ: u32 = 16;
pub const PFLAG_RECENT_RECV: u32 = 32;

pub const STREAM_DATA_FLAG_LEN16: u8 = 0x40;

/// `PKT_INIT.flags` bit requesting the peer honor data-saving bitrate
/// ceilings for the whole call, set when local config has data saving
/// enabled (`always`, or `mobile` while on a mobile network).
pub const INIT_FLAG_DATA_SAVING: u32 = 1;

/// Top-level packet discriminator. Encoded as the high byte of `pflags`
/// in the extended framing and as the `type` byte in the legacy framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Init = 1,
    InitAck = 2,
    StreamState = 3,
    StreamData = 4,
    Ping = 6,
    Pong = 7,
    StreamDataX2 = 8,
    StreamDataX3 = 9,
    LanEndpoint = 10,
    NetworkChanged = 11,
    Nop = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Init,
            2 => Self::InitAck,
            3 => Self::StreamState,
            4 => Self::StreamData,
            6 => Self::Ping,
            7 => Self::Pong,
            8 => Self::StreamDataX2,
            9 => Self::StreamDataX3,
            10 => Self::LanEndpoint,
            11 => Self::NetworkChanged,
            14 => Self::Nop,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Data-carrying types feed the congestion controller on send.
    pub fn is_data(self) -> bool {
        matches!(self, Self::StreamData | Self::StreamDataX2 | Self::StreamDataX3)
    }
}

/// Candidate path kind, used both on the wire (relay vs P2P semantics)
/// and for switching-policy grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    P2pInet,
    P2pLan,
    UdpRelay,
    TcpRelay,
}

impl EndpointKind {
    pub fn is_relay(self) -> bool {
        matches!(self, Self::UdpRelay | Self::TcpRelay)
    }

    pub fn is_p2p(self) -> bool {
        !self.is_relay()
    }
}

/// Classification of the active network interface, reported by the
/// embedder via `Controller::set_network_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Wifi,
    Ethernet,
    Gprs,
    Edge,
    ThreeG,
    Lte,
    OtherHighSpeed,
    OtherLowSpeed,
    OtherMobile,
    Unknown,
}

impl NetworkType {
    pub fn is_mobile(self) -> bool {
        matches!(
            self,
            Self::Gprs | Self::Edge | Self::ThreeG | Self::Lte | Self::OtherMobile
        )
    }

    pub fn is_low_speed(self) -> bool {
        matches!(self, Self::Gprs | Self::Edge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSavingMode {
    Never,
    Mobile,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    WaitInit,
    WaitInitAck,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub id: u8,
    pub kind: StreamKind,
    pub codec_tag: u32,
    pub frame_duration_ms: u16,
    pub enabled: bool,
}
