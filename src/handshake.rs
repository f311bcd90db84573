//! `PKT_INIT` / `PKT_INIT_ACK` payload encoding and the version
//! negotiation rule. The state transitions themselves (who resends when,
//! what happens on timeout) live in `controller.rs`, since they need the
//! endpoint table and the seq engine; this module is the pure data layer.

use crate::types::{Stream, StreamKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPayload {
    pub proto_ver: u32,
    pub min_proto_ver: u32,
    pub flags: u32,
    pub audio_codecs: Vec<u32>,
    pub video_codecs: Vec<u32>,
}

pub fn encode_init(payload: &InitPayload) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&payload.proto_ver.to_le_bytes());
    out.extend_from_slice(&payload.min_proto_ver.to_le_bytes());
    out.extend_from_slice(&payload.flags.to_le_bytes());
    out.push(payload.audio_codecs.len() as u8);
    for c in &payload.audio_codecs {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out.push(payload.video_codecs.len() as u8);
    for c in &payload.video_codecs {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

pub fn decode_init(data: &[u8]) -> Option<InitPayload> {
    if data.len() < 13 {
        return None;
    }
    let proto_ver = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let min_proto_ver = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let mut off = 12;
    let audio_count = *data.get(off)? as usize;
    off += 1;
    let mut audio_codecs = Vec::with_capacity(audio_count);
    for _ in 0..audio_count {
        audio_codecs.push(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?));
        off += 4;
    }
    let video_count = *data.get(off)? as usize;
    off += 1;
    let mut video_codecs = Vec::with_capacity(video_count);
    for _ in 0..video_count {
        video_codecs.push(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?));
        off += 4;
    }
    Some(InitPayload { proto_ver, min_proto_ver, flags, audio_codecs, video_codecs })
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitAckPayload {
    pub proto_ver: u32,
    pub min_proto_ver: u32,
    pub streams: Vec<Stream>,
}

/// `peer_version < 2` omits the version fields and forces 20ms frames.
pub fn encode_init_ack(payload: &InitAckPayload, peer_version: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if peer_version >= 2 {
        out.extend_from_slice(&payload.proto_ver.to_le_bytes());
        out.extend_from_slice(&payload.min_proto_ver.to_le_bytes());
    }
    out.push(payload.streams.len() as u8);
    for s in &payload.streams {
        out.push(s.id);
        out.push(match s.kind {
            StreamKind::Audio => 0,
            StreamKind::Video => 1,
        });
        out.extend_from_slice(&s.codec_tag.to_le_bytes());
        if peer_version >= 2 {
            out.extend_from_slice(&s.frame_duration_ms.to_le_bytes());
        }
        out.push(s.enabled as u8);
    }
    out
}

pub fn decode_init_ack(data: &[u8], peer_version: u32) -> Option<InitAckPayload> {
    let mut off = 0;
    let (proto_ver, min_proto_ver) = if peer_version >= 2 {
        let p = u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?);
        off += 4;
        let m = u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?);
        off += 4;
        (p, m)
    } else {
        (1, 1)
    };
    let stream_count = *data.get(off)? as usize;
    off += 1;
    let mut streams = Vec::with_capacity(stream_count);
    for _ in 0..stream_count {
        let id = *data.get(off)?;
        off += 1;
        let kind = if *data.get(off)? == 0 { StreamKind::Audio } else { StreamKind::Video };
        off += 1;
        let codec_tag = u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?);
        off += 4;
        let frame_duration_ms = if peer_version >= 2 {
            let v = u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?);
            off += 2;
            v
        } else {
            20
        };
        let enabled = *data.get(off)? != 0;
        off += 1;
        streams.push(Stream { id, kind, codec_tag, frame_duration_ms, enabled });
    }
    Some(InitAckPayload { proto_ver, min_proto_ver, streams })
}

/// Reject if the peer's minimum exceeds our version, or the peer's
/// version is below our minimum.
pub fn version_compatible(our_proto: u32, our_min: u32, peer_proto: u32, peer_min: u32) -> bool {
    !(peer_min > our_proto || peer_proto < our_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn init_round_trips() {
        let payload = InitPayload { proto_ver: 3, min_proto_ver: 3, flags: 0, audio_codecs: vec![1, 2], video_codecs: vec![] };
        let encoded = encode_init(&payload);
        assert_eq!(decode_init(&encoded), Some(payload));
    }

    #[test]
    fn init_ack_round_trips_modern_peer() {
        let payload = InitAckPayload {
            proto_ver: 3,
            min_proto_ver: 3,
            streams: vec![Stream { id: 0, kind: StreamKind::Audio, codec_tag: 1, frame_duration_ms: 60, enabled: true }],
        };
        let encoded = encode_init_ack(&payload, 3);
        assert_eq!(decode_init_ack(&encoded, 3), Some(payload));
    }

    #[test]
    fn init_ack_legacy_peer_forces_20ms() {
        let payload = InitAckPayload {
            proto_ver: 1,
            min_proto_ver: 1,
            streams: vec![Stream { id: 0, kind: StreamKind::Audio, codec_tag: 1, frame_duration_ms: 999, enabled: true }],
        };
        let encoded = encode_init_ack(&payload, 1);
        let decoded = decode_init_ack(&encoded, 1).unwrap();
        assert_eq!(decoded.streams[0].frame_duration_ms, 20);
    }

    #[test]
    fn version_policy_rejects_incompatible() {
        assert!(version_compatible(3, 3, 3, 3));
        assert!(!version_compatible(3, 3, 2, 2));
        assert!(!version_compatible(3, 1, 5, 5));
    }
}
