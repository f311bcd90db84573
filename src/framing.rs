//! Wire framing codec: the two packet shapes ("legacy"/simple audio block
//! and "extended"/decrypted audio block) that share a common header
//! prefix, encryption scheme, and TL-style length encoding.

use crate::crypto::{derive_key_iv, Crypto};
use crate::types::{
    PFLAG_CALL_ID, PFLAG_DATA, PFLAG_EXTRA, PFLAG_PROTO, PFLAG_RECENT_RECV, PFLAG_SEQ,
    PROTOCOL_NAME, TLID_DECRYPTED_AUDIO_BLOCK, TLID_SIMPLE_AUDIO_BLOCK,
};

/// 16-byte prefix identifying the session on the wire: a relay's
/// `peer_tag` for relay-bound packets, or the `call_id` for direct P2P
/// packets.
pub type WireTag = [u8; 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeReject {
    TagMismatch,
    FingerprintMismatch,
    HashMismatch,
    UnknownTlId,
    MissingSeqOrRecentRecv,
    ProtocolMarkerMismatch,
}

/// Optional fields carried by the extended framing, gated by bits in
/// `pflags`.
#[derive(Debug, Clone, Default)]
pub struct ExtendedFields {
    pub call_id: Option<[u8; 16]>,
    pub proto: Option<u32>,
    pub extra: Option<Vec<u8>>,
    pub seq: Option<u32>,
    pub recent_recv: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub enum Frame {
    /// "Simple audio block" — all post-handshake traffic.
    Legacy {
        pkt_type: u8,
        ack_id: u32,
        seq: u32,
        ack_mask: u32,
        payload: Vec<u8>,
    },
    /// "Decrypted audio block" — used for `PKT_INIT`/`PKT_INIT_ACK`.
    Extended {
        pkt_type: u8,
        data: Option<Vec<u8>>,
        fields: ExtendedFields,
    },
}

/// Values <= 253 take one byte; larger values take a 254 marker followed
/// by a 3-byte little-endian length.
pub fn write_tl_len(out: &mut Vec<u8>, len: usize) {
    if len <= 253 {
        out.push(len as u8);
    } else {
        out.push(254);
        out.push((len & 0xFF) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push(((len >> 16) & 0xFF) as u8);
    }
}

/// Returns `(value, bytes_consumed)`.
pub fn read_tl_len(buf: &[u8]) -> Option<(usize, usize)> {
    let marker = *buf.first()?;
    if marker <= 253 {
        Some((marker as usize, 1))
    } else {
        let b = buf.get(1..4)?;
        Some(((b[0] as usize) | ((b[1] as usize) << 8) | ((b[2] as usize) << 16), 4))
    }
}

fn write_tl_string(out: &mut Vec<u8>, bytes: &[u8]) {
    write_tl_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn read_tl_string(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, prefix) = read_tl_len(buf)?;
    let body = buf.get(prefix..prefix + len)?;
    Some((body.to_vec(), prefix + len))
}

fn pad_to_16(buf: &mut Vec<u8>) {
    let rem = buf.len() % 16;
    if rem != 0 {
        buf.resize(buf.len() + (16 - rem), 0);
    }
}

fn random_padding(crypto: &dyn Crypto, out: &mut Vec<u8>) {
    let mut random64 = [0u8; 8];
    crypto.rand_bytes(&mut random64);
    out.extend_from_slice(&random64);

    let mut len_byte = [0u8; 1];
    crypto.rand_bytes(&mut len_byte);
    let n = (len_byte[0] % 8) as usize; // 0..=7
    let mut random7 = vec![0u8; n];
    crypto.rand_bytes(&mut random7);
    write_tl_string(out, &random7);
}

/// Build the inner (pre-encryption) body for the legacy framing:
/// `len32 | TLID | random64 | random7 | tl_len(body) | body`, padded to a
/// multiple of 16 bytes.
fn build_inner_legacy(crypto: &dyn Crypto, pkt_type: u8, ack_id: u32, seq: u32, ack_mask: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(13 + payload.len());
    body.push(pkt_type);
    body.extend_from_slice(&ack_id.to_le_bytes());
    body.extend_from_slice(&seq.to_le_bytes());
    body.extend_from_slice(&ack_mask.to_le_bytes());
    body.extend_from_slice(payload);

    let mut inner = Vec::with_capacity(4 + 4 + 8 + 1 + body.len() + 16);
    inner.extend_from_slice(&0u32.to_le_bytes()); // len32 placeholder, patched below
    inner.extend_from_slice(&TLID_SIMPLE_AUDIO_BLOCK.to_le_bytes());
    random_padding(crypto, &mut inner);
    write_tl_len(&mut inner, body.len());
    inner.extend_from_slice(&body);
    pad_to_16(&mut inner);

    let total_len = (inner.len() - 4) as u32;
    inner[0..4].copy_from_slice(&total_len.to_le_bytes());
    inner
}

/// Build the inner body for the extended framing:
/// `len32 | TLID | random64 | random7 | pflags | [call_id] [proto] [extra]
/// [data] [seq] [ack_id, ack_mask]`, padded to a multiple of 16 bytes.
fn build_inner_extended(crypto: &dyn Crypto, pkt_type: u8, fields: &ExtendedFields, data: Option<&[u8]>) -> Vec<u8> {
    let mut pflags: u32 = (pkt_type as u32) << 24;
    if data.is_some() {
        pflags |= PFLAG_DATA;
    }
    if fields.extra.is_some() {
        pflags |= PFLAG_EXTRA;
    }
    if fields.call_id.is_some() {
        pflags |= PFLAG_CALL_ID;
    }
    if fields.proto.is_some() {
        pflags |= PFLAG_PROTO;
    }
    if fields.seq.is_some() {
        pflags |= PFLAG_SEQ;
    }
    if fields.recent_recv.is_some() {
        pflags |= PFLAG_RECENT_RECV;
    }

    let mut inner = Vec::with_capacity(64);
    inner.extend_from_slice(&0u32.to_le_bytes());
    inner.extend_from_slice(&TLID_DECRYPTED_AUDIO_BLOCK.to_le_bytes());
    random_padding(crypto, &mut inner);
    inner.extend_from_slice(&pflags.to_le_bytes());

    if let Some(cid) = fields.call_id {
        inner.extend_from_slice(&cid);
    }
    if let Some(proto) = fields.proto {
        inner.extend_from_slice(&proto.to_le_bytes());
    }
    if let Some(extra) = &fields.extra {
        write_tl_string(&mut inner, extra);
    }
    if let Some(data) = data {
        write_tl_string(&mut inner, data);
    }
    if let Some(seq) = fields.seq {
        inner.extend_from_slice(&seq.to_le_bytes());
    }
    if let Some((ack_id, ack_mask)) = fields.recent_recv {
        inner.extend_from_slice(&ack_id.to_le_bytes());
        inner.extend_from_slice(&ack_mask.to_le_bytes());
    }
    pad_to_16(&mut inner);

    let total_len = (inner.len() - 4) as u32;
    inner[0..4].copy_from_slice(&total_len.to_le_bytes());
    inner
}

fn msg_hash(crypto: &dyn Crypto, inner: &[u8]) -> [u8; 16] {
    let full = crypto.sha1(inner);
    full[4..20].try_into().unwrap()
}

fn wrap_encrypted(crypto: &dyn Crypto, tag: WireTag, fingerprint: u64, shared_key: &[u8; 256], x: usize, mut inner: Vec<u8>) -> Vec<u8> {
    let hash = msg_hash(crypto, &inner);
    let (key, iv) = derive_key_iv(crypto, &hash, shared_key, x);
    crypto.aes_ige_encrypt(&mut inner, &key, &iv);

    let mut out = Vec::with_capacity(16 + 8 + 16 + inner.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&fingerprint.to_le_bytes());
    out.extend_from_slice(&hash);
    out.extend_from_slice(&inner);
    out
}

pub fn encode_legacy(
    crypto: &dyn Crypto,
    tag: WireTag,
    fingerprint: u64,
    shared_key: &[u8; 256],
    x: usize,
    pkt_type: u8,
    ack_id: u32,
    seq: u32,
    ack_mask: u32,
    payload: &[u8],
) -> Vec<u8> {
    let inner = build_inner_legacy(crypto, pkt_type, ack_id, seq, ack_mask, payload);
    wrap_encrypted(crypto, tag, fingerprint, shared_key, x, inner)
}

pub fn encode_extended(
    crypto: &dyn Crypto,
    tag: WireTag,
    fingerprint: u64,
    shared_key: &[u8; 256],
    x: usize,
    pkt_type: u8,
    fields: &ExtendedFields,
    data: Option<&[u8]>,
) -> Vec<u8> {
    let inner = build_inner_extended(crypto, pkt_type, fields, data);
    wrap_encrypted(crypto, tag, fingerprint, shared_key, x, inner)
}

/// Decode and decrypt a datagram. `expect_tag`/`expect_fingerprint` gate
/// on the first 16+8 bytes before any decryption happens. `x` is the
/// offset this receiver uses (opposite of what the sender used).
pub fn decode(
    crypto: &dyn Crypto,
    datagram: &[u8],
    shared_key: &[u8; 256],
    x: usize,
    expect_tag: WireTag,
    expect_fingerprint: u64,
) -> Result<Frame, DecodeReject> {
    if datagram.len() < 16 + 8 + 16 + 16 {
        return Err(DecodeReject::HashMismatch);
    }
    let tag: [u8; 16] = datagram[0..16].try_into().unwrap();
    if tag != expect_tag {
        return Err(DecodeReject::TagMismatch);
    }
    let fp = u64::from_le_bytes(datagram[16..24].try_into().unwrap());
    if fp != expect_fingerprint {
        return Err(DecodeReject::FingerprintMismatch);
    }
    let hash: [u8; 16] = datagram[24..40].try_into().unwrap();
    let mut inner = datagram[40..].to_vec();
    if inner.is_empty() || inner.len() % 16 != 0 {
        return Err(DecodeReject::HashMismatch);
    }

    let (key, iv) = derive_key_iv(crypto, &hash, shared_key, x);
    crypto.aes_ige_decrypt(&mut inner, &key, &iv);

    if msg_hash(crypto, &inner) != hash {
        return Err(DecodeReject::HashMismatch);
    }

    parse_inner(&inner)
}

fn parse_inner(inner: &[u8]) -> Result<Frame, DecodeReject> {
    if inner.len() < 8 {
        return Err(DecodeReject::UnknownTlId);
    }
    let len = u32::from_le_bytes(inner[0..4].try_into().unwrap()) as usize;
    if len + 4 > inner.len() {
        return Err(DecodeReject::UnknownTlId);
    }
    let tlid = u32::from_le_bytes(inner[4..8].try_into().unwrap());
    let body = &inner[8..4 + len];

    match tlid {
        TLID_SIMPLE_AUDIO_BLOCK => parse_legacy_body(body),
        TLID_DECRYPTED_AUDIO_BLOCK => parse_extended_body(body),
        _ => Err(DecodeReject::UnknownTlId),
    }
}

fn skip_random_padding(body: &[u8]) -> Option<usize> {
    // random64[8] then a TL string of 0..=7 random bytes.
    let mut off = 8;
    let (rand_len, prefix) = read_tl_len(body.get(off..)?)?;
    off += prefix + rand_len;
    Some(off)
}

fn parse_legacy_body(body: &[u8]) -> Result<Frame, DecodeReject> {
    let mut off = skip_random_padding(body).ok_or(DecodeReject::UnknownTlId)?;
    let (payload_block, consumed) = read_tl_string(body.get(off..).ok_or(DecodeReject::UnknownTlId)?).ok_or(DecodeReject::UnknownTlId)?;
    off += consumed;
    let _ = off;

    if payload_block.len() < 13 {
        return Err(DecodeReject::UnknownTlId);
    }
    let pkt_type = payload_block[0];
    let ack_id = u32::from_le_bytes(payload_block[1..5].try_into().unwrap());
    let seq = u32::from_le_bytes(payload_block[5..9].try_into().unwrap());
    let ack_mask = u32::from_le_bytes(payload_block[9..13].try_into().unwrap());
    let payload = payload_block[13..].to_vec();

    Ok(Frame::Legacy { pkt_type, ack_id, seq, ack_mask, payload })
}

fn parse_extended_body(body: &[u8]) -> Result<Frame, DecodeReject> {
    let mut off = skip_random_padding(body).ok_or(DecodeReject::UnknownTlId)?;
    let pflags = u32::from_le_bytes(body.get(off..off + 4).ok_or(DecodeReject::UnknownTlId)?.try_into().unwrap());
    off += 4;
    let pkt_type = (pflags >> 24) as u8;

    let mut fields = ExtendedFields::default();

    if pflags & PFLAG_CALL_ID != 0 {
        let cid: [u8; 16] = body.get(off..off + 16).ok_or(DecodeReject::UnknownTlId)?.try_into().unwrap();
        fields.call_id = Some(cid);
        off += 16;
    }
    if pflags & PFLAG_PROTO != 0 {
        let p = u32::from_le_bytes(body.get(off..off + 4).ok_or(DecodeReject::UnknownTlId)?.try_into().unwrap());
        if p != PROTOCOL_NAME {
            return Err(DecodeReject::ProtocolMarkerMismatch);
        }
        fields.proto = Some(p);
        off += 4;
    }
    if pflags & PFLAG_EXTRA != 0 {
        let (extra, consumed) = read_tl_string(body.get(off..).ok_or(DecodeReject::UnknownTlId)?).ok_or(DecodeReject::UnknownTlId)?;
        fields.extra = Some(extra);
        off += consumed;
    }
    let mut data = None;
    if pflags & PFLAG_DATA != 0 {
        let (d, consumed) = read_tl_string(body.get(off..).ok_or(DecodeReject::UnknownTlId)?).ok_or(DecodeReject::UnknownTlId)?;
        data = Some(d);
        off += consumed;
    }
    if pflags & PFLAG_SEQ != 0 {
        let seq = u32::from_le_bytes(body.get(off..off + 4).ok_or(DecodeReject::MissingSeqOrRecentRecv)?.try_into().unwrap());
        fields.seq = Some(seq);
        off += 4;
    }
    if pflags & PFLAG_RECENT_RECV != 0 {
        let ack_id = u32::from_le_bytes(body.get(off..off + 4).ok_or(DecodeReject::MissingSeqOrRecentRecv)?.try_into().unwrap());
        off += 4;
        let ack_mask = u32::from_le_bytes(body.get(off..off + 4).ok_or(DecodeReject::MissingSeqOrRecentRecv)?.try_into().unwrap());
        off += 4;
        fields.recent_recv = Some((ack_id, ack_mask));
    }

    if fields.seq.is_none() || fields.recent_recv.is_none() {
        // PKT_INIT/PKT_INIT_ACK always carry both; any other extended
        // frame without them is malformed.
        return Err(DecodeReject::MissingSeqOrRecentRecv);
    }

    Ok(Frame::Extended { pkt_type, data, fields })
}

/// `ack_mask` over the 32 slots following `last_remote_seq`: bit i set
/// iff `recv_times[i]` is nonzero; the highest bit is the oldest slot.
pub fn build_ack_mask(recv_times: &[f64; 32]) -> u32 {
    let mut mask = 0u32;
    for i in 0..32 {
        if recv_times[i] != 0.0 {
            mask |= 1 << (31 - i);
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;
    use pretty_assertions::assert_eq;

    fn roundtrip_legacy(payload_len: usize) {
        let crypto = DefaultCrypto;
        let key = [5u8; 256];
        let tag = [1u8; 16];
        let payload = vec![0xABu8; payload_len];
        let wire = encode_legacy(&crypto, tag, 42, &key, 0, 4, 10, 11, 0xF0F0, &payload);
        let frame = decode(&crypto, &wire, &key, 8, tag, 42).expect("decode");
        match frame {
            Frame::Legacy { pkt_type, ack_id, seq, ack_mask, payload: p } => {
                assert_eq!(pkt_type, 4);
                assert_eq!(ack_id, 10);
                assert_eq!(seq, 11);
                assert_eq!(ack_mask, 0xF0F0);
                assert_eq!(p, payload);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn legacy_round_trip_various_payload_lengths() {
        for len in [0, 253, 254, 1000] {
            roundtrip_legacy(len);
        }
    }

    #[test]
    fn extended_round_trip() {
        let crypto = DefaultCrypto;
        let key = [5u8; 256];
        let tag = [2u8; 16];
        let mut fields = ExtendedFields::default();
        fields.proto = Some(PROTOCOL_NAME);
        fields.seq = Some(1);
        fields.recent_recv = Some((0, 0));
        let data = vec![3, 3, 1, 0, 0]; // proto_ver | min_proto_ver | 0 codecs | 0 codecs
        let wire = encode_extended(&crypto, tag, 7, &key, 0, 1, &fields, Some(&data));
        let frame = decode(&crypto, &wire, &key, 8, tag, 7).expect("decode");
        match frame {
            Frame::Extended { pkt_type, data: d, fields: f } => {
                assert_eq!(pkt_type, 1);
                assert_eq!(d, Some(data));
                assert_eq!(f.seq, Some(1));
                assert_eq!(f.recent_recv, Some((0, 0)));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let crypto = DefaultCrypto;
        let key = [5u8; 256];
        let wire = encode_legacy(&crypto, [1u8; 16], 1, &key, 0, 4, 0, 0, 0, &[]);
        let err = decode(&crypto, &wire, &key, 8, [9u8; 16], 1).unwrap_err();
        assert_eq!(err, DecodeReject::TagMismatch);
    }

    #[test]
    fn tl_len_round_trips() {
        for n in [0usize, 1, 253, 254, 255, 70000] {
            let mut out = Vec::new();
            write_tl_len(&mut out, n);
            let (decoded, _) = read_tl_len(&out).unwrap();
            assert_eq!(decoded, n);
        }
    }
}
