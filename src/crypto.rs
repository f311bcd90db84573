//! Crypto primitives facade: SHA-1, SHA-256, random bytes, and AES-256 in
//! IGE (infinite garble extension) mode, plus the key derivation function
//! that turns a message hash and the shared 256-byte key into a per-packet
//! AES key/IV pair.
//!
//! The facade is a trait rather than free functions so tests can inject a
//! deterministic RNG; `DefaultCrypto` is the real implementation used by
//! `Controller` outside of tests.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

pub trait Crypto: Send + Sync {
    fn rand_bytes(&self, out: &mut [u8]);
    fn sha1(&self, data: &[u8]) -> [u8; 20];
    fn sha256(&self, data: &[u8]) -> [u8; 32];
    fn aes_ige_encrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]);
    fn aes_ige_decrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]);
}

#[derive(Default)]
pub struct DefaultCrypto;

impl Crypto for DefaultCrypto {
    fn rand_bytes(&self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }

    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn aes_ige_encrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        aes256_ige_crypt(data, key, iv, true);
    }

    fn aes_ige_decrypt(&self, data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
        aes256_ige_crypt(data, key, iv, false);
    }
}

/// AES-256-IGE over `data` in place. `data.len()` must be a multiple of 16.
/// `iv[0..16]` is x_0, `iv[16..32]` is y_0, per the IGE definition:
/// encrypt: y_i = E(x_i xor y_{i-1}) xor x_{i-1};
/// decrypt: x_i = D(y_i xor x_{i-1}) xor y_{i-1}.
fn aes256_ige_crypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32], encrypt: bool) {
    debug_assert_eq!(data.len() % 16, 0, "IGE operates on whole 16-byte blocks");
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_x: [u8; 16] = iv[0..16].try_into().unwrap();
    let mut prev_y: [u8; 16] = iv[16..32].try_into().unwrap();

    for chunk in data.chunks_mut(16) {
        if encrypt {
            let x_i: [u8; 16] = chunk.try_into().unwrap();
            let mut block = [0u8; 16];
            for i in 0..16 {
                block[i] = x_i[i] ^ prev_y[i];
            }
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            let mut y_i = [0u8; 16];
            for i in 0..16 {
                y_i[i] = ga[i] ^ prev_x[i];
            }
            chunk.copy_from_slice(&y_i);
            prev_x = x_i;
            prev_y = y_i;
        } else {
            let y_i: [u8; 16] = chunk.try_into().unwrap();
            let mut block = [0u8; 16];
            for i in 0..16 {
                block[i] = y_i[i] ^ prev_x[i];
            }
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.decrypt_block(&mut ga);
            let mut x_i = [0u8; 16];
            for i in 0..16 {
                x_i[i] = ga[i] ^ prev_y[i];
            }
            chunk.copy_from_slice(&x_i);
            prev_x = x_i;
            prev_y = y_i;
        }
    }
}

/// Derive the AES key and IV for one packet from its 16-byte message hash
/// and the shared 256-byte key, using offset `x` (0 for the outgoing
/// party's own traffic, 8 for the peer's).
pub fn derive_key_iv(crypto: &dyn Crypto, msg_key: &[u8; 16], shared_key: &[u8; 256], x: usize) -> ([u8; 32], [u8; 32]) {
    let a = crypto.sha1(&concat(msg_key, &shared_key[x..x + 32]));
    let b = crypto.sha1(&concat(&shared_key[32 + x..48 + x], &concat(msg_key, &shared_key[48 + x..64 + x])));
    let c = crypto.sha1(&concat(&shared_key[64 + x..96 + x], msg_key));
    let d = crypto.sha1(&concat(msg_key, &shared_key[96 + x..128 + x]));

    let mut aes_key = [0u8; 32];
    aes_key[0..8].copy_from_slice(&a[0..8]);
    aes_key[8..20].copy_from_slice(&b[8..20]);
    aes_key[20..32].copy_from_slice(&c[4..16]);

    let mut aes_iv = [0u8; 32];
    aes_iv[0..12].copy_from_slice(&a[8..20]);
    aes_iv[12..20].copy_from_slice(&b[0..8]);
    aes_iv[20..24].copy_from_slice(&c[16..20]);
    aes_iv[24..32].copy_from_slice(&d[0..8]);

    (aes_key, aes_iv)
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(a.len() + b.len());
    v.extend_from_slice(a);
    v.extend_from_slice(b);
    v
}

/// SHA-1 over the full shared key, low 8 bytes, little-endian as a u64.
pub fn key_fingerprint(crypto: &dyn Crypto, shared_key: &[u8; 256]) -> u64 {
    let h = crypto.sha1(shared_key);
    u64::from_le_bytes(h[0..8].try_into().unwrap())
}

/// SHA-256 over the full shared key, low 16 bytes.
pub fn call_id(crypto: &dyn Crypto, shared_key: &[u8; 256]) -> [u8; 16] {
    let h = crypto.sha256(shared_key);
    h[0..16].try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ige_round_trips() {
        let crypto = DefaultCrypto;
        let key = [7u8; 32];
        let iv = [9u8; 32];
        let mut data = (0..64u8).collect::<Vec<u8>>();
        let original = data.clone();
        crypto.aes_ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, original);
        crypto.aes_ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, original);
    }

    #[test]
    fn kdf_is_pure() {
        let crypto = DefaultCrypto;
        let shared = [3u8; 256];
        let msg_key = [1u8; 16];
        let (k1, iv1) = derive_key_iv(&crypto, &msg_key, &shared, 0);
        let (k2, iv2) = derive_key_iv(&crypto, &msg_key, &shared, 0);
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);
        let (k3, _) = derive_key_iv(&crypto, &msg_key, &shared, 8);
        assert_ne!(k1, k3);
    }
}
