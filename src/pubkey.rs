//! X25519 public keys and the anonymous cryptobox.
//!
//! A public key is a bare 32-byte Curve25519 point with lexicographic
//! ordering, display encodings (lowercase hex and base-57), and an
//! ephemeral-static envelope: the sender generates a throwaway key pair,
//! derives a shared key against the recipient's static key, and the
//! recipient recovers it from the ephemeral public carried in front of the
//! ciphertext. Nobody but the recipient can even tell who the box is for.
//!
//! Base-57 uses digits and Latin letters minus `B D I O l`, chosen so no
//! two characters are easily confused when read aloud or copied by hand.
//! Each 8-byte big-endian block of the key maps to exactly 11 characters,
//! 44 in total.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::codec::{Context, Wire};
use crate::endian::Be64;

/// Cryptobox overhead: ephemeral public key plus the auth tag.
pub const BOX_OVERHEAD: usize = 32 + 16;

/// Cryptobox payload limit, fixed at 2^28 bytes by the envelope format;
/// not a tunable.
pub const BOX_LIMIT: usize = 0x1000_0000;

const BASE57_PALETTE: &[u8; 57] = b"0123456789ACEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const fn base57_lut() -> [u8; 256] {
    let mut lut = [57u8; 256];
    let mut i = 0;
    while i < BASE57_PALETTE.len() {
        lut[BASE57_PALETTE[i] as usize] = i as u8;
        i += 1;
    }
    lut
}

const BASE57_LUT: [u8; 256] = base57_lut();

/// X25519 public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Public key matching a private key (base-point multiplication).
    pub fn from_priv(priv_key: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*priv_key);
        Self(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Shared key for this public and the given private key: X25519
    /// followed by SHA-512 over the raw 32-byte shared point.
    pub fn shared(&self, priv_key: &[u8; 32]) -> [u8; 64] {
        let secret = StaticSecret::from(*priv_key);
        let point = secret.diffie_hellman(&x25519_dalek::PublicKey::from(self.0));

        let digest = Sha512::digest(point.as_bytes());
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        out
    }

    /// Seal `plain` to this key. `out` must be `plain.len() + 48` bytes:
    /// the ephemeral public key, the ciphertext, and the 16-byte tag.
    ///
    /// The AEAD nonce is all zeros: the encryption key is derived from a
    /// fresh ephemeral secret every call, so it is never reused. The
    /// ephemeral public key is bound in as associated data.
    pub fn encrypt(&self, plain: &[u8], out: &mut [u8]) -> bool {
        if plain.len() > BOX_LIMIT || out.len() != plain.len() + BOX_OVERHEAD {
            return false;
        }

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = x25519_dalek::PublicKey::from(&ephemeral);
        let point = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(self.0));

        let mut shared = Zeroizing::new([0u8; 64]);
        shared.copy_from_slice(&Sha512::digest(point.as_bytes()));

        out[..32].copy_from_slice(ephemeral_pub.as_bytes());

        let cipher = Aes256Gcm::new_from_slice(&shared[..32]).expect("AES-256 key size");
        let sealed = match cipher.encrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: plain,
                aad: ephemeral_pub.as_bytes(),
            },
        ) {
            Ok(sealed) => sealed,
            Err(_) => return false,
        };

        out[32..].copy_from_slice(&sealed);
        true
    }

    /// Open a cryptobox sealed to `priv_key`. `boxed` must be
    /// `plain.len() + 48` bytes; returns `false` when authentication
    /// fails.
    pub fn decrypt(priv_key: &[u8; 32], boxed: &[u8], plain: &mut [u8]) -> bool {
        if plain.len() > BOX_LIMIT || boxed.len() != plain.len() + BOX_OVERHEAD {
            return false;
        }

        let mut ephemeral_pub = [0u8; 32];
        ephemeral_pub.copy_from_slice(&boxed[..32]);

        let shared = Zeroizing::new(Self(ephemeral_pub).shared(priv_key));
        let cipher = Aes256Gcm::new_from_slice(&shared[..32]).expect("AES-256 key size");

        match cipher.decrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: &boxed[32..],
                aad: &ephemeral_pub,
            },
        ) {
            Ok(opened) => {
                plain.copy_from_slice(&opened);
                true
            }
            Err(_) => false,
        }
    }

    /// Lowercase hex encoding.
    pub fn hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";

        let mut out = String::with_capacity(64);
        for &byte in &self.0 {
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 15) as usize] as char);
        }
        out
    }

    /// Base-57 encoding: four 8-byte big-endian blocks of 11 characters.
    pub fn base57(&self) -> String {
        let mut out = vec![0u8; 44];

        for (block, chunk) in self.0.chunks_exact(8).enumerate() {
            let mut value = Be64::read(chunk).unwrap_or_default().get();
            for j in (0..11).rev() {
                out[block * 11 + j] = BASE57_PALETTE[(value % 57) as usize];
                value /= 57;
            }
        }

        String::from_utf8(out).expect("palette is ASCII")
    }

    /// Set the key from its 44-character base-57 form. Every character is
    /// validated through a constant lookup; `false` leaves the key
    /// untouched.
    pub fn set_base57(&mut self, text: &str) -> bool {
        let bytes = text.as_bytes();
        if bytes.len() != 44 || bytes.iter().any(|&c| BASE57_LUT[c as usize] >= 57) {
            return false;
        }

        for block in 0..4 {
            let mut value = 0u64;
            for j in 0..11 {
                value = value
                    .wrapping_mul(57)
                    .wrapping_add(BASE57_LUT[bytes[block * 11 + j] as usize] as u64);
            }
            self.0[block * 8..block * 8 + 8].copy_from_slice(&value.to_be_bytes());
        }

        true
    }
}

impl Wire for PublicKey {
    fn traverse(&mut self, ctx: &mut Context<'_>) {
        ctx.copy_bytes(&mut self.0);
    }
}
