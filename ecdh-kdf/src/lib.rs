// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! ECDH key agreement and handshake session-key derivation
//!
//! The mutual-auth handshake derives its transport keys out of TPM: each
//! side generates an ephemeral P-256 keypair, computes the ECDH shared
//! secret, and expands it with HKDF into two equal-length session keys (one
//! per direction). The handshake transcript messages are bound into the
//! derivation so keys can never be replayed across sessions.

use hkdf::Hkdf;
use p256::elliptic_curve::rand_core::CryptoRngCore;
use sha2::{Sha256, Sha384, Sha512};
use thiserror::Error;
use zeroize::Zeroizing;

pub use p256::{PublicKey, SecretKey};

/// Fixed HKDF salt for the handshake key schedule (wire-compatibility
/// constant, both peers must use it).
const HKDF_SALT: &[u8] = b"kmyth";

#[derive(Debug, Error)]
pub enum Error {
    /// The peer's public key is empty or not a valid curve point
    #[error("invalid peer public key")]
    InvalidPeerKey,

    /// The HKDF cannot produce the requested amount of key material
    #[error("KDF configuration error: {0}")]
    KdfConfiguration(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Hash driving the HKDF expansion. Both peers must agree; Sha512 is the
/// handshake default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KdfHash {
    Sha256,
    Sha384,
    #[default]
    Sha512,
}

/// Generate an ephemeral P-256 keypair for one handshake.
///
/// The RNG is injected so tests can be deterministic; production callers
/// pass `rand::rngs::OsRng`.
pub fn ephemeral_keypair(rng: &mut impl CryptoRngCore) -> (SecretKey, PublicKey) {
    let secret = SecretKey::random(rng);
    let public = secret.public_key();
    (secret, public)
}

/// SEC1 encoding of a public key, as sent to the peer.
pub fn public_key_bytes(public: &PublicKey) -> Vec<u8> {
    public.to_sec1_bytes().into_vec()
}

/// Compute the raw ECDH shared secret against a peer's SEC1-encoded
/// public key.
pub fn shared_secret(local: &SecretKey, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if peer_public.is_empty() {
        return Err(Error::InvalidPeerKey);
    }
    let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::InvalidPeerKey)?;
    let shared = p256::ecdh::diffie_hellman(local.to_nonzero_scalar(), peer.as_affine());
    Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
}

/// Expand an ECDH shared secret into two session keys of `key_len` bytes.
///
/// HKDF-Extract-and-Expand with the fixed salt, ikm = `secret`, and
/// info = `msg1 ‖ msg2` (the two handshake transcript messages). The first
/// half of the output keys one direction, the second half the other.
pub fn derive_session_keys(
    secret: &[u8],
    msg1: &[u8],
    msg2: &[u8],
    key_len: usize,
    hash: KdfHash,
) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>)> {
    let mut info = Vec::with_capacity(msg1.len() + msg2.len());
    info.extend_from_slice(msg1);
    info.extend_from_slice(msg2);

    let mut okm = Zeroizing::new(vec![0u8; 2 * key_len]);
    let expanded = match hash {
        KdfHash::Sha256 => Hkdf::<Sha256>::new(Some(HKDF_SALT), secret).expand(&info, &mut okm),
        KdfHash::Sha384 => Hkdf::<Sha384>::new(Some(HKDF_SALT), secret).expand(&info, &mut okm),
        KdfHash::Sha512 => Hkdf::<Sha512>::new(Some(HKDF_SALT), secret).expand(&info, &mut okm),
    };
    if expanded.is_err() {
        return Err(Error::KdfConfiguration(format!(
            "cannot derive {} bytes of key material with {hash:?}",
            2 * key_len
        )));
    }

    let key1 = Zeroizing::new(okm[..key_len].to_vec());
    let key2 = Zeroizing::new(okm[key_len..].to_vec());
    Ok((key1, key2))
}

/// One side of the handshake key agreement: ECDH against the peer's public
/// key, then the two-key derivation over the shared transcript.
pub fn handshake_keys(
    local: &SecretKey,
    peer_public: &[u8],
    msg1: &[u8],
    msg2: &[u8],
    key_len: usize,
    hash: KdfHash,
) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>)> {
    let secret = shared_secret(local, peer_public)?;
    derive_session_keys(&secret, msg1, msg2, key_len, hash)
}
