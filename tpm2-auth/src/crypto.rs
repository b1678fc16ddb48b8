// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives for session authorization
//!
//! The session core only ever touches crypto through [`CryptoProvider`], so
//! tests can substitute a deterministic implementation. Production code uses
//! [`OsCrypto`], backed by the operating system RNG and the RustCrypto hash
//! and HMAC implementations.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};

/// Hashing, HMAC and randomness as consumed by the session core.
pub trait CryptoProvider {
    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>>;

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Constant-time comparison of `tag` against HMAC(key, data).
    fn hmac_verify(&self, alg: TpmAlgId, key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool>;

    /// Cryptographically strong random bytes. A failing RNG is a fatal
    /// configuration error, not something callers recover from.
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>>;
}

/// Default provider: OS RNG + RustCrypto digests.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCrypto;

fn unsupported(alg: TpmAlgId) -> Error {
    Error::InvalidInput(format!("unsupported hash algorithm: {alg:?}"))
}

impl CryptoProvider for OsCrypto {
    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>> {
        let digest = match alg {
            TpmAlgId::Sha1 => Sha1::digest(data).to_vec(),
            TpmAlgId::Sha256 => Sha256::digest(data).to_vec(),
            TpmAlgId::Sha384 => Sha384::digest(data).to_vec(),
            TpmAlgId::Sha512 => Sha512::digest(data).to_vec(),
            other => return Err(unsupported(other)),
        };
        Ok(digest)
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        macro_rules! tag {
            ($digest:ty) => {{
                let mut mac = Hmac::<$digest>::new_from_slice(key)
                    .expect("HMAC accepts any key size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }};
        }

        let out = match alg {
            TpmAlgId::Sha1 => tag!(Sha1),
            TpmAlgId::Sha256 => tag!(Sha256),
            TpmAlgId::Sha384 => tag!(Sha384),
            TpmAlgId::Sha512 => tag!(Sha512),
            other => return Err(unsupported(other)),
        };
        Ok(out)
    }

    fn hmac_verify(&self, alg: TpmAlgId, key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
        macro_rules! verify {
            ($digest:ty) => {{
                let mut mac = Hmac::<$digest>::new_from_slice(key)
                    .expect("HMAC accepts any key size");
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }};
        }

        let ok = match alg {
            TpmAlgId::Sha1 => verify!(Sha1),
            TpmAlgId::Sha256 => verify!(Sha256),
            TpmAlgId::Sha384 => verify!(Sha384),
            TpmAlgId::Sha512 => verify!(Sha512),
            other => return Err(unsupported(other)),
        };
        Ok(ok)
    }

    fn random_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| Error::Internal(format!("OS RNG failure: {e}")))?;
        Ok(out)
    }
}

/// KDFa counter-mode key derivation (TPM 2.0 Part 1, 11.4.10.2).
///
/// Used for the session key of salted or bound sessions:
/// `sessionKey = KDFa(authHash, bindAuth ‖ salt, "ATH", nonceTPM, nonceCaller)`.
/// `bits` is rounded up to whole bytes; this crate only requests multiples
/// of eight.
pub fn kdf_a(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let want = bits.div_ceil(8) as usize;
    let mut out = Vec::with_capacity(want);
    let mut counter: u32 = 0;

    while out.len() < want {
        counter += 1;
        let mut block = Vec::with_capacity(4 + label.len() + 1 + context_u.len() + context_v.len() + 4);
        block.extend_from_slice(&counter.to_be_bytes());
        block.extend_from_slice(label.as_bytes());
        block.push(0x00);
        block.extend_from_slice(context_u);
        block.extend_from_slice(context_v);
        block.extend_from_slice(&bits.to_be_bytes());
        out.extend_from_slice(&crypto.hmac(alg, key, &block)?);
    }

    out.truncate(want);
    Ok(out)
}
