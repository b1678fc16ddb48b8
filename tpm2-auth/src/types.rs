// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data structures used by the authorization core

use crate::constants::{TpmAlgId, TpmaObject};
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};

/// TPMS_PCR_SELECTION - PCR bitmap for a single hash algorithm
///
/// Two selections are equal iff their bitmaps match exactly per algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>,
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bitmap bytes (PCR 0-23), more if higher indices appear
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        out
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = buf.get_u16()?;
        let hash = TpmAlgId::from_u16(hash_alg)
            .ok_or_else(|| Error::InvalidInput(format!("unknown hash algorithm: 0x{hash_alg:04x}")))?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - list of per-bank PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections.is_empty()
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - list of TPM2B digests (PolicyOR branch list, PCR values)
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Vec<u8>>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            buf.put_tpm2b(d);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(buf.get_tpm2b()?);
        }
        Ok(Self { digests })
    }
}

/// TPML_DIGEST_VALUES - tagged digests for PCR extend
#[derive(Debug, Clone)]
pub struct TpmlDigestValues {
    pub digests: Vec<(TpmAlgId, Vec<u8>)>,
}

impl TpmlDigestValues {
    pub fn single(alg: TpmAlgId, digest: Vec<u8>) -> Self {
        Self {
            digests: vec![(alg, digest)],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for (alg, digest) in &self.digests {
            buf.put_u16(alg.to_u16());
            buf.put_bytes(digest);
        }
    }
}

/// TPMT_SYM_DEF - symmetric algorithm for session parameter encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

/// TPM2B_SENSITIVE_CREATE - auth value + data for object creation
#[derive(Debug, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&self.user_auth);
        inner.put_tpm2b(&self.data);
        buf.put_tpm2b(inner.as_bytes());
    }
}

/// TPMT_PUBLIC - object public-area template
#[derive(Debug, Clone)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Vec<u8>,
}

impl TpmtPublic {
    /// RSA-2048 storage key template (decrypt-restricted parent)
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Vec::new(),
        }
    }

    /// Keyedhash sealed-data template bound to an authorization policy
    pub fn sealed_object(name_alg: TpmAlgId, auth_policy: Vec<u8>) -> Self {
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth(),
            auth_policy,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        buf.put_tpm2b(&self.auth_policy);
        match self.type_alg {
            TpmAlgId::Rsa => {
                // TPMS_RSA_PARMS: symmetric, scheme (null), keyBits, exponent
                TpmtSymDef::aes_128_cfb().marshal(buf);
                buf.put_u16(TpmAlgId::Null.to_u16());
                buf.put_u16(2048);
                buf.put_u32(0);
                // unique: TPM2B_PUBLIC_KEY_RSA, empty in a template
                buf.put_tpm2b_empty();
            }
            _ => {
                // TPMS_KEYEDHASH_PARMS: scheme (null); unique: empty digest
                buf.put_u16(TpmAlgId::Null.to_u16());
                buf.put_tpm2b_empty();
            }
        }
    }
}

/// Compute the TPM-canonical Name of an object: `nameAlg ‖ H_nameAlg(publicArea)`.
///
/// `public_area` is the marshalled TPMT_PUBLIC without its TPM2B size prefix.
pub fn object_name(
    crypto: &dyn CryptoProvider,
    name_alg: TpmAlgId,
    public_area: &[u8],
) -> Result<Vec<u8>> {
    let digest = crypto.hash(name_alg, public_area)?;
    let mut name = Vec::with_capacity(2 + digest.len());
    name.extend_from_slice(&name_alg.to_u16().to_be_bytes());
    name.extend_from_slice(&digest);
    Ok(name)
}
