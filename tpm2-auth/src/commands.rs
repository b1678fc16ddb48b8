// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! High-level TPM operations
//!
//! [`TpmContext`] pairs a transport with a crypto provider and exposes the
//! sealed-data workflow: provision a storage key, seal bytes under an
//! authorization policy, and unseal them through an HMAC-verified policy
//! session. The container format holding sealed blobs and any CLI surface
//! live outside this crate; everything here takes and returns byte slices.

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::auth::{derive_auth_value, put_password_auth_area};
use crate::constants::{TpmAlgId, TpmCc, TpmaSa};
use crate::crypto::{CryptoProvider, OsCrypto};
use crate::error::{Error, Result};
use crate::marshal::{Marshal, ResponseBuffer, Unmarshal};
use crate::policy::PolicyBinding;
use crate::session::Session;
use crate::transport::{execute, TpmCommand, TpmDevice, Transport};
use crate::types::{Tpm2bSensitiveCreate, TpmlDigest, TpmlDigestValues, TpmlPcrSelection, TpmtPublic};

/// A sealed-data blob as returned by the TPM: the object's public area and
/// the encrypted private area. How these are containerized on disk is the
/// caller's concern.
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

/// Transport + crypto pair driving one TPM
pub struct TpmContext {
    tpm: Box<dyn Transport>,
    crypto: Box<dyn CryptoProvider>,
}

impl TpmContext {
    /// Open a TPM device node (auto-detected when `path` is `None`) with the
    /// OS crypto provider.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let device = match path {
            Some(p) => TpmDevice::open(p)?,
            None => TpmDevice::detect()?,
        };
        Ok(Self::with_parts(Box::new(device), Box::new(OsCrypto)))
    }

    /// Build a context over an injected transport and crypto provider.
    pub fn with_parts(tpm: Box<dyn Transport>, crypto: Box<dyn CryptoProvider>) -> Self {
        Self { tpm, crypto }
    }

    /// Split borrows for code that drives [`Session`] directly.
    pub fn parts(&mut self) -> (&mut dyn Transport, &dyn CryptoProvider) {
        (&mut *self.tpm, &*self.crypto)
    }

    // ==================== Random Number Generation ====================

    /// Draw `count` bytes from the TPM's hardware RNG.
    ///
    /// The TPM may return fewer bytes than requested per command, so large
    /// requests are satisfied in chunks.
    pub fn get_random(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(count);

        while result.len() < count {
            let remaining = count - result.len();
            let request_size = remaining.min(48) as u16; // typical TPM per-command limit

            let mut cmd = TpmCommand::new(TpmCc::GetRandom);
            cmd.add_u16(request_size);

            let response = execute(&mut *self.tpm, &cmd.finalize())?;
            response.ensure_success()?;

            let mut buf = response.data_buffer();
            let random_bytes = buf.get_tpm2b()?;
            if random_bytes.is_empty() {
                return Err(Error::Internal("TPM returned no random bytes".into()));
            }
            result.extend_from_slice(&random_bytes);
        }

        result.truncate(count);
        Ok(result)
    }

    // ==================== PCR operations ====================

    /// Read the selected PCR values, returned as (index, digest) pairs.
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);

        let response = execute(&mut *self.tpm, &cmd.finalize())?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let _update_counter = buf.get_u32()?;
        let selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digests = TpmlDigest::unmarshal(&mut buf)?;

        let mut result = Vec::new();
        let mut digest_idx = 0;
        for sel in &selection_out.pcr_selections {
            for pcr_idx in sel.indices() {
                if digest_idx < digests.digests.len() {
                    result.push((pcr_idx, digests.digests[digest_idx].clone()));
                    digest_idx += 1;
                }
            }
        }
        Ok(result)
    }

    /// Extend a PCR with a digest in the given bank.
    pub fn pcr_extend(&mut self, pcr: u32, digest: &[u8], alg: TpmAlgId) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::PcrExtend);
        cmd.add_handle(pcr);
        put_password_auth_area(cmd.buffer_mut(), b"");
        cmd.add(&TpmlDigestValues::single(alg, digest.to_vec()));

        execute(&mut *self.tpm, &cmd.finalize())?.ensure_success()?;
        debug!("extended PCR {pcr}");
        Ok(())
    }

    // ==================== Object plumbing ====================

    /// Read an object's public area and TPM-computed Name.
    pub fn read_public(&mut self, handle: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let response = execute(&mut *self.tpm, &cmd.finalize())?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let public_area = buf.get_tpm2b()?;
        let name = buf.get_tpm2b()?;
        Ok((public_area, name))
    }

    /// Create a primary storage key under the given hierarchy and return
    /// (handle, publicArea). The transient handle must be flushed when the
    /// caller is done with it.
    pub fn create_primary(&mut self, hierarchy: u32, template: &TpmtPublic) -> Result<(u32, Vec<u8>)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        put_password_auth_area(cmd.buffer_mut(), b"");
        cmd.add(&Tpm2bSensitiveCreate::default());
        cmd.add_tpm2b(&template.to_bytes());
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default()); // creationPCR

        let response = execute(&mut *self.tpm, &cmd.finalize())?;
        response.ensure_success()?;

        // Responses to handle-returning commands carry the handle before
        // the parameter size.
        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;
        let _param_size = buf.get_u32()?;
        let public_area = buf.get_tpm2b()?;

        debug!("created primary key with handle 0x{handle:08x}");
        Ok((handle, public_area))
    }

    /// Flush a transient object or session handle.
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);
        execute(&mut *self.tpm, &cmd.finalize())?.ensure_success()
    }

    // ==================== Seal / unseal ====================

    /// Seal `data` under the storage key at `parent_handle`.
    ///
    /// The object's authValue is derived from `auth_bytes` (all-zero digest
    /// for empty auth) and its authPolicy is `policy_digest` — typically the
    /// output of [`crate::policy::build_policy_digest`] or
    /// [`crate::policy::combine_policy_or`].
    pub fn seal(
        &mut self,
        data: &[u8],
        parent_handle: u32,
        parent_auth: &[u8],
        auth_bytes: &[u8],
        policy_digest: &[u8],
        auth_hash: TpmAlgId,
    ) -> Result<SealedBlob> {
        let auth_value = derive_auth_value(&*self.crypto, auth_bytes, auth_hash)?;
        let template = TpmtPublic::sealed_object(auth_hash, policy_digest.to_vec());

        let sensitive = Tpm2bSensitiveCreate {
            user_auth: auth_value.to_vec(),
            data: data.to_vec(),
        };

        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(parent_handle);
        put_password_auth_area(cmd.buffer_mut(), parent_auth);
        cmd.add(&sensitive);
        cmd.add_tpm2b(&template.to_bytes());
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default()); // creationPCR

        let command_bytes = cmd.finalize();
        let response = execute(&mut *self.tpm, &command_bytes)?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let _param_size = buf.get_u32()?;
        let private = buf.get_tpm2b()?;
        let public = buf.get_tpm2b()?;

        debug!("sealed {} bytes under 0x{parent_handle:08x}", data.len());
        Ok(SealedBlob { public, private })
    }

    /// Load a sealed object under its parent, returning (handle, Name).
    pub fn load(
        &mut self,
        parent_handle: u32,
        parent_auth: &[u8],
        blob: &SealedBlob,
    ) -> Result<(u32, Vec<u8>)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Load);
        cmd.add_handle(parent_handle);
        put_password_auth_area(cmd.buffer_mut(), parent_auth);
        cmd.add_tpm2b(&blob.private);
        cmd.add_tpm2b(&blob.public);

        let response = execute(&mut *self.tpm, &cmd.finalize())?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;
        let _param_size = buf.get_u32()?;
        let name = buf.get_tpm2b()?;

        debug!("loaded sealed object with handle 0x{handle:08x}");
        Ok((handle, name))
    }

    /// Recover sealed plaintext through an HMAC-verified policy session.
    ///
    /// Loads the blob, starts a policy session, satisfies `policy`, and
    /// issues `TPM2_Unseal` with full command/response authorization. The
    /// loaded object and the session are flushed on every path; the
    /// plaintext is returned in a zero-on-drop buffer.
    pub fn unseal(
        &mut self,
        blob: &SealedBlob,
        parent_handle: u32,
        parent_auth: &[u8],
        auth_bytes: &[u8],
        policy: &PolicyBinding,
        auth_hash: TpmAlgId,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let auth_value = derive_auth_value(&*self.crypto, auth_bytes, auth_hash)?;
        let (object_handle, name) = self.load(parent_handle, parent_auth, blob)?;

        let mut session = match Session::start_policy(&mut *self.tpm, &*self.crypto, auth_hash) {
            Ok(s) => s,
            Err(e) => {
                let _ = self.flush_context(object_handle);
                return Err(e);
            }
        };

        let exchange_result = session.exchange(
            &mut *self.tpm,
            &*self.crypto,
            TpmCc::Unseal,
            object_handle,
            &name,
            &auth_value,
            &[], // Unseal has no command parameters
            TpmaSa::new().with_continue_session(),
            policy,
        );

        // exchange() already flushed the session on failure; close() is
        // idempotent and covers the success path.
        let _ = session.close(&mut *self.tpm);
        let _ = self.flush_context(object_handle);

        let mut params = exchange_result?;
        let plaintext = {
            let mut buf = ResponseBuffer::new(&params);
            Zeroizing::new(buf.get_tpm2b()?)
        };
        params.zeroize();

        debug!("unsealed {} bytes", plaintext.len());
        Ok(plaintext)
    }
}
