// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization sessions
//!
//! A [`Session`] owns the rolling nonce pair, the session key, and the
//! Active/Closed lifecycle of one TPM authorization session. Trial sessions
//! only ever shape a policy digest; policy sessions authorize real commands
//! through [`Session::exchange`], which computes the command authHMAC,
//! dispatches, and verifies the TPM's response authHMAC before any
//! parameter bytes reach the caller.

use zeroize::{Zeroize, Zeroizing};

use crate::auth::{
    auth_hmac, auth_hmac_verify, cp_hash, put_session_auth_area, rp_hash, ResponseAuth,
};
use crate::constants::{tpm_rh, TpmAlgId, TpmCc, TpmSe, TpmaSa};
use crate::crypto::{kdf_a, CryptoProvider};
use crate::error::{Error, Result};
use crate::policy::{self, PolicyBinding};
use crate::transport::{execute, TpmCommand, Transport};
use crate::types::TpmtSymDef;

/// The caller's rolling (newer, older) nonce pair.
///
/// Strictly alternating rolls keep `older` equal to the other party's most
/// recent nonce whenever a command HMAC is computed, and to our own most
/// recent nonce whenever a response HMAC is verified.
#[derive(Debug)]
pub struct NonceBook {
    newer: Zeroizing<Vec<u8>>,
    older: Zeroizing<Vec<u8>>,
}

impl NonceBook {
    /// Start the book with the first caller nonce; `older` starts empty.
    pub fn init(first_newer: Vec<u8>) -> Self {
        Self {
            newer: Zeroizing::new(first_newer),
            older: Zeroizing::new(Vec::new()),
        }
    }

    /// `older ← newer`, `newer ← incoming`. The incoming nonce must match
    /// the established nonce length.
    pub fn roll(&mut self, incoming: Vec<u8>) -> Result<()> {
        if incoming.len() != self.newer.len() {
            return Err(Error::InvalidInput(format!(
                "nonce length {} does not match session nonce length {}",
                incoming.len(),
                self.newer.len()
            )));
        }
        self.older = std::mem::replace(&mut self.newer, Zeroizing::new(incoming));
        Ok(())
    }

    pub fn newer(&self) -> &[u8] {
        &self.newer
    }

    pub fn older(&self) -> &[u8] {
        &self.older
    }

    fn wipe(&mut self) {
        self.newer.zeroize();
        self.older.zeroize();
    }
}

/// Session flavor. HMAC and password sessions are handled elsewhere (the
/// password auth area needs no session object at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Trial,
    Policy,
}

impl SessionType {
    fn to_se(self) -> TpmSe {
        match self {
            SessionType::Trial => TpmSe::Trial,
            SessionType::Policy => TpmSe::Policy,
        }
    }
}

/// Session lifecycle: `Init` while `start` is still assembling state from
/// the StartAuthSession response, `Active` once the handle is usable,
/// `Closed` after flush/wipe. The handle is valid only in `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Closed,
}

/// Optional salt/bind inputs to `StartAuthSession`.
///
/// The salt's RSA encryption under `tpm_key` happens outside this crate;
/// both the plaintext salt and its encryption are passed in together. All
/// shipped flows start unsalted and unbound.
#[derive(Default)]
pub struct SessionBinding<'a> {
    pub tpm_key: Option<u32>,
    pub salt: &'a [u8],
    pub encrypted_salt: &'a [u8],
    pub bind: Option<u32>,
    pub bind_auth_value: &'a [u8],
}

/// One TPM 2.0 authorization session
pub struct Session {
    session_type: SessionType,
    state: SessionState,
    handle: u32,
    auth_hash: TpmAlgId,
    #[allow(dead_code)]
    symmetric: TpmtSymDef,
    /// KDFa-derived key for salted/bound sessions, empty otherwise
    session_key: Zeroizing<Vec<u8>>,
    /// authValue of the bind entity, empty for unbound sessions
    auth_value_bind: Zeroizing<Vec<u8>>,
    salt: Zeroizing<Vec<u8>>,
    /// Last nonce received from the TPM
    nonce_tpm: Zeroizing<Vec<u8>>,
    nonces: NonceBook,
    policy_applied: bool,
}

impl Session {
    /// Issue `TPM2_StartAuthSession` and build the session state.
    ///
    /// Chooses a random caller nonce of the digest length, captures the
    /// assigned handle and the TPM's first nonce, and derives the session
    /// key when a salt or bind entity is present.
    pub fn start(
        tpm: &mut dyn Transport,
        crypto: &dyn CryptoProvider,
        session_type: SessionType,
        binding: SessionBinding<'_>,
        symmetric: TpmtSymDef,
        auth_hash: TpmAlgId,
    ) -> Result<Self> {
        let nonce_len = auth_hash.digest_size();
        if nonce_len == 0 {
            return Err(Error::InvalidInput(format!(
                "not a session hash algorithm: {auth_hash:?}"
            )));
        }
        let nonce_caller = crypto.random_bytes(nonce_len)?;

        let tpm_key = binding.tpm_key.unwrap_or(tpm_rh::NULL);
        let bind = binding.bind.unwrap_or(tpm_rh::NULL);

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_key);
        cmd.add_handle(bind);
        cmd.add_tpm2b(&nonce_caller);
        cmd.add_tpm2b(binding.encrypted_salt);
        cmd.add_u8(session_type.to_se() as u8);
        cmd.add(&symmetric);
        cmd.add_u16(auth_hash.to_u16());

        let cmd_bytes = cmd.finalize();
        tracing::debug!("StartAuthSession command: {} bytes", cmd_bytes.len());
        let response = execute(tpm, &cmd_bytes)?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;

        let assembled = (|| -> Result<Self> {
            let nonce_tpm = buf.get_tpm2b()?;

            let mut nonces = NonceBook::init(nonce_caller.clone());
            nonces.roll(nonce_tpm.clone())?;

            let auth_value_bind = Zeroizing::new(binding.bind_auth_value.to_vec());
            let salt = Zeroizing::new(binding.salt.to_vec());

            // TPM 2.0 Part 1, 19.6.8: sessionKey = KDFa(authHash,
            // bindAuth ‖ salt, "ATH", nonceTPM, nonceCaller). Empty when the
            // session is both unsalted and unbound.
            let session_key = if auth_value_bind.is_empty() && salt.is_empty() {
                Zeroizing::new(Vec::new())
            } else {
                let mut secret =
                    Zeroizing::new(Vec::with_capacity(auth_value_bind.len() + salt.len()));
                secret.extend_from_slice(&auth_value_bind);
                secret.extend_from_slice(&salt);
                Zeroizing::new(kdf_a(
                    crypto,
                    auth_hash,
                    &secret,
                    "ATH",
                    &nonce_tpm,
                    &nonce_caller,
                    (nonce_len * 8) as u32,
                )?)
            };

            Ok(Self {
                session_type,
                state: SessionState::Init,
                handle,
                auth_hash,
                symmetric,
                session_key,
                auth_value_bind,
                salt,
                nonce_tpm: Zeroizing::new(nonce_tpm),
                nonces,
                policy_applied: false,
            })
        })();

        match assembled {
            Ok(mut session) => {
                session.state = SessionState::Active;
                tracing::debug!(
                    "started {:?} session 0x{:08x} ({:?})",
                    session_type,
                    handle,
                    auth_hash
                );
                Ok(session)
            }
            Err(e) => {
                // The TPM already holds a session slot for this handle.
                let mut cmd = TpmCommand::new(TpmCc::FlushContext);
                cmd.add_handle(handle);
                let _ = execute(tpm, &cmd.finalize());
                Err(e)
            }
        }
    }

    /// Start an unsalted, unbound policy session.
    pub fn start_policy(
        tpm: &mut dyn Transport,
        crypto: &dyn CryptoProvider,
        auth_hash: TpmAlgId,
    ) -> Result<Self> {
        Self::start(
            tpm,
            crypto,
            SessionType::Policy,
            SessionBinding::default(),
            TpmtSymDef::null(),
            auth_hash,
        )
    }

    /// Start a trial session for computing a policy digest.
    pub fn start_trial(
        tpm: &mut dyn Transport,
        crypto: &dyn CryptoProvider,
        auth_hash: TpmAlgId,
    ) -> Result<Self> {
        Self::start(
            tpm,
            crypto,
            SessionType::Trial,
            SessionBinding::default(),
            TpmtSymDef::null(),
            auth_hash,
        )
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn auth_hash(&self) -> TpmAlgId {
        self.auth_hash
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn nonce_newer(&self) -> &[u8] {
        self.nonces.newer()
    }

    pub fn nonce_older(&self) -> &[u8] {
        self.nonces.older()
    }

    pub fn nonce_tpm(&self) -> &[u8] {
        &self.nonce_tpm
    }

    /// Run the policy script on this session ahead of [`Session::exchange`].
    /// Normally exchange does this on first use; explicit satisfaction is
    /// for callers that need the digest state earlier.
    pub fn satisfy_policy(
        &mut self,
        tpm: &mut dyn Transport,
        binding: &PolicyBinding,
    ) -> Result<()> {
        self.ensure_active()?;
        policy::apply_policy(tpm, self.handle, self.auth_hash, binding)?;
        self.policy_applied = true;
        Ok(())
    }

    /// Authorize and dispatch one command under this session.
    ///
    /// `entity_name` is the TPM Name of the entity behind `entity_handle`;
    /// `entity_auth_value` its authValue digest; `params_in` the marshalled
    /// command parameters. Returns the response parameter bytes after the
    /// response authHMAC has been verified.
    #[allow(clippy::too_many_arguments)]
    pub fn exchange(
        &mut self,
        tpm: &mut dyn Transport,
        crypto: &dyn CryptoProvider,
        command_code: TpmCc,
        entity_handle: u32,
        entity_name: &[u8],
        entity_auth_value: &[u8],
        params_in: &[u8],
        attributes: TpmaSa,
        policy: &PolicyBinding,
    ) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if self.session_type != SessionType::Policy {
            return Err(Error::Internal(
                "trial sessions shape digests and never authorize commands".into(),
            ));
        }

        if !self.policy_applied {
            if let Err(e) = self.satisfy_policy(tpm, policy) {
                self.abort(tpm);
                return Err(e);
            }
        }

        match self.authorized_exchange(
            tpm,
            crypto,
            command_code,
            entity_handle,
            entity_name,
            entity_auth_value,
            params_in,
            attributes,
        ) {
            Ok(params) => Ok(params),
            Err(e) => {
                // Any mid-exchange failure leaves the nonce state
                // indeterminate; flush and wipe before propagating.
                self.abort(tpm);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn authorized_exchange(
        &mut self,
        tpm: &mut dyn Transport,
        crypto: &dyn CryptoProvider,
        command_code: TpmCc,
        entity_handle: u32,
        entity_name: &[u8],
        entity_auth_value: &[u8],
        params_in: &[u8],
        attributes: TpmaSa,
    ) -> Result<Vec<u8>> {
        // Fresh caller nonce for this command; the previous newer nonce
        // (the TPM's last) becomes older.
        let fresh = crypto.random_bytes(self.nonce_tpm.len())?;
        self.nonces.roll(fresh)?;

        let cp = cp_hash(
            crypto,
            self.auth_hash,
            command_code.to_u32(),
            entity_name,
            params_in,
        )?;
        let cmd_hmac = auth_hmac(
            crypto,
            self.auth_hash,
            &self.session_key,
            entity_auth_value,
            &cp,
            self.nonces.newer(),
            self.nonces.older(),
            attributes,
        )?;

        let mut cmd = TpmCommand::with_sessions(command_code);
        cmd.add_handle(entity_handle);
        put_session_auth_area(
            cmd.buffer_mut(),
            self.handle,
            self.nonces.newer(),
            attributes,
            &cmd_hmac,
        );
        cmd.add_bytes(params_in);

        let response = execute(tpm, &cmd.finalize())?;
        response.ensure_success()?;

        let mut buf = response.data_buffer();
        let param_size = buf.get_u32()? as usize;
        let params_out = buf.get_bytes(param_size)?;
        let response_auth = ResponseAuth::parse(&mut buf)?;

        // Roll before verification: the response HMAC is keyed over
        // (nonceTPM', our just-sent nonce).
        self.nonces.roll(response_auth.nonce_tpm.clone())?;
        self.nonce_tpm = Zeroizing::new(response_auth.nonce_tpm);

        let rp = rp_hash(
            crypto,
            self.auth_hash,
            response.response_code,
            command_code.to_u32(),
            &params_out,
        )?;
        let verified = auth_hmac_verify(
            crypto,
            self.auth_hash,
            &self.session_key,
            entity_auth_value,
            &rp,
            self.nonces.newer(),
            self.nonces.older(),
            response_auth.attributes,
            &response_auth.hmac,
        )?;
        if !verified {
            tracing::warn!(
                "response HMAC mismatch on session 0x{:08x}, closing",
                self.handle
            );
            return Err(Error::AuthVerificationFailed);
        }

        Ok(params_out)
    }

    /// Flush the TPM-side session and wipe sensitive state. Idempotent.
    pub fn close(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(self.handle);
        let result = execute(tpm, &cmd.finalize()).and_then(|r| r.ensure_success());
        if let Err(e) = result {
            tracing::warn!("FlushContext for session 0x{:08x} failed: {e}", self.handle);
        }

        self.wipe();
        Ok(())
    }

    /// Best-effort close on a fatal protocol error.
    fn abort(&mut self, tpm: &mut dyn Transport) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(self.handle);
        let _ = execute(tpm, &cmd.finalize());
        self.wipe();
    }

    fn wipe(&mut self) {
        self.session_key.zeroize();
        self.auth_value_bind.zeroize();
        self.salt.zeroize();
        self.nonce_tpm.zeroize();
        self.nonces.wipe();
        self.state = SessionState::Closed;
        self.handle = 0;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::Internal(format!(
                "session is {:?}, not Active",
                self.state
            )));
        }
        Ok(())
    }
}
