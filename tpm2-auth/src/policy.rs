// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization-policy construction and satisfaction
//!
//! A trial session runs the policy script to produce the digest sealed into
//! an object's authPolicy; a live policy session runs the same script (plus
//! PolicyOR for compound policies) to prove the current platform state
//! matches it.

use crate::constants::{TpmAlgId, TpmCc, TpmRc};
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::{execute, TpmCommand, Transport};
use crate::types::{TpmlDigest, TpmlPcrSelection};

/// What a policy session must prove before it authorizes a command.
#[derive(Debug, Clone)]
pub enum PolicyBinding {
    /// Simple PCR policy; an empty selection leaves the digest untouched
    /// (the fresh-session all-zero digest).
    Pcr(TpmlPcrSelection),
    /// Compound policy-OR: prove the PCR branch that currently holds, then
    /// assert membership in the ordered branch list.
    PcrOr {
        pcrs: TpmlPcrSelection,
        branch1: Vec<u8>,
        branch2: Vec<u8>,
    },
}

impl PolicyBinding {
    pub fn unbound() -> Self {
        PolicyBinding::Pcr(TpmlPcrSelection::default())
    }
}

/// Issue `TPM2_PolicyPCR` on a session.
///
/// The pcrDigest is sent empty in both trial and live sessions: the TPM
/// folds in the (virtual or current) PCR state itself.
pub fn policy_pcr(
    tpm: &mut dyn Transport,
    session_handle: u32,
    pcr_selection: &TpmlPcrSelection,
) -> Result<()> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
    cmd.add_handle(session_handle);
    cmd.add_tpm2b_empty(); // pcrDigest
    cmd.add(pcr_selection);

    execute(tpm, &cmd.finalize())?.ensure_success()
}

/// Issue `TPM2_PolicyOR` with the ordered two-branch digest list.
pub fn policy_or(
    tpm: &mut dyn Transport,
    session_handle: u32,
    branch1: &[u8],
    branch2: &[u8],
) -> Result<()> {
    let list = TpmlDigest {
        digests: vec![branch1.to_vec(), branch2.to_vec()],
    };

    let mut cmd = TpmCommand::new(TpmCc::PolicyOr);
    cmd.add_handle(session_handle);
    cmd.add(&list);

    execute(tpm, &cmd.finalize())?.ensure_success()
}

/// Read a session's current policy digest via `TPM2_PolicyGetDigest`.
pub fn policy_get_digest(tpm: &mut dyn Transport, session_handle: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
    cmd.add_handle(session_handle);

    let response = execute(tpm, &cmd.finalize())?;
    response.ensure_success()?;

    let mut buf = response.data_buffer();
    buf.get_tpm2b()
}

/// Run the policy script for `binding` on a session handle.
pub fn apply_policy(
    tpm: &mut dyn Transport,
    session_handle: u32,
    auth_hash: TpmAlgId,
    binding: &PolicyBinding,
) -> Result<()> {
    match binding {
        PolicyBinding::Pcr(pcrs) => {
            if !pcrs.is_empty() {
                policy_pcr(tpm, session_handle, pcrs)?;
            }
            Ok(())
        }
        PolicyBinding::PcrOr {
            pcrs,
            branch1,
            branch2,
        } => {
            let digest_len = auth_hash.digest_size();
            if branch1.len() != digest_len || branch2.len() != digest_len {
                return Err(Error::InvalidInput(format!(
                    "policy-OR branch digests must be {digest_len} bytes for {auth_hash:?}"
                )));
            }
            if !pcrs.is_empty() {
                policy_pcr(tpm, session_handle, pcrs)?;
            }
            // Exactly one branch can hold for the current PCR state; the
            // session digest must equal it before the OR is asserted. A
            // VALUE-class rejection means the current state matches neither
            // branch.
            policy_or(tpm, session_handle, branch1, branch2).map_err(|e| match e {
                Error::Tpm(_, rc) if TpmRc::is_value_class(rc) => Error::PolicyNotSatisfied,
                other => other,
            })?;
            Ok(())
        }
    }
}

/// Build the authorization-policy digest to seal into a new object.
///
/// Runs a trial session through the PCR script and reads the resulting
/// digest back. An empty selection yields the fresh-session all-zero digest.
pub fn build_policy_digest(
    tpm: &mut dyn Transport,
    crypto: &dyn CryptoProvider,
    pcr_selection: &TpmlPcrSelection,
    auth_hash: TpmAlgId,
) -> Result<Vec<u8>> {
    let mut trial = Session::start_trial(tpm, crypto, auth_hash)?;

    let result = (|| {
        if !pcr_selection.is_empty() {
            policy_pcr(tpm, trial.handle(), pcr_selection)?;
        }
        policy_get_digest(tpm, trial.handle())
    })();

    trial.close(tpm)?;

    let digest = result?;
    tracing::debug!("trial policy digest: {}", hex::encode(&digest));
    Ok(digest)
}

/// Combine two policy branches into the compound policy-OR digest:
/// `H(TPM_CC_PolicyOR ‖ branch1 ‖ branch2)`. Order-sensitive; the same
/// order must be used when satisfying the policy.
pub fn combine_policy_or(
    crypto: &dyn CryptoProvider,
    auth_hash: TpmAlgId,
    branch1: &[u8],
    branch2: &[u8],
) -> Result<Vec<u8>> {
    let digest_len = auth_hash.digest_size();
    if digest_len == 0 {
        return Err(Error::InvalidInput(format!(
            "not a hash algorithm: {auth_hash:?}"
        )));
    }
    if branch1.len() != digest_len || branch2.len() != digest_len {
        return Err(Error::InvalidInput(format!(
            "policy-OR branches must be {digest_len}-byte {auth_hash:?} digests"
        )));
    }

    let mut input = Vec::with_capacity(4 + branch1.len() + branch2.len());
    input.extend_from_slice(&TpmCc::PolicyOr.to_u32().to_be_bytes());
    input.extend_from_slice(branch1);
    input.extend_from_slice(branch2);
    crypto.hash(auth_hash, &input)
}
