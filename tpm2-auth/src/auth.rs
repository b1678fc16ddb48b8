// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization digests and HMACs
//!
//! The pieces that feed a session's authorization area: the authValue
//! derived from caller-supplied bytes, the command- and response-parameter
//! hashes, and the session HMAC computed over them.

use zeroize::Zeroizing;

use crate::constants::{tpm_rh, TpmAlgId, TpmaSa};
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, ResponseBuffer};

/// Derive the authorization value (authVal) from raw auth bytes.
///
/// Empty input produces the all-zero digest of the chosen algorithm, which
/// is the TPM's emptyAuth convention for HMAC authorization; anything else
/// hashes to `H(authBytes)`. The caller owns (and clears) the input bytes.
pub fn derive_auth_value(
    crypto: &dyn CryptoProvider,
    auth_bytes: &[u8],
    alg: TpmAlgId,
) -> Result<Zeroizing<Vec<u8>>> {
    let len = alg.digest_size();
    if len == 0 {
        return Err(Error::InvalidInput(format!(
            "not a hash algorithm: {alg:?}"
        )));
    }
    if auth_bytes.is_empty() {
        return Ok(Zeroizing::new(vec![0u8; len]));
    }
    Ok(Zeroizing::new(crypto.hash(alg, auth_bytes)?))
}

/// Command parameter hash: `H(commandCode ‖ entityName ‖ params)`.
///
/// `params` are the already-marshalled command parameters, exactly the bytes
/// that will go on the wire after the authorization area.
pub fn cp_hash(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    command_code: u32,
    entity_name: &[u8],
    params: &[u8],
) -> Result<Vec<u8>> {
    let mut input = Vec::with_capacity(4 + entity_name.len() + params.len());
    input.extend_from_slice(&command_code.to_be_bytes());
    input.extend_from_slice(entity_name);
    input.extend_from_slice(params);
    crypto.hash(alg, &input)
}

/// Response parameter hash: `H(responseCode ‖ commandCode ‖ params)`.
pub fn rp_hash(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    response_code: u32,
    command_code: u32,
    params: &[u8],
) -> Result<Vec<u8>> {
    let mut input = Vec::with_capacity(8 + params.len());
    input.extend_from_slice(&response_code.to_be_bytes());
    input.extend_from_slice(&command_code.to_be_bytes());
    input.extend_from_slice(params);
    crypto.hash(alg, &input)
}

/// Assemble the HMAC key and message for a session authorization.
///
/// Key is `sessionKey ‖ authValue` (either may be empty) and is rebuilt for
/// every computation, never stored. Message is
/// `pHash ‖ nonceNewer ‖ nonceOlder ‖ attributes`; the caller passes the
/// nonces in the role order of the direction being computed (command: caller
/// nonce then TPM's last nonce; response: this response's TPM nonce then the
/// caller nonce just sent).
fn hmac_parts(
    session_key: &[u8],
    auth_value: &[u8],
    p_hash: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    attributes: TpmaSa,
) -> (Zeroizing<Vec<u8>>, Vec<u8>) {
    let mut key = Zeroizing::new(Vec::with_capacity(session_key.len() + auth_value.len()));
    key.extend_from_slice(session_key);
    key.extend_from_slice(auth_value);

    let mut msg = Vec::with_capacity(p_hash.len() + nonce_newer.len() + nonce_older.len() + 1);
    msg.extend_from_slice(p_hash);
    msg.extend_from_slice(nonce_newer);
    msg.extend_from_slice(nonce_older);
    msg.push(attributes.0);

    (key, msg)
}

/// Compute the authorization HMAC for one direction of an exchange.
pub fn auth_hmac(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    session_key: &[u8],
    auth_value: &[u8],
    p_hash: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    attributes: TpmaSa,
) -> Result<Vec<u8>> {
    let (key, msg) = hmac_parts(session_key, auth_value, p_hash, nonce_newer, nonce_older, attributes);
    crypto.hmac(alg, &key, &msg)
}

/// Constant-time check of a received authorization HMAC.
pub fn auth_hmac_verify(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    session_key: &[u8],
    auth_value: &[u8],
    p_hash: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    attributes: TpmaSa,
    received: &[u8],
) -> Result<bool> {
    let (key, msg) = hmac_parts(session_key, auth_value, p_hash, nonce_newer, nonce_older, attributes);
    crypto.hmac_verify(alg, &key, &msg, received)
}

/// Serialize a command authorization area for one HMAC/policy session:
/// `authorizationSize ‖ {handle, nonceCaller, attributes, hmac}`.
pub fn put_session_auth_area(
    buf: &mut CommandBuffer,
    session_handle: u32,
    nonce_caller: &[u8],
    attributes: TpmaSa,
    hmac: &[u8],
) {
    let auth_size = 4 + 2 + nonce_caller.len() + 1 + 2 + hmac.len();
    buf.put_u32(auth_size as u32);
    buf.put_u32(session_handle);
    buf.put_tpm2b(nonce_caller);
    buf.put_u8(attributes.0);
    buf.put_tpm2b(hmac);
}

/// Serialize a password authorization area (TPM_RS_PW). The hmac field
/// carries the literal authorization bytes; empty for emptyAuth entities.
pub fn put_password_auth_area(buf: &mut CommandBuffer, auth: &[u8]) {
    let auth_size = 4 + 2 + 1 + 2 + auth.len();
    buf.put_u32(auth_size as u32);
    buf.put_u32(tpm_rh::PW);
    buf.put_tpm2b_empty();
    buf.put_u8(TpmaSa::CONTINUE_SESSION);
    buf.put_tpm2b(auth);
}

/// Response authorization area for one session, trailing the parameters:
/// `{nonceTPM, attributes, hmac}`.
#[derive(Debug)]
pub struct ResponseAuth {
    pub nonce_tpm: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl ResponseAuth {
    pub fn parse(buf: &mut ResponseBuffer) -> Result<Self> {
        let nonce_tpm = buf.get_tpm2b()?;
        let attributes = TpmaSa(buf.get_u8()?);
        let hmac = buf.get_tpm2b()?;
        Ok(Self {
            nonce_tpm,
            attributes,
            hmac,
        })
    }
}
