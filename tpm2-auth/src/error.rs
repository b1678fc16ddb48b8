// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for the authorization-session core

use thiserror::Error;

use crate::constants::TpmRc;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller-fixable input problem: wrong-length nonce, unknown hash
    /// algorithm, malformed PCR selection
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Non-retryable TPM response code, surfaced verbatim
    #[error("TPM returned {0}: 0x{1:08x}")]
    Tpm(TpmRc, u32),

    /// Retry-class response code still present after bounded resends
    #[error("TPM busy after {attempts} attempts: 0x{rc:08x}")]
    Retry { rc: u32, attempts: u32 },

    /// Response HMAC mismatch; the session has been closed
    #[error("response authorization HMAC verification failed")]
    AuthVerificationFailed,

    /// PCR state satisfies neither a simple policy nor either policy-OR branch
    #[error("authorization policy not satisfied by current PCR state")]
    PolicyNotSatisfied,

    #[error("TPM transport failure")]
    Transport(#[from] std::io::Error),

    /// The transport gave up waiting; session nonce state is indeterminate
    #[error("TPM transport timed out")]
    TransportTimeout,

    #[error("KDF configuration error: {0}")]
    KdfConfiguration(String),

    /// Invariant violation inside this crate (e.g. exchange on a closed
    /// session, truncated response)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify a non-zero TPM response code into the error taxonomy.
    pub fn from_rc(rc: u32) -> Self {
        match TpmRc::from_u32(rc) {
            TpmRc::PolicyFail => Error::PolicyNotSatisfied,
            kind => Error::Tpm(kind, rc),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
