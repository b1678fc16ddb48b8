// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization-session core
//!
//! This crate speaks the TPM 2.0 authorization protocol directly: it builds
//! command buffers, maintains HMAC/policy session state (rolling nonces,
//! session keys, policy digests), and verifies the TPM's response
//! authorization before any result bytes reach the caller.
//!
//! ## What it covers
//!
//! - Policy and trial sessions via `TPM2_StartAuthSession`
//! - Command/response parameter hashes (cpHash, rpHash) and the session
//!   authHMAC for both halves of an exchange
//! - PCR-bound authorization policies, including the compound policy-OR of
//!   two branches
//! - Sealing and unsealing data objects under a loaded storage key
//!
//! Transport and crypto are injected: production code drives
//! `/dev/tpmrm0` with the OS RNG, tests drive an in-process TPM model with
//! a deterministic provider.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_auth::{TpmAlgId, TpmContext, TpmlPcrSelection};
//!
//! let mut ctx = TpmContext::new(None)?; // auto-detect the TPM device
//! let pcrs = TpmlPcrSelection::single(TpmAlgId::Sha256, &[7]);
//! let (tpm, crypto) = ctx.parts();
//! let digest = tpm2_auth::build_policy_digest(tpm, crypto, &pcrs, TpmAlgId::Sha256)?;
//! # Ok::<(), tpm2_auth::Error>(())
//! ```

mod auth;
mod commands;
mod constants;
mod crypto;
mod error;
mod marshal;
mod policy;
mod session;
mod transport;
mod types;

pub use auth::{auth_hmac, cp_hash, derive_auth_value, rp_hash};
pub use commands::{SealedBlob, TpmContext};
pub use constants::*;
pub use crypto::{kdf_a, CryptoProvider, OsCrypto};
pub use error::{Error, Result};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use policy::{build_policy_digest, combine_policy_or, PolicyBinding};
pub use session::{NonceBook, Session, SessionBinding, SessionState, SessionType};
pub use transport::{execute, TpmCommand, TpmDevice, TpmResponse, Transport};
pub use types::{
    object_name, Tpm2bSensitiveCreate, TpmlDigest, TpmlPcrSelection, TpmsPcrSelection, TpmtPublic,
    TpmtSymDef,
};
