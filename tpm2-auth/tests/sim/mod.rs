// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM model for integration tests
//!
//! Implements the slice of TPM 2.0 the authorization core drives: policy and
//! trial sessions with genuine nonce/HMAC bookkeeping, PCR banks, and sealed
//! objects whose authPolicy and authValue are enforced on Unseal. The model
//! keeps its own view of the protocol (nonces it generated, digests it
//! accumulated), so a client-side bookkeeping bug shows up as a real
//! authorization failure instead of a mirrored one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use tpm2_auth::{
    CryptoProvider, OsCrypto, ResponseBuffer, Result, TpmAlgId, TpmlPcrSelection, Transport,
    Unmarshal, RC_AUTH_FAIL, RC_HANDLE, RC_POLICY_FAIL, RC_SUCCESS, RC_VALUE,
};

const CC_POLICY_OR: u32 = 0x0000_0171;
const CC_CREATE: u32 = 0x0000_0153;
const CC_CREATE_PRIMARY: u32 = 0x0000_0131;
const CC_LOAD: u32 = 0x0000_0157;
const CC_UNSEAL: u32 = 0x0000_015E;
const CC_FLUSH_CONTEXT: u32 = 0x0000_0165;
const CC_READ_PUBLIC: u32 = 0x0000_0173;
const CC_START_AUTH_SESSION: u32 = 0x0000_0176;
const CC_GET_RANDOM: u32 = 0x0000_017B;
const CC_PCR_READ: u32 = 0x0000_017E;
const CC_POLICY_PCR: u32 = 0x0000_017F;
const CC_PCR_EXTEND: u32 = 0x0000_0182;
const CC_POLICY_GET_DIGEST: u32 = 0x0000_0189;

const SE_POLICY: u8 = 0x01;

const TAG_NO_SESSIONS: u16 = 0x8001;
const TAG_SESSIONS: u16 = 0x8002;

struct SimSession {
    session_type: u8,
    auth_hash: TpmAlgId,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
}

struct SealedData {
    data: Vec<u8>,
    auth_value: Vec<u8>,
    auth_policy: Vec<u8>,
}

struct SimObject {
    public_area: Vec<u8>,
    name: Vec<u8>,
    sealed: Option<SealedData>,
}

/// The TPM model. Deterministic: all TPM-side nonces come from the seeded RNG.
pub struct SimTpm {
    crypto: OsCrypto,
    rng: StdRng,
    sessions: HashMap<u32, SimSession>,
    objects: HashMap<u32, SimObject>,
    pcrs: HashMap<(u16, u32), Vec<u8>>,
    next_session: u32,
    next_object: u32,
    /// Caller nonce seen in the most recent authorized command
    pub last_nonce_caller: Vec<u8>,
}

impl SimTpm {
    pub fn new(seed: u64) -> Self {
        Self {
            crypto: OsCrypto,
            rng: StdRng::seed_from_u64(seed),
            sessions: HashMap::new(),
            objects: HashMap::new(),
            pcrs: HashMap::new(),
            next_session: 0x0300_0000,
            next_object: 0x8000_0000,
            last_nonce_caller: Vec::new(),
        }
    }

    pub fn session_nonce_tpm(&self, handle: u32) -> Option<Vec<u8>> {
        self.sessions.get(&handle).map(|s| s.nonce_tpm.clone())
    }

    pub fn session_exists(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    fn pcr_value(&self, alg: TpmAlgId, index: u32) -> Vec<u8> {
        self.pcrs
            .get(&(alg.to_u16(), index))
            .cloned()
            .unwrap_or_else(|| vec![0u8; alg.digest_size()])
    }

    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Vec<u8> {
        self.crypto.hash(alg, data).expect("model hash")
    }

    /// Digest of the selected PCR values, in selection order
    fn pcr_selection_digest(&self, alg: TpmAlgId, selection: &TpmlPcrSelection) -> Vec<u8> {
        let mut concat = Vec::new();
        for sel in &selection.pcr_selections {
            for idx in sel.indices() {
                concat.extend_from_slice(&self.pcr_value(sel.hash, idx));
            }
        }
        self.hash(alg, &concat)
    }

    fn handle_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut buf = ResponseBuffer::new(command);
        let _tag = buf.get_u16()?;
        let size = buf.get_u32()? as usize;
        assert_eq!(size, command.len(), "command size field mismatch");
        let cc = buf.get_u32()?;

        match cc {
            CC_GET_RANDOM => self.get_random(&mut buf),
            CC_START_AUTH_SESSION => self.start_auth_session(&mut buf),
            CC_POLICY_PCR => self.policy_pcr(&mut buf),
            CC_POLICY_OR => self.policy_or(&mut buf),
            CC_POLICY_GET_DIGEST => self.policy_get_digest(&mut buf),
            CC_PCR_READ => self.pcr_read(&mut buf),
            CC_PCR_EXTEND => self.pcr_extend(&mut buf),
            CC_READ_PUBLIC => self.read_public(&mut buf),
            CC_CREATE_PRIMARY => self.create_primary(&mut buf),
            CC_CREATE => self.create(&mut buf),
            CC_LOAD => self.load(&mut buf),
            CC_UNSEAL => self.unseal(&mut buf),
            CC_FLUSH_CONTEXT => self.flush_context(&mut buf),
            other => panic!("TPM model does not implement command 0x{other:08x}"),
        }
    }

    fn get_random(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let requested = buf.get_u16()? as usize;
        // Real TPMs cap the per-command output; callers are expected to loop
        let mut bytes = vec![0u8; requested.min(48)];
        self.rng.fill_bytes(&mut bytes);

        let mut body = Vec::new();
        put_tpm2b(&mut body, &bytes);
        Ok(ok_response(TAG_NO_SESSIONS, &body))
    }

    fn start_auth_session(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let _tpm_key = buf.get_u32()?;
        let _bind = buf.get_u32()?;
        let _nonce_caller = buf.get_tpm2b()?;
        let _encrypted_salt = buf.get_tpm2b()?;
        let session_type = buf.get_u8()?;
        let sym_alg = buf.get_u16()?;
        if sym_alg != TpmAlgId::Null.to_u16() {
            buf.skip(4)?; // keyBits + mode
        }
        let auth_hash = TpmAlgId::from_u16(buf.get_u16()?).expect("session hash");

        let mut nonce_tpm = vec![0u8; auth_hash.digest_size()];
        self.rng.fill_bytes(&mut nonce_tpm);

        let handle = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            handle,
            SimSession {
                session_type,
                auth_hash,
                nonce_tpm: nonce_tpm.clone(),
                policy_digest: vec![0u8; auth_hash.digest_size()],
            },
        );

        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_be_bytes());
        put_tpm2b(&mut body, &nonce_tpm);
        Ok(ok_response(TAG_NO_SESSIONS, &body))
    }

    fn policy_pcr(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let handle = buf.get_u32()?;
        let _pcr_digest = buf.get_tpm2b()?;
        let selection = TpmlPcrSelection::unmarshal(buf)?;

        let Some(session) = self.sessions.get(&handle) else {
            return Ok(err_response(RC_HANDLE));
        };
        let alg = session.auth_hash;
        let digest_tpm = self.pcr_selection_digest(alg, &selection);

        // policyDigest' = H(policyDigest || TPM_CC_PolicyPCR || pcrs || digestTPM)
        let mut input = self.sessions[&handle].policy_digest.clone();
        input.extend_from_slice(&CC_POLICY_PCR.to_be_bytes());
        input.extend_from_slice(&to_bytes(&selection));
        input.extend_from_slice(&digest_tpm);
        let updated = self.hash(alg, &input);
        self.sessions.get_mut(&handle).unwrap().policy_digest = updated;

        Ok(ok_response(TAG_NO_SESSIONS, &[]))
    }

    fn policy_or(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let handle = buf.get_u32()?;
        let count = buf.get_u32()? as usize;
        let mut branches = Vec::with_capacity(count);
        for _ in 0..count {
            branches.push(buf.get_tpm2b()?);
        }

        let Some(session) = self.sessions.get(&handle) else {
            return Ok(err_response(RC_HANDLE));
        };
        if !branches.iter().any(|b| *b == session.policy_digest) {
            return Ok(err_response(RC_VALUE));
        }

        // policyDigest' = H(TPM_CC_PolicyOR || branches)
        let alg = session.auth_hash;
        let mut input = CC_POLICY_OR.to_be_bytes().to_vec();
        for b in &branches {
            input.extend_from_slice(b);
        }
        let updated = self.hash(alg, &input);
        self.sessions.get_mut(&handle).unwrap().policy_digest = updated;

        Ok(ok_response(TAG_NO_SESSIONS, &[]))
    }

    fn policy_get_digest(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let handle = buf.get_u32()?;
        let Some(session) = self.sessions.get(&handle) else {
            return Ok(err_response(RC_HANDLE));
        };

        let mut body = Vec::new();
        put_tpm2b(&mut body, &session.policy_digest);
        Ok(ok_response(TAG_NO_SESSIONS, &body))
    }

    fn pcr_read(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let selection = TpmlPcrSelection::unmarshal(buf)?;

        let mut values = Vec::new();
        for sel in &selection.pcr_selections {
            for idx in sel.indices() {
                values.push(self.pcr_value(sel.hash, idx));
            }
        }

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes()); // pcrUpdateCounter
        body.extend_from_slice(&to_bytes(&selection));
        body.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for v in &values {
            put_tpm2b(&mut body, v);
        }
        Ok(ok_response(TAG_NO_SESSIONS, &body))
    }

    fn pcr_extend(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let pcr = buf.get_u32()?;
        skip_auth_area(buf)?;
        let count = buf.get_u32()? as usize;
        for _ in 0..count {
            let alg = TpmAlgId::from_u16(buf.get_u16()?).expect("extend bank");
            let digest = buf.get_bytes(alg.digest_size())?;

            let mut input = self.pcr_value(alg, pcr);
            input.extend_from_slice(&digest);
            let updated = self.hash(alg, &input);
            self.pcrs.insert((alg.to_u16(), pcr), updated);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // parameterSize
        put_password_response_auth(&mut body);
        Ok(ok_response(TAG_SESSIONS, &body))
    }

    fn read_public(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let handle = buf.get_u32()?;
        let Some(object) = self.objects.get(&handle) else {
            return Ok(err_response(RC_HANDLE));
        };

        let mut body = Vec::new();
        put_tpm2b(&mut body, &object.public_area);
        put_tpm2b(&mut body, &object.name);
        put_tpm2b(&mut body, &object.name); // qualifiedName
        Ok(ok_response(TAG_NO_SESSIONS, &body))
    }

    fn create_primary(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let _hierarchy = buf.get_u32()?;
        skip_auth_area(buf)?;
        let _in_sensitive = buf.get_tpm2b()?;
        let public_area = buf.get_tpm2b()?;

        let name = self.object_name(&public_area);
        let handle = self.next_object;
        self.next_object += 1;
        self.objects.insert(
            handle,
            SimObject {
                public_area: public_area.clone(),
                name: name.clone(),
                sealed: None,
            },
        );

        let mut params = Vec::new();
        put_tpm2b(&mut params, &public_area); // outPublic
        put_tpm2b(&mut params, &[]); // creationData
        put_tpm2b(&mut params, &[]); // creationHash
        params.extend_from_slice(&0u16.to_be_bytes()); // ticket tag
        params.extend_from_slice(&0u32.to_be_bytes()); // ticket hierarchy
        put_tpm2b(&mut params, &[]); // ticket digest
        put_tpm2b(&mut params, &name);

        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_be_bytes());
        body.extend_from_slice(&(params.len() as u32).to_be_bytes());
        body.extend_from_slice(&params);
        put_password_response_auth(&mut body);
        Ok(ok_response(TAG_SESSIONS, &body))
    }

    fn create(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let parent = buf.get_u32()?;
        skip_auth_area(buf)?;
        let in_sensitive = buf.get_tpm2b()?;
        let public_area = buf.get_tpm2b()?;

        if !self.objects.contains_key(&parent) {
            return Ok(err_response(RC_HANDLE));
        }

        let mut sens = ResponseBuffer::new(&in_sensitive);
        let user_auth = sens.get_tpm2b()?;
        let data = sens.get_tpm2b()?;

        // Model private blob: the sensitive fields under a sim-only framing.
        // A real TPM encrypts this under the parent's seed.
        let mut private = Vec::new();
        put_tpm2b(&mut private, &user_auth);
        put_tpm2b(&mut private, &data);

        let mut params = Vec::new();
        put_tpm2b(&mut params, &private); // outPrivate
        put_tpm2b(&mut params, &public_area); // outPublic
        put_tpm2b(&mut params, &[]); // creationData
        put_tpm2b(&mut params, &[]); // creationHash
        params.extend_from_slice(&0u16.to_be_bytes());
        params.extend_from_slice(&0u32.to_be_bytes());
        put_tpm2b(&mut params, &[]);

        let mut body = Vec::new();
        body.extend_from_slice(&(params.len() as u32).to_be_bytes());
        body.extend_from_slice(&params);
        put_password_response_auth(&mut body);
        Ok(ok_response(TAG_SESSIONS, &body))
    }

    fn load(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let parent = buf.get_u32()?;
        skip_auth_area(buf)?;
        let private = buf.get_tpm2b()?;
        let public_area = buf.get_tpm2b()?;

        if !self.objects.contains_key(&parent) {
            return Ok(err_response(RC_HANDLE));
        }

        let mut priv_buf = ResponseBuffer::new(&private);
        let auth_value = priv_buf.get_tpm2b()?;
        let data = priv_buf.get_tpm2b()?;

        let auth_policy = parse_auth_policy(&public_area)?;
        let name = self.object_name(&public_area);

        let handle = self.next_object;
        self.next_object += 1;
        self.objects.insert(
            handle,
            SimObject {
                public_area,
                name: name.clone(),
                sealed: Some(SealedData {
                    data,
                    auth_value,
                    auth_policy,
                }),
            },
        );

        let mut params = Vec::new();
        put_tpm2b(&mut params, &name);

        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_be_bytes());
        body.extend_from_slice(&(params.len() as u32).to_be_bytes());
        body.extend_from_slice(&params);
        put_password_response_auth(&mut body);
        Ok(ok_response(TAG_SESSIONS, &body))
    }

    fn unseal(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let item_handle = buf.get_u32()?;
        let _auth_size = buf.get_u32()?;
        let session_handle = buf.get_u32()?;
        let nonce_caller = buf.get_tpm2b()?;
        let attributes = buf.get_u8()?;
        let cmd_hmac = buf.get_tpm2b()?;

        self.last_nonce_caller = nonce_caller.clone();

        let Some(object) = self.objects.get(&item_handle) else {
            return Ok(err_response(RC_HANDLE));
        };
        let Some(sealed) = &object.sealed else {
            return Ok(err_response(RC_HANDLE));
        };
        let Some(session) = self.sessions.get(&session_handle) else {
            return Ok(err_response(RC_HANDLE));
        };
        if session.session_type != SE_POLICY {
            return Ok(err_response(RC_AUTH_FAIL));
        }
        let alg = session.auth_hash;

        if session.policy_digest != sealed.auth_policy {
            return Ok(err_response(RC_POLICY_FAIL));
        }

        // Verify the command HMAC exactly as the client computed it:
        // key = sessionKey (empty, unsalted/unbound) ‖ authValue,
        // msg = cpHash ‖ nonceCaller ‖ nonceTPM ‖ attributes.
        let mut cp_input = CC_UNSEAL.to_be_bytes().to_vec();
        cp_input.extend_from_slice(&object.name);
        let cp = self.hash(alg, &cp_input);

        let mut msg = cp.clone();
        msg.extend_from_slice(&nonce_caller);
        msg.extend_from_slice(&session.nonce_tpm);
        msg.push(attributes);
        let expected = self
            .crypto
            .hmac(alg, &sealed.auth_value, &msg)
            .expect("model hmac");
        if expected != cmd_hmac {
            return Ok(err_response(RC_AUTH_FAIL));
        }

        // Authorized: roll our nonce and produce the response half.
        let mut nonce_tpm = vec![0u8; alg.digest_size()];
        self.rng.fill_bytes(&mut nonce_tpm);

        let mut params = Vec::new();
        put_tpm2b(&mut params, &sealed.data);

        let mut rp_input = RC_SUCCESS.to_be_bytes().to_vec();
        rp_input.extend_from_slice(&CC_UNSEAL.to_be_bytes());
        rp_input.extend_from_slice(&params);
        let rp = self.hash(alg, &rp_input);

        let mut rsp_msg = rp.clone();
        rsp_msg.extend_from_slice(&nonce_tpm);
        rsp_msg.extend_from_slice(&nonce_caller);
        rsp_msg.push(attributes);
        let rsp_hmac = self
            .crypto
            .hmac(alg, &sealed.auth_value, &rsp_msg)
            .expect("model hmac");

        self.sessions.get_mut(&session_handle).unwrap().nonce_tpm = nonce_tpm.clone();

        let mut body = Vec::new();
        body.extend_from_slice(&(params.len() as u32).to_be_bytes());
        body.extend_from_slice(&params);
        put_tpm2b(&mut body, &nonce_tpm);
        body.push(attributes);
        put_tpm2b(&mut body, &rsp_hmac);
        Ok(ok_response(TAG_SESSIONS, &body))
    }

    fn flush_context(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>> {
        let handle = buf.get_u32()?;
        let removed =
            self.sessions.remove(&handle).is_some() || self.objects.remove(&handle).is_some();
        if !removed {
            return Ok(err_response(RC_HANDLE));
        }
        Ok(ok_response(TAG_NO_SESSIONS, &[]))
    }

    fn object_name(&self, public_area: &[u8]) -> Vec<u8> {
        let name_alg = TpmAlgId::from_u16(u16::from_be_bytes([public_area[2], public_area[3]]))
            .expect("name algorithm");
        let mut name = name_alg.to_u16().to_be_bytes().to_vec();
        name.extend_from_slice(&self.hash(name_alg, public_area));
        name
    }
}

impl Transport for SimTpm {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.handle_command(command)
    }
}

/// Cloneable handle to one [`SimTpm`], so a test can drive the model
/// through a `TpmContext` and inspect it on the side.
#[derive(Clone)]
pub struct SharedTpm(pub Rc<RefCell<SimTpm>>);

impl SharedTpm {
    pub fn new(seed: u64) -> Self {
        Self(Rc::new(RefCell::new(SimTpm::new(seed))))
    }
}

impl Transport for SharedTpm {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.0.borrow_mut().handle_command(command)
    }
}

/// Middleware that flips one bit of the nonceTPM in Unseal responses.
pub struct NonceTamper {
    pub inner: SharedTpm,
}

impl Transport for NonceTamper {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let cc = u32::from_be_bytes([command[6], command[7], command[8], command[9]]);
        let mut response = self.inner.send(command)?;

        let rc = u32::from_be_bytes([response[6], response[7], response[8], response[9]]);
        if cc == CC_UNSEAL && rc == RC_SUCCESS {
            // header (10) + parameterSize (4) + params + nonce size prefix (2)
            let param_size =
                u32::from_be_bytes([response[10], response[11], response[12], response[13]])
                    as usize;
            let nonce_offset = 14 + param_size + 2;
            response[nonce_offset] ^= 0x01;
        }
        Ok(response)
    }
}

/// Deterministic crypto provider for the client side: RustCrypto digests
/// with caller nonces drawn from a seeded RNG.
pub struct DetCrypto {
    inner: OsCrypto,
    rng: RefCell<StdRng>,
}

impl DetCrypto {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: OsCrypto,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CryptoProvider for DetCrypto {
    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>> {
        self.inner.hash(alg, data)
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.inner.hmac(alg, key, data)
    }

    fn hmac_verify(&self, alg: TpmAlgId, key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
        self.inner.hmac_verify(alg, key, data, tag)
    }

    fn random_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.rng.borrow_mut().fill_bytes(&mut out);
        Ok(out)
    }
}

// ==================== wire helpers ====================

fn put_tpm2b(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn put_password_response_auth(out: &mut Vec<u8>) {
    put_tpm2b(out, &[]); // nonce
    out.push(0x01); // continueSession
    put_tpm2b(out, &[]); // hmac
}

fn skip_auth_area(buf: &mut ResponseBuffer) -> Result<()> {
    let auth_size = buf.get_u32()? as usize;
    buf.skip(auth_size)
}

fn parse_auth_policy(public_area: &[u8]) -> Result<Vec<u8>> {
    // TPMT_PUBLIC: type (2) + nameAlg (2) + attributes (4) + authPolicy (2B)
    let mut buf = ResponseBuffer::new(public_area);
    buf.skip(8)?;
    buf.get_tpm2b()
}

fn to_bytes(selection: &TpmlPcrSelection) -> Vec<u8> {
    use tpm2_auth::Marshal;
    selection.to_bytes()
}

fn ok_response(tag: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + body.len());
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&((10 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&RC_SUCCESS.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn err_response(rc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&TAG_NO_SESSIONS.to_be_bytes());
    out.extend_from_slice(&10u32.to_be_bytes());
    out.extend_from_slice(&rc.to_be_bytes());
    out
}
