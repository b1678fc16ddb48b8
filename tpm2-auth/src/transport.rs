// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transport layer
//!
//! The session core talks to the TPM through the [`Transport`] trait: one
//! prepared command buffer in, one response buffer out. [`TpmDevice`] is the
//! production implementation over `/dev/tpmrm0` / `/dev/tpm0`; tests inject
//! an in-process implementation.
//!
//! A transport serializes its own byte exchanges. A single [`Transport`]
//! value may carry multiple sessions, but each session must be driven by one
//! logical caller at a time.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::constants::{TpmCc, TpmRc, TpmSt};
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer};

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Bounded resend policy for warning-class response codes
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Request/response exchange with a TPM
pub trait Transport {
    /// Send a complete command buffer and return the raw response bytes.
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Character-device transport (`/dev/tpmrm0` or `/dev/tpm0`)
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device node
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Open the default TPM device, preferring the in-kernel resource manager
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            Err(Error::Transport(std::io::Error::new(
                ErrorKind::NotFound,
                "no TPM device node found",
            )))
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for TpmDevice {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file.write_all(command).map_err(map_io)?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response).map_err(map_io)?;
        response.truncate(n);
        Ok(response)
    }
}

fn map_io(e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock {
        Error::TransportTimeout
    } else {
        Error::Transport(e)
    }
}

/// TPM command builder: header, handles, optional auth area, parameters
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    /// Command without an authorization area
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code)
    }

    /// Command carrying one or more authorization sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code)
    }

    fn with_tag(tag: TpmSt, command_code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        // Header: tag (2) + size (4, back-patched) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(command_code.to_u32());
        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Direct access for the authorization-area helpers
    pub fn buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.buf
    }

    /// Back-patch the size field and return the wire bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// Parsed TPM response header plus body
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    /// Everything after the 10-byte header
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            return Err(Error::Internal(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);
        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::Internal(format!("invalid response tag: 0x{tag_raw:04x}")))?;

        let size = buf.get_u32()? as usize;
        if response.len() < size {
            return Err(Error::Internal(format!(
                "TPM response size mismatch: header says {size}, got {}",
                response.len()
            )));
        }

        let response_code = buf.get_u32()?;
        let data = response[10..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    /// Surface a non-zero response code as an error.
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::from_rc(self.response_code))
        }
    }

    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }
}

/// Send a command, resending through the retry-class response codes.
///
/// A retry-class code means the TPM did not execute the command, so the
/// identical buffer (same nonces) is safe to resend. All other codes,
/// success included, are returned to the caller for interpretation.
pub fn execute(tpm: &mut dyn Transport, command: &[u8]) -> Result<TpmResponse> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let response = TpmResponse::parse(&tpm.send(command)?)?;
        if !TpmRc::is_retryable(response.response_code) {
            return Ok(response);
        }
        if attempts > MAX_RETRIES {
            tracing::warn!(
                "TPM still busy (0x{:08x}) after {} attempts",
                response.response_code,
                attempts
            );
            return Err(Error::Retry {
                rc: response.response_code,
                attempts,
            });
        }
        tracing::debug!(
            "TPM busy (0x{:08x}), resending (attempt {})",
            response.response_code,
            attempts
        );
        std::thread::sleep(RETRY_BACKOFF);
    }
}
