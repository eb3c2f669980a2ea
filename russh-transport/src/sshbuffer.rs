// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::num::Wrapping;

use log::{debug, trace};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::cipher::{self, SealingKey};
use crate::compression::Compress;
use crate::{CryptoVec, Error};

/// The SSH client/server identification string.
#[derive(Debug, Clone)]
pub enum SshId {
    /// When sending the id, append RFC standard `\r\n`. Example: `SshId::Standard("SSH-2.0-acme")`
    Standard(String),
    /// When sending the id, use this buffer as it is and do not append additional line terminators.
    Raw(String),
}

impl SshId {
    pub(crate) fn as_kex_hash_bytes(&self) -> &[u8] {
        match self {
            Self::Standard(s) => s.as_bytes(),
            Self::Raw(s) => s.trim_end_matches(|c| c == '\n' || c == '\r').as_bytes(),
        }
    }

    pub(crate) fn write(&self, buffer: &mut CryptoVec) {
        match self {
            Self::Standard(s) => buffer.extend(format!("{}\r\n", s).as_bytes()),
            Self::Raw(s) => buffer.extend(s.as_bytes()),
        }
    }
}

/// Identification lines are at most 255 bytes, CR LF included.
const MAX_ID_LINE_LEN: u64 = 255;

/// Servers may send other lines before their identification. We give
/// up after this many.
const MAX_PREAMBLE_LINES: usize = 1024;

/// The identification string received from the server, e.g.
/// `SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerId {
    raw: String,
    software_start: usize,
    comments_start: Option<usize>,
}

impl ServerId {
    /// Parse an identification line, without its line terminator.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let rest = line.strip_prefix("SSH-").ok_or(Error::Version)?;
        let (protocol, software_and_comments) = rest.split_once('-').ok_or(Error::Version)?;
        if protocol != "2.0" && protocol != "1.99" {
            debug!("unsupported protocol version {protocol:?}");
            return Err(Error::Version);
        }
        let software_start = 4 + protocol.len() + 1;
        let comments_start = software_and_comments
            .find(' ')
            .map(|i| software_start + i + 1);
        let software_end = comments_start.map(|c| c - 1).unwrap_or(line.len());
        if software_end == software_start {
            return Err(Error::Version);
        }
        Ok(ServerId {
            raw: line.to_string(),
            software_start,
            comments_start,
        })
    }

    /// The full line, as used in the exchange hash.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// The protocol version, `2.0` or `1.99`.
    pub fn protocol_version(&self) -> &str {
        self.raw
            .get(4..self.software_start - 1)
            .unwrap_or_default()
    }

    /// The software version token, e.g. `OpenSSH_9.6`.
    pub fn software_version(&self) -> &str {
        let end = self.comments_start.map(|c| c - 1).unwrap_or(self.raw.len());
        self.raw.get(self.software_start..end).unwrap_or_default()
    }

    pub fn comments(&self) -> Option<&str> {
        self.comments_start.and_then(|c| self.raw.get(c..))
    }
}

/// Read the server identification, skipping any preamble lines.
pub(crate) async fn read_ssh_id<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ServerId, Error> {
    let mut line = Vec::new();
    for _ in 0..MAX_PREAMBLE_LINES {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_ID_LINE_LEN)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(Error::HUP);
        }
        if line.last() != Some(&b'\n') {
            debug!("identification line too long or truncated");
            return Err(Error::Version);
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            let line = std::str::from_utf8(&line)?;
            trace!("server id: {line:?}");
            return ServerId::parse(line);
        }
        debug!("skipping preamble line: {:?}", String::from_utf8_lossy(&line));
    }
    Err(Error::Version)
}

#[derive(Debug, Default)]
pub(crate) struct SSHBuffer {
    pub buffer: CryptoVec,
    pub len: usize, // next packet length.
    pub bytes: usize,
    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    pub seqn: Wrapping<u32>,
}

impl SSHBuffer {
    pub fn new() -> Self {
        SSHBuffer {
            buffer: CryptoVec::new(),
            len: 0,
            bytes: 0,
            seqn: Wrapping(0),
        }
    }

    pub fn send_ssh_id(&mut self, id: &SshId) {
        id.write(&mut self.buffer);
    }
}

/// Frames, compresses and seals outbound packets. Owned by the
/// session task, which is the only writer of the stream.
pub(crate) struct PacketWriter {
    cipher: Box<dyn SealingKey + Send>,
    compress: Compress,
    compress_buffer: CryptoVec,
    write_buffer: SSHBuffer,
    extra_padding: u8,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("seqn", &self.write_buffer.seqn)
            .field("bytes", &self.write_buffer.bytes)
            .finish()
    }
}

impl PacketWriter {
    pub fn clear(extra_padding: u8) -> Self {
        Self {
            cipher: Box::new(cipher::clear::Key),
            compress: Compress::None,
            compress_buffer: CryptoVec::new(),
            write_buffer: SSHBuffer::new(),
            extra_padding,
        }
    }

    pub fn buffer(&mut self) -> &mut SSHBuffer {
        &mut self.write_buffer
    }

    pub fn compress(&mut self) -> &mut Compress {
        &mut self.compress
    }

    pub fn set_cipher(&mut self, cipher: Box<dyn SealingKey + Send>) {
        self.cipher = cipher;
    }

    pub fn reset_seqn(&mut self) {
        self.write_buffer.seqn = Wrapping(0);
    }

    /// Frame a payload that is already fully encoded.
    pub fn packet_raw(&mut self, payload: &[u8]) -> Result<(), Error> {
        if let Some(message_type) = payload.first() {
            trace!("writing message {message_type:?}");
        }
        let payload = self.compress.compress(payload, &mut self.compress_buffer)?;
        self.cipher
            .write(payload, &mut self.write_buffer, self.extra_padding);
        Ok(())
    }

    /// Build a payload with `f` and frame it. Returns the payload, which
    /// key exchange needs to keep for the exchange hash.
    pub fn packet<F: FnOnce(&mut CryptoVec) -> Result<(), Error>>(
        &mut self,
        f: F,
    ) -> Result<CryptoVec, Error> {
        let mut payload = CryptoVec::new();
        f(&mut payload)?;
        self.packet_raw(&payload)?;
        Ok(payload)
    }
}
