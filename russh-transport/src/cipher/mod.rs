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

//! Packet ciphers, by their negotiated [`Name`], and the framing shared
//! between them.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::num::Wrapping;

use aes::{Aes128, Aes192, Aes256};
use byteorder::{BigEndian, ByteOrder};
use ctr::Ctr128BE;
use delegate::delegate;
use log::trace;
use once_cell::sync::Lazy;
use rand::Rng;
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::mac::MacAlgorithm;
use crate::sshbuffer::SSHBuffer;
use crate::Error;

pub(crate) mod block;
pub(crate) mod chacha20poly1305;
pub(crate) mod clear;

use block::SshBlockCipher;
use chacha20poly1305::SshChacha20Poly1305Cipher;
use clear::Clear;

pub(crate) trait Cipher {
    fn needs_mac(&self) -> bool {
        false
    }
    fn key_len(&self) -> usize;
    fn nonce_len(&self) -> usize {
        0
    }
    fn make_opening_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn OpeningKey + Send>, Error>;
    fn make_sealing_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn SealingKey + Send>, Error>;
}

/// `clear`
pub const CLEAR: Name = Name("clear");
/// `aes128-ctr`
pub const AES_128_CTR: Name = Name("aes128-ctr");
/// `aes192-ctr`
pub const AES_192_CTR: Name = Name("aes192-ctr");
/// `aes256-ctr`
pub const AES_256_CTR: Name = Name("aes256-ctr");
/// `chacha20-poly1305@openssh.com`
pub const CHACHA20_POLY1305: Name = Name("chacha20-poly1305@openssh.com");
/// `none`
pub const NONE: Name = Name("none");

pub static ALL_CIPHERS: &[&Name] = &[
    &CLEAR,
    &NONE,
    &AES_128_CTR,
    &AES_192_CTR,
    &AES_256_CTR,
    &CHACHA20_POLY1305,
];

type CipherRef = &'static (dyn Cipher + Send + Sync);

pub(crate) static CIPHERS: Lazy<HashMap<&'static Name, CipherRef>> = Lazy::new(|| {
    static AES128: SshBlockCipher<Ctr128BE<Aes128>> = SshBlockCipher(PhantomData);
    static AES192: SshBlockCipher<Ctr128BE<Aes192>> = SshBlockCipher(PhantomData);
    static AES256: SshBlockCipher<Ctr128BE<Aes256>> = SshBlockCipher(PhantomData);
    let table: [(&'static Name, CipherRef); 6] = [
        (&CLEAR, &Clear {}),
        (&NONE, &Clear {}),
        (&AES_128_CTR, &AES128),
        (&AES_192_CTR, &AES192),
        (&AES_256_CTR, &AES256),
        (&CHACHA20_POLY1305, &SshChacha20Poly1305Cipher {}),
    ];
    table.into_iter().collect()
});

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    delegate! { to self.as_ref() {
        fn encoded_len(&self) -> Result<usize, ssh_encoding::Error>;
        fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error>;
    }}
}

impl Borrow<str> for &Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        ALL_CIPHERS
            .iter()
            .find(|name| name.0 == s)
            .map(|name| **name)
            .ok_or(())
    }
}

pub(crate) struct CipherPair {
    pub local_to_remote: Box<dyn SealingKey + Send>,
    pub remote_to_local: Box<dyn OpeningKey + Send>,
}

impl Debug for CipherPair {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub(crate) trait OpeningKey {
    /// Number of bytes to read before the packet length can be
    /// decrypted.
    fn packet_length_to_read_for_block_length(&self) -> usize {
        4
    }

    fn decrypt_packet_length(
        &self,
        seqn: u32,
        encrypted_packet_length: &[u8],
    ) -> Result<[u8; 4], Error>;

    fn tag_len(&self) -> usize;

    /// Authenticate and decrypt a whole packet, length field included.
    /// Returns the plaintext after the length field.
    fn open<'a>(&mut self, seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
    fn block_size(&self) -> usize;

    fn padding_length(&self, payload: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    /// Frame `payload` into `buffer`, adding up to `extra_padding`
    /// random extra blocks of padding.
    fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer, extra_padding: u8) {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length` refer
        // to the protocol fields of the same names.
        trace!("writing, seqn = {:?}", buffer.seqn.0);

        let mut padding_length = self.padding_length(payload);
        if extra_padding > 0 {
            let block_size = self.block_size();
            let room = (u8::MAX as usize).saturating_sub(padding_length) / block_size;
            let blocks = rand::thread_rng().gen_range(0..=room.min(extra_padding as usize));
            padding_length += blocks * block_size;
        }
        trace!("padding length {padding_length:?}");
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        let offset = buffer.buffer.len();

        buffer.buffer.extend(&(packet_length as u32).to_be_bytes());
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend(payload);
        self.fill_padding(buffer.buffer.resize_mut(padding_length));
        buffer.buffer.resize_mut(self.tag_len());

        #[allow(clippy::indexing_slicing)] // length checked
        let (plaintext, tag) =
            buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);

        self.seal(buffer.seqn.0, plaintext, tag);

        buffer.bytes += payload.len();
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
    }
}

/// Smallest padding (at least 4 bytes) that aligns the packet on
/// `block_size`. `length_is_aligned` is false when the length field is
/// outside of the encrypted part (EtM MACs, chacha20-poly1305).
pub(crate) fn padding_length(
    payload_len: usize,
    block_size: usize,
    length_is_aligned: bool,
) -> usize {
    let aligned = PADDING_LENGTH_LEN
        + payload_len
        + if length_is_aligned {
            PACKET_LENGTH_LEN
        } else {
            0
        };
    let mut padding = block_size - aligned % block_size;
    if padding < 4 {
        padding += block_size
    }
    while PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload_len + padding < MINIMUM_PACKET_LEN {
        padding += block_size
    }
    padding
}

/// Read one packet into `buffer`. On success `buffer.buffer[5..]` is
/// the payload; the return value is the length of the buffer.
pub(crate) async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut (dyn OpeningKey + Send),
) -> Result<usize, Error> {
    if buffer.len == 0 {
        let mut len = vec![0; cipher.packet_length_to_read_for_block_length()];

        stream.read_exact(&mut len).await?;
        trace!("reading, len = {len:?}");
        {
            let seqn = buffer.seqn.0;
            buffer.buffer.clear();
            buffer.buffer.extend(&len);
            trace!("reading, seqn = {seqn:?}");
            let len = cipher.decrypt_packet_length(seqn, &len)?;
            let len = BigEndian::read_u32(&len) as usize;

            if len > MAXIMUM_PACKET_LEN || len + PACKET_LENGTH_LEN < MINIMUM_PACKET_LEN {
                return Err(Error::PacketSize(len));
            }

            buffer.len = len + cipher.tag_len();
            trace!("reading, clear len = {:?}", buffer.len);
        }
    }

    buffer.buffer.resize(buffer.len + PACKET_LENGTH_LEN);
    trace!("read_exact {:?}", buffer.len + PACKET_LENGTH_LEN);

    let l = cipher.packet_length_to_read_for_block_length();

    let rest = buffer.buffer.get_mut(l..).ok_or(Error::IndexOutOfBounds)?;
    stream.read_exact(rest).await?;

    trace!("read_exact done");
    let seqn = buffer.seqn.0;
    let plaintext = cipher.open(seqn, &mut buffer.buffer)?;

    let padding_length = *plaintext.first().unwrap_or(&0) as usize;
    trace!("reading, padding_length {padding_length:?}");
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .ok_or(Error::IndexOutOfBounds)?;
    if plaintext_end <= PADDING_LENGTH_LEN {
        // No room for a message type.
        return Err(Error::Inconsistent);
    }

    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    buffer.seqn += Wrapping(1);
    buffer.len = 0;
    buffer.bytes += plaintext_end + PACKET_LENGTH_LEN;

    // Remove the padding
    buffer.buffer.resize(plaintext_end + PACKET_LENGTH_LEN);

    Ok(plaintext_end + PACKET_LENGTH_LEN)
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;

const MINIMUM_PACKET_LEN: usize = 16;
const MAXIMUM_PACKET_LEN: usize = 256 * 1024;

const PADDING_LENGTH_LEN: usize = 1;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]
    use super::*;
    use crate::mac::{self, MACS};

    fn key_pair(
        cipher: &Name,
        mac: &mac::Name,
    ) -> (Box<dyn SealingKey + Send>, Box<dyn OpeningKey + Send>) {
        let c = CIPHERS.get(cipher).unwrap();
        let m = MACS.get(mac).unwrap();
        let key: Vec<u8> = (0..c.key_len()).map(|i| i as u8).collect();
        let nonce: Vec<u8> = (0..c.nonce_len()).map(|i| 100 + i as u8).collect();
        let mac_key: Vec<u8> = (0..m.key_len()).map(|i| 200u8.wrapping_add(i as u8)).collect();
        (
            c.make_sealing_key(&key, &nonce, &mac_key, *m).unwrap(),
            c.make_opening_key(&key, &nonce, &mac_key, *m).unwrap(),
        )
    }

    const PAIRS: &[(Name, mac::Name)] = &[
        (CLEAR, mac::NONE),
        (AES_128_CTR, mac::HMAC_SHA256),
        (AES_192_CTR, mac::HMAC_SHA1),
        (AES_256_CTR, mac::HMAC_SHA512),
        (AES_128_CTR, mac::HMAC_SHA256_ETM),
        (AES_256_CTR, mac::HMAC_SHA1_ETM),
        (CHACHA20_POLY1305, mac::NONE),
    ];

    #[tokio::test]
    async fn packets_survive_sealing_and_opening() {
        for (cipher, mac) in PAIRS {
            let (mut sealing, mut opening) = key_pair(cipher, mac);
            let mut out = SSHBuffer::new();
            let payloads: [&[u8]; 3] = [b"\x02", &[0x5e; 100], &[0x61; 3000]];
            for p in payloads {
                sealing.write(p, &mut out, 3);
            }
            assert_eq!(out.seqn, Wrapping(3));

            let mut stream = &out.buffer[..];
            let mut input = SSHBuffer::new();
            for p in payloads {
                let n = read(&mut stream, &mut input, opening.as_mut()).await.unwrap();
                assert_eq!(n, p.len() + 5, "{cipher:?}/{mac:?}");
                assert_eq!(&input.buffer[5..], p, "{cipher:?}/{mac:?}");
            }
            assert_eq!(input.seqn, Wrapping(3));
            assert!(stream.is_empty());
        }
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        for (cipher, mac) in PAIRS.iter().skip(1) {
            let (mut sealing, mut opening) = key_pair(cipher, mac);
            let mut out = SSHBuffer::new();
            sealing.write(b"\x5ehello, world", &mut out, 0);
            let last = out.buffer.len() - 1;
            let mut bytes = out.buffer.to_vec();
            bytes[last] ^= 1;

            let mut stream = &bytes[..];
            let mut input = SSHBuffer::new();
            let err = read(&mut stream, &mut input, opening.as_mut())
                .await
                .unwrap_err();
            assert_eq!(
                err.disconnect_reason(),
                Some(crate::Disconnect::MACError),
                "{cipher:?}/{mac:?}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_bound_to_packets() {
        let (mut sealing, mut opening) = key_pair(&AES_128_CTR, &mac::HMAC_SHA256_ETM);
        let mut out = SSHBuffer::new();
        sealing.write(b"\x02abc", &mut out, 0);

        let mut stream = &out.buffer[..];
        let mut input = SSHBuffer::new();
        input.seqn = Wrapping(1);
        assert!(matches!(
            read(&mut stream, &mut input, opening.as_mut()).await,
            Err(Error::PacketAuth)
        ));
    }

    #[tokio::test]
    async fn oversized_packets_are_rejected() {
        let mut bytes = ((MAXIMUM_PACKET_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend([0; 16]);
        let mut stream = &bytes[..];
        let mut input = SSHBuffer::new();
        let mut clear = clear::Key;
        assert!(matches!(
            read(&mut stream, &mut input, &mut clear).await,
            Err(Error::PacketSize(_))
        ));
    }

    #[test]
    fn padding_respects_minimums() {
        for len in 0..100 {
            for (block, aligned) in [(8, true), (16, true), (8, false), (16, false)] {
                let p = padding_length(len, block, aligned);
                assert!(p >= 4);
                assert!(PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + len + p >= MINIMUM_PACKET_LEN);
                let covered = PADDING_LENGTH_LEN + len + p + if aligned { 4 } else { 0 };
                assert_eq!(covered % block, 0);
            }
        }
    }
}
