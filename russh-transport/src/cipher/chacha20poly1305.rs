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

//! `chacha20-poly1305@openssh.com`, see
//! <http://cvsweb.openbsd.org/cgi-bin/cvsweb/src/usr.bin/ssh/PROTOCOL.chacha20poly1305?annotate=HEAD>

use chacha20::cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20Legacy;
use generic_array::typenum::U32;
use generic_array::GenericArray;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;

use super::{padding_length, PACKET_LENGTH_LEN};
use crate::mac::MacAlgorithm;
use crate::Error;

pub struct SshChacha20Poly1305Cipher {}

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const BLOCK_SIZE: usize = 8;
/// Block 0 of the main keystream is the Poly1305 key.
const CHACHA_BLOCK_LEN: usize = 64;

type Key = GenericArray<u8, U32>;

/// Same construction in both directions: `header` encrypts the length
/// field, `main` the rest of the packet.
pub(crate) struct Keys {
    main: Key,
    header: Key,
}

impl Keys {
    /// `k` is the 64 byte derived key: `main` then `header`.
    fn new(k: &[u8]) -> Self {
        let mut keys = Keys {
            main: Key::default(),
            header: Key::default(),
        };
        for (dst, src) in keys.main.iter_mut().chain(keys.header.iter_mut()).zip(k) {
            *dst = *src;
        }
        keys
    }

    /// The nonce is the sequence number, as a 64-bit big-endian integer.
    fn stream(key: &Key, seqn: u32) -> ChaCha20Legacy {
        let nonce = GenericArray::from(u64::from(seqn).to_be_bytes());
        ChaCha20Legacy::new(key, &nonce)
    }

    fn body_stream(&self, seqn: u32) -> ChaCha20Legacy {
        let mut stream = Self::stream(&self.main, seqn);
        stream.seek(CHACHA_BLOCK_LEN);
        stream
    }

    fn tag(&self, seqn: u32, packet: &[u8]) -> poly1305::Tag {
        let mut poly_key = poly1305::Key::default();
        Self::stream(&self.main, seqn).apply_keystream(&mut poly_key);
        Poly1305::new(&poly_key).compute_unpadded(packet)
    }
}

impl super::Cipher for SshChacha20Poly1305Cipher {
    fn key_len(&self) -> usize {
        KEY_LEN * 2
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(Keys::new(k)))
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(Keys::new(k)))
    }
}

impl super::OpeningKey for Keys {
    fn decrypt_packet_length(&self, seqn: u32, encrypted: &[u8]) -> Result<[u8; 4], Error> {
        let mut length: [u8; PACKET_LENGTH_LEN] = encrypted
            .get(..PACKET_LENGTH_LEN)
            .and_then(|l| l.try_into().ok())
            .ok_or(Error::IndexOutOfBounds)?;
        Self::stream(&self.header, seqn).apply_keystream(&mut length);
        Ok(length)
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn open<'a>(&mut self, seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error> {
        let packet_len = ciphertext_and_tag
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(Error::IndexOutOfBounds)?;
        let (packet, tag) = ciphertext_and_tag.split_at_mut(packet_len);
        // The tag covers the encrypted length field too.
        if !bool::from(self.tag(seqn, packet).as_slice().ct_eq(tag)) {
            return Err(Error::DecryptionError);
        }
        let body = packet
            .get_mut(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)?;
        self.body_stream(seqn).apply_keystream(body);
        Ok(body)
    }
}

impl super::SealingKey for Keys {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn padding_length(&self, payload: &[u8]) -> usize {
        padding_length(payload.len(), BLOCK_SIZE, false)
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        padding_out.fill(0);
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    fn seal(&mut self, seqn: u32, packet: &mut [u8], tag_out: &mut [u8]) {
        let (length, body) = packet.split_at_mut(PACKET_LENGTH_LEN.min(packet.len()));
        Self::stream(&self.header, seqn).apply_keystream(length);
        self.body_stream(seqn).apply_keystream(body);
        let tag = self.tag(seqn, packet);
        for (out, t) in tag_out.iter_mut().zip(tag) {
            *out = t;
        }
    }
}
