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

//! AES in counter mode, authenticated by a separate MAC.

use std::marker::PhantomData;

use aes::cipher::{IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use rand::RngCore;

use super::{padding_length, PACKET_LENGTH_LEN};
use crate::mac::{Mac, MacAlgorithm};
use crate::Error;

const BLOCK_SIZE: usize = 16;

pub struct SshBlockCipher<C>(pub PhantomData<C>);

/// One direction of a CTR cipher with its MAC.
pub(crate) struct CtrKey<C> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

impl<C: KeyIvInit> CtrKey<C> {
    fn new(key: &[u8], iv: &[u8], mac_key: &[u8], mac: &dyn MacAlgorithm) -> Result<Self, Error> {
        Ok(CtrKey {
            cipher: C::new_from_slices(key, iv).map_err(|_| Error::Kex)?,
            mac: mac.make_mac(mac_key)?,
        })
    }
}

impl<C: StreamCipher + KeyIvInit + Clone + Send + 'static> super::Cipher for SshBlockCipher<C> {
    fn key_len(&self) -> usize {
        <C as KeySizeUser>::key_size()
    }

    fn nonce_len(&self) -> usize {
        <C as IvSizeUser>::iv_size()
    }

    fn needs_mac(&self) -> bool {
        true
    }

    fn make_opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(CtrKey::<C>::new(k, n, m, mac)?))
    }

    fn make_sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(CtrKey::<C>::new(k, n, m, mac)?))
    }
}

impl<C: StreamCipher + Clone> super::OpeningKey for CtrKey<C> {
    fn packet_length_to_read_for_block_length(&self) -> usize {
        BLOCK_SIZE
    }

    fn decrypt_packet_length(&self, _seqn: u32, first_block: &[u8]) -> Result<[u8; 4], Error> {
        let mut length: [u8; PACKET_LENGTH_LEN] = first_block
            .get(..PACKET_LENGTH_LEN)
            .and_then(|l| l.try_into().ok())
            .ok_or(Error::IndexOutOfBounds)?;
        if !self.mac.is_etm() {
            // open() decrypts from the start of the packet again, so
            // this must not advance the keystream.
            self.cipher.clone().apply_keystream(&mut length);
        }
        Ok(length)
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open<'a>(&mut self, seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error> {
        let packet_len = ciphertext_and_tag
            .len()
            .checked_sub(self.mac.mac_len())
            .ok_or(Error::IndexOutOfBounds)?;
        let (packet, tag) = ciphertext_and_tag.split_at_mut(packet_len);
        if self.mac.is_etm() {
            // The length stays in the clear and the tag covers the
            // ciphertext.
            if !self.mac.verify(seqn, packet, tag) {
                return Err(Error::PacketAuth);
            }
            let body = packet
                .get_mut(PACKET_LENGTH_LEN..)
                .ok_or(Error::IndexOutOfBounds)?;
            self.cipher.apply_keystream(body);
        } else {
            self.cipher.apply_keystream(packet);
            if !self.mac.verify(seqn, packet, tag) {
                return Err(Error::PacketAuth);
            }
        }
        packet
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl<C: StreamCipher> super::SealingKey for CtrKey<C> {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn padding_length(&self, payload: &[u8]) -> usize {
        padding_length(payload.len(), BLOCK_SIZE, !self.mac.is_etm())
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn seal(&mut self, seqn: u32, packet: &mut [u8], tag_out: &mut [u8]) {
        if self.mac.is_etm() {
            let body_start = PACKET_LENGTH_LEN.min(packet.len());
            if let Some(body) = packet.get_mut(body_start..) {
                self.cipher.apply_keystream(body);
            }
            self.mac.compute(seqn, packet, tag_out);
        } else {
            self.mac.compute(seqn, packet, tag_out);
            self.cipher.apply_keystream(packet);
        }
    }
}
