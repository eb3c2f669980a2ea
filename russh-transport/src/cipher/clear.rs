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

use super::{padding_length, PACKET_LENGTH_LEN};
use crate::mac::MacAlgorithm;
use crate::Error;

/// Packets before the first NEWKEYS.
#[derive(Debug)]
pub struct Clear {}

#[derive(Debug)]
pub struct Key;

const BLOCK_SIZE: usize = 8;

impl super::Cipher for Clear {
    fn key_len(&self) -> usize {
        0
    }

    fn make_opening_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::OpeningKey + Send>, Error> {
        Ok(Box::new(Key))
    }

    fn make_sealing_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Result<Box<dyn super::SealingKey + Send>, Error> {
        Ok(Box::new(Key))
    }
}

impl super::OpeningKey for Key {
    fn decrypt_packet_length(&self, _seqn: u32, packet_length: &[u8]) -> Result<[u8; 4], Error> {
        packet_length
            .get(..PACKET_LENGTH_LEN)
            .and_then(|l| l.try_into().ok())
            .ok_or(Error::IndexOutOfBounds)
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open<'a>(&mut self, _seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error> {
        ciphertext_and_tag
            .get(PACKET_LENGTH_LEN..)
            .ok_or(Error::IndexOutOfBounds)
    }
}

impl super::SealingKey for Key {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn padding_length(&self, payload: &[u8]) -> usize {
        padding_length(payload.len(), BLOCK_SIZE, true)
    }

    fn fill_padding(&self, padding_out: &mut [u8]) {
        padding_out.fill(0);
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&mut self, _seqn: u32, _plaintext_in_ciphertext_out: &mut [u8], _tag_out: &mut [u8]) {}
}
