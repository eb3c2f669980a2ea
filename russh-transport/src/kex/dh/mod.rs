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

//! Finite field Diffie-Hellman: the fixed groups of RFC 8268, and group
//! exchange (RFC 4419) where the server picks the group.
mod groups;

pub use groups::DhGroup;
use groups::{DH, DH_GROUP14, DH_GROUP16};
use log::debug;
use num_bigint::BigUint;
use ssh_encoding::Encode;

use super::{encode_mpint, GexParams, KexAlgorithm, KexHash};
#[cfg(test)]
use crate::session::Exchange;
use crate::{msg, CryptoVec, Error};

pub(crate) struct DhGroupKex {
    hash: KexHash,
    /// `None` for group exchange until the server sends its group.
    group: Option<DhGroup>,
    dh: Option<DH>,
    /// Set for group exchange, once the request is sent.
    gex: Option<GexParams>,
    is_gex: bool,
    shared: Option<Vec<u8>>,
}

impl DhGroupKex {
    fn new(hash: KexHash, group: Option<DhGroup>) -> Box<dyn KexAlgorithm + Send> {
        Box::new(DhGroupKex {
            hash,
            is_gex: group.is_none(),
            dh: group.as_ref().map(DH::new),
            group,
            gex: None,
            shared: None,
        })
    }

    pub(crate) fn group14_sha1() -> Box<dyn KexAlgorithm + Send> {
        Self::new(KexHash::Sha1, Some(DH_GROUP14))
    }

    pub(crate) fn group14_sha256() -> Box<dyn KexAlgorithm + Send> {
        Self::new(KexHash::Sha256, Some(DH_GROUP14))
    }

    pub(crate) fn group16_sha512() -> Box<dyn KexAlgorithm + Send> {
        Self::new(KexHash::Sha512, Some(DH_GROUP16))
    }

    pub(crate) fn gex_sha256() -> Box<dyn KexAlgorithm + Send> {
        Self::new(KexHash::Sha256, None)
    }

    fn dh(&mut self) -> Result<&mut DH, Error> {
        self.dh.as_mut().ok_or(Error::KexInit)
    }

    /// A new ephemeral key, as the body of an `mpint`.
    fn generate(&mut self) -> Result<Vec<u8>, Error> {
        let dh = self.dh()?;
        let public = dh.generate_keys();
        if !dh.validate(&public) {
            return Err(Error::Kex);
        }
        Ok(mpint_body(&public))
    }

    fn agree(&mut self, remote: &[u8]) -> Result<(), Error> {
        let dh = self.dh()?;
        let remote = BigUint::from_bytes_be(remote);
        if !dh.validate(&remote) {
            return Err(Error::Kex);
        }
        let shared = dh.compute_shared_secret(&remote);
        if !dh.validate(&shared) {
            return Err(Error::Kex);
        }
        self.shared = Some(shared.to_bytes_be());
        Ok(())
    }

    fn init_message(&self) -> u8 {
        if self.is_gex {
            msg::KEX_DH_GEX_INIT
        } else {
            msg::KEX_ECDH_INIT
        }
    }
}

/// Big-endian, with a leading zero when the high bit is set. Encoded as
/// a string this is a valid `mpint`.
fn mpint_body(n: &BigUint) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    let pad = bytes.first().is_some_and(|b| *b & 0x80 != 0);
    let mut body = Vec::with_capacity(bytes.len() + 1);
    if pad {
        body.push(0);
    }
    body.extend(bytes);
    body
}

impl KexAlgorithm for DhGroupKex {
    fn is_dh_gex(&self) -> bool {
        self.is_gex
    }

    fn client_dh_gex_init(&mut self, gex: &GexParams, writer: &mut CryptoVec) -> Result<(), Error> {
        if !self.is_gex {
            return Err(Error::Kex);
        }
        msg::KEX_DH_GEX_REQUEST.encode(writer)?;
        for bits in [
            gex.min_group_size(),
            gex.preferred_group_size(),
            gex.max_group_size(),
        ] {
            (bits as u32).encode(writer)?;
        }
        self.gex = Some(*gex);
        Ok(())
    }

    fn dh_gex_set_group(&mut self, group: DhGroup) -> Result<(), Error> {
        let gex = self.gex.ok_or(Error::Kex)?;
        group.check(gex.min_group_size(), gex.max_group_size())?;
        debug!("server sent a {} bit group", group.bit_size());
        self.dh = Some(DH::new(&group));
        self.group = Some(group);
        Ok(())
    }

    fn client_dh(
        &mut self,
        client_ephemeral: &mut CryptoVec,
        writer: &mut CryptoVec,
    ) -> Result<(), Error> {
        let public = self.generate()?;
        client_ephemeral.clear();
        client_ephemeral.extend(&public);
        self.init_message().encode(writer)?;
        public.encode(writer)?;
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        self.agree(remote_pubkey)
    }

    fn hash(&self) -> KexHash {
        self.hash
    }

    fn shared_secret(&self) -> Option<&[u8]> {
        self.shared.as_deref()
    }

    fn hash_group(&self, buffer: &mut CryptoVec) -> Result<(), Error> {
        if !self.is_gex {
            return Ok(());
        }
        let gex = self.gex.ok_or(Error::KexInit)?;
        let group = self.group.as_ref().ok_or(Error::KexInit)?;
        (gex.min_group_size() as u32).encode(buffer)?;
        (gex.preferred_group_size() as u32).encode(buffer)?;
        (gex.max_group_size() as u32).encode(buffer)?;
        encode_mpint(&group.prime, buffer)?;
        encode_mpint(&group.generator, buffer)
    }

    #[cfg(test)]
    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        let client_public = super::kex_payload_string(payload, self.init_message())?.to_vec();
        let public = self.generate()?;
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend(&public);
        self.agree(&client_public)
    }
}
