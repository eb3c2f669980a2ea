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

//! `curve25519-sha256`, RFC 8731.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ssh_encoding::Encode;

use super::{KexAlgorithm, KexHash};
#[cfg(test)]
use crate::session::Exchange;
use crate::{msg, CryptoVec, Error};

#[derive(Default)]
pub(crate) struct Curve25519Kex {
    secret: Option<Scalar>,
    shared: Option<MontgomeryPoint>,
}

impl Curve25519Kex {
    pub(crate) fn boxed() -> Box<dyn KexAlgorithm + Send> {
        Box::<Curve25519Kex>::default()
    }

    /// A new ephemeral key pair; returns the public half.
    fn generate(&mut self) -> MontgomeryPoint {
        let secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let public = (ED25519_BASEPOINT_TABLE * &secret).to_montgomery();
        self.secret = Some(secret);
        public
    }

    fn agree(&mut self, remote: &[u8]) -> Result<(), Error> {
        let secret = self.secret.take().ok_or(Error::KexInit)?;
        let remote: [u8; 32] = remote.try_into().map_err(|_| Error::Kex)?;
        let shared = secret * MontgomeryPoint(remote);
        // An all-zero result means the peer sent a low-order point.
        if shared.0.iter().all(|b| *b == 0) {
            return Err(Error::Kex);
        }
        self.shared = Some(shared);
        Ok(())
    }
}

impl KexAlgorithm for Curve25519Kex {
    fn client_dh(
        &mut self,
        client_ephemeral: &mut CryptoVec,
        writer: &mut CryptoVec,
    ) -> Result<(), Error> {
        let public = self.generate();
        client_ephemeral.clear();
        client_ephemeral.extend(&public.0);
        msg::KEX_ECDH_INIT.encode(writer)?;
        public.0[..].encode(writer)?;
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        self.agree(remote_pubkey)
    }

    fn hash(&self) -> KexHash {
        KexHash::Sha256
    }

    fn shared_secret(&self) -> Option<&[u8]> {
        self.shared.as_ref().map(|s| &s.0[..])
    }

    #[cfg(test)]
    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        let public = self.generate();
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend(&public.0);
        self.agree(super::kex_payload_string(payload, msg::KEX_ECDH_INIT)?)
    }
}
