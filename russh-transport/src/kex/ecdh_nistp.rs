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

//! `ecdh-sha2-nistp*`, RFC 5656.

use elliptic_curve::ecdh::{EphemeralSecret, SharedSecret};
use elliptic_curve::point::PointCompression;
use elliptic_curve::sec1::{FromEncodedPoint, ModulusSize, ToEncodedPoint};
use elliptic_curve::{AffinePoint, CurveArithmetic, FieldBytesSize, PublicKey};
use p256::NistP256;
use p384::NistP384;
use p521::NistP521;
use ssh_encoding::Encode;

use super::{KexAlgorithm, KexHash};
#[cfg(test)]
use crate::session::Exchange;
use crate::{msg, CryptoVec, Error};

pub(crate) fn nistp256() -> Box<dyn KexAlgorithm + Send> {
    Box::new(EcdhNistPKex::<NistP256>::new(KexHash::Sha256))
}

pub(crate) fn nistp384() -> Box<dyn KexAlgorithm + Send> {
    Box::new(EcdhNistPKex::<NistP384>::new(KexHash::Sha384))
}

pub(crate) fn nistp521() -> Box<dyn KexAlgorithm + Send> {
    Box::new(EcdhNistPKex::<NistP521>::new(KexHash::Sha512))
}

pub(crate) struct EcdhNistPKex<C: CurveArithmetic> {
    hash: KexHash,
    secret: Option<EphemeralSecret<C>>,
    shared: Option<SharedSecret<C>>,
}

impl<C> EcdhNistPKex<C>
where
    C: CurveArithmetic + PointCompression,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
{
    fn new(hash: KexHash) -> Self {
        EcdhNistPKex {
            hash,
            secret: None,
            shared: None,
        }
    }

    /// A new ephemeral key pair; returns the SEC1 encoded public half.
    fn generate(&mut self) -> Box<[u8]> {
        let secret = EphemeralSecret::<C>::random(&mut rand_core::OsRng);
        let public = secret.public_key().to_sec1_bytes();
        self.secret = Some(secret);
        public
    }

    fn agree(&mut self, remote: &[u8]) -> Result<(), Error> {
        let secret = self.secret.take().ok_or(Error::KexInit)?;
        let remote = PublicKey::<C>::from_sec1_bytes(remote).map_err(|_| Error::Kex)?;
        self.shared = Some(secret.diffie_hellman(&remote));
        Ok(())
    }
}

impl<C> KexAlgorithm for EcdhNistPKex<C>
where
    C: CurveArithmetic + PointCompression,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
{
    fn client_dh(
        &mut self,
        client_ephemeral: &mut CryptoVec,
        writer: &mut CryptoVec,
    ) -> Result<(), Error> {
        let public = self.generate();
        client_ephemeral.clear();
        client_ephemeral.extend(&public);
        msg::KEX_ECDH_INIT.encode(writer)?;
        public[..].encode(writer)?;
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        self.agree(remote_pubkey)
    }

    fn hash(&self) -> KexHash {
        self.hash
    }

    fn shared_secret(&self) -> Option<&[u8]> {
        self.shared
            .as_ref()
            .map(|s| s.raw_secret_bytes().as_slice())
    }

    #[cfg(test)]
    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error> {
        let public = self.generate();
        exchange.server_ephemeral.clear();
        exchange.server_ephemeral.extend(&public);
        self.agree(super::kex_payload_string(payload, msg::KEX_ECDH_INIT)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]
    use super::*;

    #[test]
    fn points_off_the_curve_are_rejected() {
        let mut kex = EcdhNistPKex::<NistP256>::new(KexHash::Sha256);
        let public = kex.generate();
        assert_eq!(public.len(), 65);
        let mut bogus = public.to_vec();
        bogus[64] ^= 1;
        assert!(kex.compute_shared_secret(&bogus).is_err());
    }
}
