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

//! Message authentication codes, by their negotiated [`Name`].
use std::collections::HashMap;

use delegate::delegate;
use hmac::Hmac;
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use ssh_encoding::Encode;

use self::hmac_sha::HmacAlgorithm;
use self::none::NoMac;
use crate::Error;

mod hmac_sha;
mod none;

pub(crate) trait MacAlgorithm {
    fn key_len(&self) -> usize;
    fn make_mac(&self, key: &[u8]) -> Result<Box<dyn Mac + Send>, Error>;
}

pub(crate) trait Mac {
    fn mac_len(&self) -> usize;
    /// Encrypt-then-MAC: the tag covers the ciphertext, and the packet
    /// length is sent in the clear.
    fn is_etm(&self) -> bool {
        false
    }
    fn compute(&self, sequence_number: u32, payload: &[u8], output: &mut [u8]);
    fn verify(&self, sequence_number: u32, payload: &[u8], mac: &[u8]) -> bool;
}

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

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        ALL_MAC_ALGORITHMS
            .iter()
            .find(|name| name.0 == s)
            .map(|name| **name)
            .ok_or(())
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `hmac-sha1`
pub const HMAC_SHA1: Name = Name("hmac-sha1");
/// `hmac-sha2-256`
pub const HMAC_SHA256: Name = Name("hmac-sha2-256");
/// `hmac-sha2-512`
pub const HMAC_SHA512: Name = Name("hmac-sha2-512");
/// `hmac-sha1-etm@openssh.com`
pub const HMAC_SHA1_ETM: Name = Name("hmac-sha1-etm@openssh.com");
/// `hmac-sha2-256-etm@openssh.com`
pub const HMAC_SHA256_ETM: Name = Name("hmac-sha2-256-etm@openssh.com");
/// `hmac-sha2-512-etm@openssh.com`
pub const HMAC_SHA512_ETM: Name = Name("hmac-sha2-512-etm@openssh.com");

pub const ALL_MAC_ALGORITHMS: &[&Name] = &[
    &NONE,
    &HMAC_SHA1,
    &HMAC_SHA256,
    &HMAC_SHA512,
    &HMAC_SHA1_ETM,
    &HMAC_SHA256_ETM,
    &HMAC_SHA512_ETM,
];

type MacRef = &'static (dyn MacAlgorithm + Send + Sync);

pub(crate) static MACS: Lazy<HashMap<&'static Name, MacRef>> = Lazy::new(|| {
    static SHA1: HmacAlgorithm<Hmac<Sha1>> = HmacAlgorithm::new(false);
    static SHA256: HmacAlgorithm<Hmac<Sha256>> = HmacAlgorithm::new(false);
    static SHA512: HmacAlgorithm<Hmac<Sha512>> = HmacAlgorithm::new(false);
    static SHA1_ETM: HmacAlgorithm<Hmac<Sha1>> = HmacAlgorithm::new(true);
    static SHA256_ETM: HmacAlgorithm<Hmac<Sha256>> = HmacAlgorithm::new(true);
    static SHA512_ETM: HmacAlgorithm<Hmac<Sha512>> = HmacAlgorithm::new(true);
    let table: [(&'static Name, MacRef); 7] = [
        (&NONE, &NoMac),
        (&HMAC_SHA1, &SHA1),
        (&HMAC_SHA256, &SHA256),
        (&HMAC_SHA512, &SHA512),
        (&HMAC_SHA1_ETM, &SHA1_ETM),
        (&HMAC_SHA256_ETM, &SHA256_ETM),
        (&HMAC_SHA512_ETM, &SHA512_ETM),
    ];
    table.into_iter().collect()
});

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn every_name_is_registered() {
        assert_eq!(MACS.len(), ALL_MAC_ALGORITHMS.len());
        for name in ALL_MAC_ALGORITHMS {
            assert_eq!(Name::try_from(name.as_ref()), Ok(**name));
        }
    }

    #[test]
    fn tag_depends_on_sequence_number() {
        let algo = MACS.get(&HMAC_SHA256).unwrap();
        let key = vec![7u8; algo.key_len()];
        let mac = algo.make_mac(&key).unwrap();
        assert!(!mac.is_etm());

        let mut tag = vec![0; mac.mac_len()];
        mac.compute(3, b"payload", &mut tag);
        assert!(mac.verify(3, b"payload", &tag));
        assert!(!mac.verify(4, b"payload", &tag));
        assert!(!mac.verify(3, b"paylaod", &tag));

        let etm = MACS.get(&HMAC_SHA512_ETM).unwrap().make_mac(&[1; 64]).unwrap();
        assert!(etm.is_etm());
        assert_eq!(etm.mac_len(), 64);
    }

    #[test]
    fn short_keys_are_rejected() {
        let algo = MACS.get(&HMAC_SHA1).unwrap();
        assert!(algo.make_mac(&[0; 16]).is_err());
    }
}
