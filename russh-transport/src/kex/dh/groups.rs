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

use std::borrow::Cow;
use std::fmt::Debug;

use hex_literal::hex;
use num_bigint::{BigUint, RandBigInt};

use crate::Error;

/// A multiplicative group modulo a safe prime, from RFC 3526 or sent
/// by the server during group exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct DhGroup {
    pub(crate) prime: Cow<'static, [u8]>,
    pub(crate) generator: Cow<'static, [u8]>,
}

impl DhGroup {
    /// Big-endian bytes, as decoded from `mpint`s.
    pub fn new(prime: Vec<u8>, generator: Vec<u8>) -> Self {
        DhGroup {
            prime: Cow::Owned(prime),
            generator: Cow::Owned(generator),
        }
    }

    pub fn bit_size(&self) -> usize {
        BigUint::from_bytes_be(&self.prime).bits() as usize
    }

    /// Reject groups that are obviously unusable. The prime is not
    /// tested for primality.
    pub(crate) fn check(&self, min_bits: usize, max_bits: usize) -> Result<(), Error> {
        let bits = self.bit_size();
        if bits < min_bits || bits > max_bits {
            log::debug!("group of {bits} bits is outside of {min_bits}..={max_bits}");
            return Err(Error::Kex);
        }
        let p = BigUint::from_bytes_be(&self.prime);
        let g = BigUint::from_bytes_be(&self.generator);
        if !p.bit(0) || g <= BigUint::from(1u8) || g >= &p - 1u8 {
            return Err(Error::Kex);
        }
        Ok(())
    }
}

impl Debug for DhGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup")
            .field("prime", &format!("<{} bytes>", self.prime.len()))
            .field("generator", &format!("<{} bytes>", self.generator.len()))
            .finish()
    }
}

/// RFC 3526, 2048-bit MODP group.
pub const DH_GROUP14: DhGroup = DhGroup {
    prime: Cow::Borrowed(
        hex!(
                    "
                FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
                29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
                EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
                E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
                EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
                C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
                83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
                670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
                E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
                DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
                15728E5A 8AACAA68 FFFFFFFF FFFFFFFF
                "
        )
        .as_slice(),
    ),
    generator: Cow::Borrowed(&[2]),
};

/// RFC 3526, 4096-bit MODP group.
pub const DH_GROUP16: DhGroup = DhGroup {
    prime: Cow::Borrowed(
        hex!(
                    "
                FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
                29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
                EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
                E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
                EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
                C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
                83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
                670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
                E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
                DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
                15728E5A 8AAAC42D AD33170D 04507A33 A85521AB DF1CBA64
                ECFB8504 58DBEF0A 8AEA7157 5D060C7D B3970F85 A6E1E4C7
                ABF5AE8C DB0933D7 1E8C94E0 4A25619D CEE3D226 1AD2EE6B
                F12FFA06 D98A0864 D8760273 3EC86A64 521F2B18 177B200C
                BBE11757 7A615D6C 770988C0 BAD946E2 08E24FA0 74E5AB31
                43DB5BFC E0FD108E 4B82D120 A9210801 1A723C12 A787E6D7
                88719A10 BDBA5B26 99C32718 6AF4E23C 1A946834 B6150BDA
                2583E9CA 2AD44CE8 DBBBC2DB 04DE8EF9 2E8EFC14 1FBECAA6
                287C5947 4E6BC05D 99B2964F A090C3A2 233BA186 515BE7ED
                1F612970 CEE2D7AF B81BDD76 2170481C D0069127 D5B05AA9
                93B4EA98 8D8FDDC1 86FFB7DC 90A6C08F 4DF435C9 34063199
                FFFFFFFF FFFFFFFF
                "
        )
        .as_slice(),
    ),
    generator: Cow::Borrowed(&[2]),
};

pub(crate) struct DH {
    prime_num: BigUint,
    generator: BigUint,
    private_key: BigUint,
}

impl DH {
    pub fn new(group: &DhGroup) -> Self {
        Self {
            prime_num: BigUint::from_bytes_be(&group.prime),
            generator: BigUint::from_bytes_be(&group.generator),
            private_key: BigUint::default(),
        }
    }

    /// Pick a private exponent in `[2, (p - 1) / 2)` and return the
    /// matching public value.
    pub fn generate_keys(&mut self) -> BigUint {
        let q = (&self.prime_num - 1u8) / 2u8;
        let mut rng = rand::thread_rng();
        self.private_key = rng.gen_biguint_range(&BigUint::from(2u8), &q);
        self.generator.modpow(&self.private_key, &self.prime_num)
    }

    pub fn compute_shared_secret(&self, other_public_key: &BigUint) -> BigUint {
        other_public_key.modpow(&self.private_key, &self.prime_num)
    }

    /// Public values and shared secrets must lie in `(1, p - 1)`.
    pub fn validate(&self, value: &BigUint) -> bool {
        let one = BigUint::from(1u8);
        let prime_minus_one = &self.prime_num - &one;
        value > &one && value < &prime_minus_one
    }
}
