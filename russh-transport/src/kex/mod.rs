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

//! Key exchange algorithms, by their negotiated [`Name`]. Every
//! algorithm agrees on a shared secret; hashing and key derivation are
//! shared.
mod curve25519;
pub(crate) mod dh;
mod ecdh_nistp;

use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;

use delegate::delegate;
use digest::Digest;
use once_cell::sync::Lazy;
use ssh_encoding::{Encode, Writer};
use ssh_key::Mpint;

use crate::cipher::{self, CipherPair, CIPHERS};
use crate::mac::{self, MACS};
use crate::session::Exchange;
use crate::{CryptoVec, Error};

/// Builds a fresh algorithm state for one exchange.
#[derive(Clone, Copy)]
pub(crate) struct KexType(fn() -> Box<dyn KexAlgorithm + Send>);

impl KexType {
    pub(crate) fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        (self.0)()
    }
}

/// Hash function of an exchange, used for the exchange hash and for
/// key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KexHash {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl KexHash {
    fn digest(self, parts: &[&[u8]]) -> CryptoVec {
        fn run<D: Digest>(parts: &[&[u8]]) -> CryptoVec {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            CryptoVec::from_slice(hasher.finalize().as_slice())
        }
        match self {
            KexHash::Sha1 => run::<sha1::Sha1>(parts),
            KexHash::Sha256 => run::<sha2::Sha256>(parts),
            KexHash::Sha384 => run::<sha2::Sha384>(parts),
            KexHash::Sha512 => run::<sha2::Sha512>(parts),
        }
    }
}

impl Debug for dyn KexAlgorithm + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KexAlgorithm")
    }
}

pub(crate) trait KexAlgorithm {
    /// Group exchange sends a group request before the DH init.
    fn is_dh_gex(&self) -> bool {
        false
    }

    fn client_dh_gex_init(
        &mut self,
        _gex: &GexParams,
        _writer: &mut CryptoVec,
    ) -> Result<(), Error> {
        Err(Error::Kex)
    }

    /// Install the group sent by the server in KEX_DH_GEX_GROUP.
    fn dh_gex_set_group(&mut self, _group: dh::DhGroup) -> Result<(), Error> {
        Err(Error::Kex)
    }

    /// Write our ephemeral key message, and keep a copy of the
    /// ephemeral key for the exchange hash.
    fn client_dh(
        &mut self,
        client_ephemeral: &mut CryptoVec,
        writer: &mut CryptoVec,
    ) -> Result<(), Error>;

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error>;

    fn hash(&self) -> KexHash;

    /// Raw shared secret, once computed.
    fn shared_secret(&self) -> Option<&[u8]>;

    /// Fields hashed between the host key and the ephemeral keys.
    fn hash_group(&self, _buffer: &mut CryptoVec) -> Result<(), Error> {
        Ok(())
    }

    /// RFC 4253 section 8, RFC 5656 section 4 and RFC 4419 section 3.
    fn compute_exchange_hash(
        &self,
        server_host_key: &[u8],
        exchange: &Exchange,
        buffer: &mut CryptoVec,
    ) -> Result<CryptoVec, Error> {
        buffer.clear();
        exchange.client_id[..].encode(buffer)?;
        exchange.server_id[..].encode(buffer)?;
        exchange.client_kex_init[..].encode(buffer)?;
        exchange.server_kex_init[..].encode(buffer)?;
        server_host_key.encode(buffer)?;
        self.hash_group(buffer)?;
        exchange.client_ephemeral[..].encode(buffer)?;
        exchange.server_ephemeral[..].encode(buffer)?;
        encode_mpint(self.shared_secret().ok_or(Error::KexInit)?, buffer)?;
        Ok(self.hash().digest(&[&buffer[..]]))
    }

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        client_to_server: (cipher::Name, mac::Name),
        server_to_client: (cipher::Name, mac::Name),
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        let derive = KeyDerivation {
            hash: self.hash(),
            shared_secret: self.shared_secret().ok_or(Error::KexInit)?,
            session_id,
            exchange_hash,
        };
        derive.cipher_pair(client_to_server, server_to_client, is_server)
    }

    /// Server half of the exchange, used by the test server.
    #[cfg(test)]
    fn server_dh(&mut self, exchange: &mut Exchange, payload: &[u8]) -> Result<(), Error>;
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

impl Borrow<str> for &Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        KEXES
            .keys()
            .chain(ALL_EXTENSIONS.iter())
            .find(|x| x.0 == s)
            .map(|x| **x)
            .ok_or(())
    }
}

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");
/// `diffie-hellman-group14-sha1`
pub const DH_G14_SHA1: Name = Name("diffie-hellman-group14-sha1");
/// `diffie-hellman-group14-sha256`
pub const DH_G14_SHA256: Name = Name("diffie-hellman-group14-sha256");
/// `diffie-hellman-group16-sha512`
pub const DH_G16_SHA512: Name = Name("diffie-hellman-group16-sha512");
/// `diffie-hellman-group-exchange-sha256`
pub const DH_GEX_SHA256: Name = Name("diffie-hellman-group-exchange-sha256");
/// `ecdh-sha2-nistp256`
pub const ECDH_SHA2_NISTP256: Name = Name("ecdh-sha2-nistp256");
/// `ecdh-sha2-nistp384`
pub const ECDH_SHA2_NISTP384: Name = Name("ecdh-sha2-nistp384");
/// `ecdh-sha2-nistp521`
pub const ECDH_SHA2_NISTP521: Name = Name("ecdh-sha2-nistp521");
/// `ext-info-c`
pub const EXTENSION_SUPPORT_AS_CLIENT: Name = Name("ext-info-c");
/// `ext-info-s`
pub const EXTENSION_SUPPORT_AS_SERVER: Name = Name("ext-info-s");
/// `kex-strict-c-v00@openssh.com`
pub const EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT: Name = Name("kex-strict-c-v00@openssh.com");
/// `kex-strict-s-v00@openssh.com`
pub const EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER: Name = Name("kex-strict-s-v00@openssh.com");

/// Pseudo-algorithms: advertised in the kex list, never selected.
pub const ALL_EXTENSIONS: &[&Name] = &[
    &EXTENSION_SUPPORT_AS_CLIENT,
    &EXTENSION_SUPPORT_AS_SERVER,
    &EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
    &EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
];

pub(crate) fn is_extension(name: &str) -> bool {
    ALL_EXTENSIONS.iter().any(|e| e.0 == name)
}

pub const ALL_KEX_ALGORITHMS: &[&Name] = &[
    &CURVE25519,
    &CURVE25519_PRE_RFC_8731,
    &DH_G14_SHA1,
    &DH_G14_SHA256,
    &DH_G16_SHA512,
    &DH_GEX_SHA256,
    &ECDH_SHA2_NISTP256,
    &ECDH_SHA2_NISTP384,
    &ECDH_SHA2_NISTP521,
];

pub(crate) static KEXES: Lazy<HashMap<&'static Name, KexType>> = Lazy::new(|| {
    let table: [(&'static Name, KexType); 9] = [
        (&CURVE25519, KexType(curve25519::Curve25519Kex::boxed)),
        (&CURVE25519_PRE_RFC_8731, KexType(curve25519::Curve25519Kex::boxed)),
        (&DH_G14_SHA1, KexType(dh::DhGroupKex::group14_sha1)),
        (&DH_G14_SHA256, KexType(dh::DhGroupKex::group14_sha256)),
        (&DH_G16_SHA512, KexType(dh::DhGroupKex::group16_sha512)),
        (&DH_GEX_SHA256, KexType(dh::DhGroupKex::gex_sha256)),
        (&ECDH_SHA2_NISTP256, KexType(ecdh_nistp::nistp256)),
        (&ECDH_SHA2_NISTP384, KexType(ecdh_nistp::nistp384)),
        (&ECDH_SHA2_NISTP521, KexType(ecdh_nistp::nistp521)),
    ];
    table.into_iter().collect()
});

/// Group sizes, in bits, requested in diffie-hellman-group-exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GexParams {
    min_group_size: usize,
    preferred_group_size: usize,
    max_group_size: usize,
}

impl GexParams {
    pub fn new(
        min_group_size: usize,
        preferred_group_size: usize,
        max_group_size: usize,
    ) -> Result<Self, Error> {
        let this = Self {
            min_group_size,
            preferred_group_size,
            max_group_size,
        };
        this.validate()?;
        Ok(this)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.min_group_size < 2048 {
            return Err(Error::InvalidConfig(
                "min_group_size must be at least 2048 bits".into(),
            ));
        }
        if self.min_group_size > self.preferred_group_size
            || self.preferred_group_size > self.max_group_size
        {
            return Err(Error::InvalidConfig(
                "expected min <= preferred <= max group size".into(),
            ));
        }
        Ok(())
    }

    pub fn min_group_size(&self) -> usize {
        self.min_group_size
    }

    pub fn preferred_group_size(&self) -> usize {
        self.preferred_group_size
    }

    pub fn max_group_size(&self) -> usize {
        self.max_group_size
    }
}

impl Default for GexParams {
    fn default() -> Self {
        GexParams {
            min_group_size: 2048,
            preferred_group_size: 3072,
            max_group_size: 8192,
        }
    }
}

/// Encode a positive big-endian integer as an SSH `mpint`.
pub(crate) fn encode_mpint<W: Writer>(s: &[u8], w: &mut W) -> Result<(), Error> {
    Mpint::from_positive_bytes(s)?.encode(w)?;
    Ok(())
}

/// Key derivation, RFC 4253 section 7.2.
struct KeyDerivation<'a> {
    hash: KexHash,
    shared_secret: &'a [u8],
    session_id: &'a [u8],
    exchange_hash: &'a [u8],
}

impl KeyDerivation<'_> {
    /// `HASH(K || H || letter || session_id)`, extended with
    /// `HASH(K || H || key so far)` until `len` bytes are available.
    fn key(&self, letter: u8, len: usize) -> Result<CryptoVec, Error> {
        let mut k = CryptoVec::new();
        encode_mpint(self.shared_secret, &mut k)?;
        let mut key = self
            .hash
            .digest(&[&k[..], self.exchange_hash, &[letter], self.session_id]);
        while key.len() < len {
            let more = self.hash.digest(&[&k[..], self.exchange_hash, &key[..]]);
            key.extend(&more);
        }
        key.resize(len);
        Ok(key)
    }

    fn cipher_pair(
        &self,
        client_to_server: (cipher::Name, mac::Name),
        server_to_client: (cipher::Name, mac::Name),
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        // Letters for (iv, key, mac key) in each direction.
        let client_to_server = (client_to_server, [b'A', b'C', b'E']);
        let server_to_client = (server_to_client, [b'B', b'D', b'F']);
        let (sending, receiving) = if is_server {
            (server_to_client, client_to_server)
        } else {
            (client_to_server, server_to_client)
        };

        let ((cipher, mac), [iv, key, mac_key]) = sending;
        let cipher = CIPHERS.get(&cipher).ok_or(Error::UnknownAlgo)?;
        let mac = *MACS.get(&mac).ok_or(Error::UnknownAlgo)?;
        let local_to_remote = cipher.make_sealing_key(
            &self.key(key, cipher.key_len())?,
            &self.key(iv, cipher.nonce_len())?,
            &self.key(mac_key, mac.key_len())?,
            mac,
        )?;

        let ((cipher, mac), [iv, key, mac_key]) = receiving;
        let cipher = CIPHERS.get(&cipher).ok_or(Error::UnknownAlgo)?;
        let mac = *MACS.get(&mac).ok_or(Error::UnknownAlgo)?;
        let remote_to_local = cipher.make_opening_key(
            &self.key(key, cipher.key_len())?,
            &self.key(iv, cipher.nonce_len())?,
            &self.key(mac_key, mac.key_len())?,
            mac,
        )?;
        Ok(CipherPair {
            local_to_remote,
            remote_to_local,
        })
    }
}

/// Extract the length-prefixed string following the message type of a
/// kex message.
pub(crate) fn kex_payload_string(payload: &[u8], message_type: u8) -> Result<&[u8], Error> {
    if payload.first() != Some(&message_type) {
        return Err(Error::Inconsistent);
    }
    let mut r = payload.get(1..).ok_or(Error::Inconsistent)?;
    let len = {
        use ssh_encoding::Decode;
        u32::decode(&mut r)? as usize
    };
    r.get(..len).ok_or(Error::Inconsistent)
}
