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
use std::borrow::Cow;

use log::debug;
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Algorithm, EcdsaCurve};
#[cfg(feature = "rsa")]
use ssh_key::HashAlg;

use crate::cipher::CIPHERS;
use crate::helpers::NameList;
use crate::kex::{EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT, EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER};
use crate::sshbuffer::ServerId;
use crate::{cipher, compression, kex, mac, msg, AlgorithmKind, CryptoVec, Error};

/// The algorithms agreed upon in one key exchange. `client_*` apply to
/// the client to server direction, `server_*` to the other one.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: kex::Name,
    pub key: Algorithm,
    pub client_cipher: cipher::Name,
    pub server_cipher: cipher::Name,
    pub client_mac: mac::Name,
    pub server_mac: mac::Name,
    pub server_compression: compression::Compression,
    pub client_compression: compression::Compression,
    /// The peer sent a guessed kex packet for the wrong algorithm; it
    /// must be ignored.
    pub ignore_guessed: bool,
    pub strict_kex: bool,
}

impl Names {
    pub fn strict_kex(&self) -> bool {
        self.strict_kex
    }

    pub(crate) fn client_to_server(&self) -> (cipher::Name, mac::Name) {
        (self.client_cipher, self.client_mac)
    }

    pub(crate) fn server_to_client(&self) -> (cipher::Name, mac::Name) {
        (self.server_cipher, self.server_mac)
    }
}

/// Lists of preferred algorithms. This is normally hard-coded into implementations.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred host key algorithms.
    pub key: Cow<'static, [Algorithm]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
    /// Preferred compression algorithms.
    pub compression: Cow<'static, [compression::Name]>,
}

const SAFE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
    kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

const HMAC_ORDER: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

const COMPRESSION_ORDER: &[compression::Name] = &[
    compression::NONE,
    #[cfg(feature = "flate2")]
    compression::ZLIB,
    #[cfg(feature = "flate2")]
    compression::ZLIB_LEGACY,
];

#[cfg(feature = "flate2")]
const COMPRESSED_ORDER: &[compression::Name] = &[
    compression::ZLIB_LEGACY,
    compression::ZLIB,
    compression::NONE,
];

#[cfg(not(feature = "flate2"))]
const COMPRESSED_ORDER: &[compression::Name] = COMPRESSION_ORDER;

const KEY_ORDER: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    #[cfg(feature = "rsa")]
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    #[cfg(feature = "rsa")]
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    #[cfg(feature = "rsa")]
    Algorithm::Rsa { hash: None },
];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(SAFE_KEX_ORDER),
        key: Cow::Borrowed(KEY_ORDER),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSION_ORDER),
    };

    /// Like [`Preferred::DEFAULT`], asking for compression first.
    pub const COMPRESSED: Preferred = Preferred {
        kex: Cow::Borrowed(SAFE_KEX_ORDER),
        key: Cow::Borrowed(KEY_ORDER),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
        compression: Cow::Borrowed(COMPRESSED_ORDER),
    };

    /// Drop algorithms that this server is known to implement
    /// incorrectly.
    ///
    /// OpenSSH 6.5 and 6.6 (fixed in 6.6.1) compute the curve25519
    /// shared secret incorrectly in a fraction of the exchanges.
    pub(crate) fn adjusted_for_server(&self, server_id: &ServerId) -> Preferred {
        let version = server_id.software_version();
        let broken_curve25519 = version.starts_with("OpenSSH_6.5")
            || (version.starts_with("OpenSSH_6.6") && !version.starts_with("OpenSSH_6.6.1"));
        if !broken_curve25519 {
            return self.clone();
        }
        debug!("disabling curve25519 for {version:?}");
        let mut p = self.clone();
        p.kex = p
            .kex
            .iter()
            .filter(|k| **k != kex::CURVE25519 && **k != kex::CURVE25519_PRE_RFC_8731)
            .copied()
            .collect::<Vec<_>>()
            .into();
        p
    }
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// The name-lists of a KEXINIT we received.
struct PeerKexInit {
    kex: NameList,
    key: NameList,
    /// Client to server, then server to client, for the last three.
    cipher: [NameList; 2],
    mac: [NameList; 2],
    compression: [NameList; 2],
    first_kex_packet_follows: bool,
}

impl PeerKexInit {
    fn parse(buffer: &[u8]) -> Result<Self, Error> {
        if buffer.first() != Some(&msg::KEXINIT) {
            return Err(Error::KexInit);
        }
        // Message type and cookie.
        let mut r = buffer.get(17..).ok_or(Error::Inconsistent)?;
        let kex = NameList::decode(&mut r)?;
        let key = NameList::decode(&mut r)?;
        let cipher = [NameList::decode(&mut r)?, NameList::decode(&mut r)?];
        let mac = [NameList::decode(&mut r)?, NameList::decode(&mut r)?];
        let compression = [NameList::decode(&mut r)?, NameList::decode(&mut r)?];
        // Languages are never negotiated.
        NameList::decode(&mut r)?;
        NameList::decode(&mut r)?;
        let first_kex_packet_follows = u8::decode(&mut r)? != 0;
        Ok(PeerKexInit {
            kex,
            key,
            cipher,
            mac,
            compression,
            first_kex_packet_follows,
        })
    }
}

/// Which end of the connection reads the peer's KEXINIT. The client's
/// order of preference decides every category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    #[cfg_attr(not(test), allow(dead_code))]
    Server,
}

impl Side {
    /// Returns the chosen name, and whether it is both sides' first
    /// choice.
    fn select<S: AsRef<str> + Clone>(
        self,
        ours: &[S],
        theirs: &NameList,
        kind: AlgorithmKind,
    ) -> Result<(bool, S), Error> {
        let in_ours = |name: &str| ours.iter().position(|o| o.as_ref() == name);
        // (index in ours, index in theirs)
        let picked = match self {
            Side::Client => ours
                .iter()
                .enumerate()
                .find_map(|(i, o)| Some((i, theirs.position(o.as_ref())?))),
            Side::Server => theirs
                .0
                .iter()
                .enumerate()
                .find_map(|(j, t)| Some((in_ours(t.as_str())?, j))),
        };
        picked
            .and_then(|(i, j)| Some((i == 0 && j == 0, ours.get(i)?.clone())))
            .ok_or_else(|| Error::NoCommonAlgo {
                kind,
                ours: NameList::of(ours).0,
                theirs: theirs.0.clone(),
            })
    }

    fn strict_kex_markers(self) -> (kex::Name, kex::Name) {
        match self {
            Side::Client => (
                EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
                EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
            ),
            Side::Server => (
                EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
                EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
            ),
        }
    }

    /// Parse the peer's KEXINIT and pick one algorithm per category and
    /// direction. Strict kex is only looked at if `initial`.
    pub(crate) fn read_kex(
        self,
        buffer: &[u8],
        pref: &Preferred,
        initial: bool,
    ) -> Result<Names, Error> {
        let peer = PeerKexInit::parse(buffer)?;

        let our_kex = pref
            .kex
            .iter()
            .filter(|k| !kex::is_extension(k.as_ref()))
            .copied()
            .collect::<Vec<_>>();
        let (kex_guess_ok, kex) = self.select(&our_kex, &peer.kex, AlgorithmKind::Kex)?;

        let (our_marker, their_marker) = self.strict_kex_markers();
        let strict_kex = initial
            && pref.kex.contains(&our_marker)
            && peer.kex.contains(their_marker.as_ref());
        if strict_kex {
            debug!("strict kex enabled");
        }

        let our_keys = pref
            .key
            .iter()
            .map(|k| k.as_str().to_owned())
            .collect::<Vec<_>>();
        let (key_guess_ok, key) = self.select(&our_keys, &peer.key, AlgorithmKind::Key)?;
        let key = Algorithm::new(&key)?;

        // Each direction has its own cipher, and needs a MAC unless the
        // cipher authenticates by itself.
        let select_cipher_and_mac = |ciphers: &NameList, macs: &NameList| {
            let (_, cipher) = self.select(&pref.cipher, ciphers, AlgorithmKind::Cipher)?;
            let needs_mac = CIPHERS.get(&cipher).is_some_and(|c| c.needs_mac());
            let (_, mac) = if needs_mac {
                self.select(&pref.mac, macs, AlgorithmKind::Mac)?
            } else {
                (false, mac::NONE)
            };
            Ok::<_, Error>((cipher, mac))
        };
        let [cipher_c2s, cipher_s2c] = &peer.cipher;
        let [mac_c2s, mac_s2c] = &peer.mac;
        let (client_cipher, client_mac) = select_cipher_and_mac(cipher_c2s, mac_c2s)?;
        let (server_cipher, server_mac) = select_cipher_and_mac(cipher_s2c, mac_s2c)?;

        let select_compression = |list: &NameList| {
            self.select(&pref.compression, list, AlgorithmKind::Compression)
                .map(|(_, c)| compression::Compression::new(&c))
        };
        let [compression_c2s, compression_s2c] = &peer.compression;

        let names = Names {
            kex,
            key,
            client_cipher,
            server_cipher,
            client_mac,
            server_mac,
            client_compression: select_compression(compression_c2s)?,
            server_compression: select_compression(compression_s2c)?,
            // A guessed packet is only kept when both guesses were right.
            ignore_guessed: peer.first_kex_packet_follows && !(kex_guess_ok && key_guess_ok),
            strict_kex,
        };
        debug!("negotiated: {names:?}");
        Ok(names)
    }
}

/// Write a KEXINIT payload into `buf`.
pub(crate) fn write_kex(prefs: &Preferred, buf: &mut CryptoVec, is_server: bool) -> Result<(), Error> {
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend(&cookie);

    // Pseudo-algorithms of the other side are not ours to send.
    let theirs = if is_server {
        [
            kex::EXTENSION_SUPPORT_AS_CLIENT,
            kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
        ]
    } else {
        [
            kex::EXTENSION_SUPPORT_AS_SERVER,
            kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
        ]
    };
    let kexes = prefs
        .kex
        .iter()
        .filter(|k| !theirs.contains(*k))
        .copied()
        .collect::<Vec<_>>();
    NameList::of(&kexes).encode(buf)?;

    let keys = prefs.key.iter().map(|x| x.as_str()).collect::<Vec<_>>();
    NameList::of(&keys).encode(buf)?;

    NameList::of(&prefs.cipher).encode(buf)?; // client to server
    NameList::of(&prefs.cipher).encode(buf)?; // server to client
    NameList::of(&prefs.mac).encode(buf)?;
    NameList::of(&prefs.mac).encode(buf)?;
    NameList::of(&prefs.compression).encode(buf)?;
    NameList::of(&prefs.compression).encode(buf)?;

    NameList::default().encode(buf)?; // languages client to server
    NameList::default().encode(buf)?; // languages server to client

    buf.push(0); // doesn't follow
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn kexinit(prefs: &Preferred, is_server: bool) -> CryptoVec {
        let mut buf = CryptoVec::new();
        write_kex(prefs, &mut buf, is_server).unwrap();
        buf
    }

    fn server_prefs() -> Preferred {
        Preferred {
            kex: Cow::Owned(vec![
                kex::DH_G14_SHA256,
                kex::CURVE25519,
                kex::EXTENSION_SUPPORT_AS_SERVER,
                kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
            ]),
            key: Cow::Owned(vec![Algorithm::Ed25519]),
            cipher: Cow::Owned(vec![cipher::AES_128_CTR, cipher::CHACHA20_POLY1305]),
            mac: Cow::Owned(vec![mac::HMAC_SHA1, mac::HMAC_SHA256_ETM]),
            compression: Cow::Owned(vec![compression::NONE]),
        }
    }

    #[test]
    fn client_preferences_win() {
        let server = kexinit(&server_prefs(), true);
        let names = Side::Client.read_kex(&server, &Preferred::DEFAULT, true).unwrap();
        assert_eq!(names.kex, kex::CURVE25519);
        assert_eq!(names.key, Algorithm::Ed25519);
        assert_eq!(names.client_cipher, cipher::CHACHA20_POLY1305);
        assert_eq!(names.server_cipher, cipher::CHACHA20_POLY1305);
        // AEAD ciphers carry their own MAC.
        assert_eq!(names.client_mac, mac::NONE);
        assert_eq!(names.server_mac, mac::NONE);
        assert!(names.strict_kex());
        assert!(!names.ignore_guessed);

        // The server reaches the same result from the other end.
        let client = kexinit(&Preferred::DEFAULT, false);
        let names = Side::Server.read_kex(&client, &server_prefs(), true).unwrap();
        assert_eq!(names.kex, kex::CURVE25519);
        assert_eq!(names.client_cipher, cipher::CHACHA20_POLY1305);
        assert_eq!(names.server_cipher, cipher::CHACHA20_POLY1305);
        assert_eq!(names.server_mac, mac::NONE);
        assert!(names.strict_kex());

        // Client order for MACs too, once a cipher needs one.
        let client = Preferred {
            cipher: Cow::Owned(vec![cipher::AES_128_CTR]),
            ..Preferred::DEFAULT
        };
        let names = Side::Server
            .read_kex(&kexinit(&client, false), &server_prefs(), true)
            .unwrap();
        assert_eq!(names.client_cipher, cipher::AES_128_CTR);
        assert_eq!(names.client_mac, mac::HMAC_SHA256_ETM);
        assert_eq!(names.server_mac, mac::HMAC_SHA256_ETM);
    }

    /// A KEXINIT whose two cipher lists and two MAC lists differ.
    fn asymmetric_kexinit(cipher: [&[&str]; 2], mac: [&[&str]; 2]) -> Vec<u8> {
        let mut buf = vec![msg::KEXINIT];
        buf.extend_from_slice(&[0; 16]);
        NameList::of(&[kex::CURVE25519]).encode(&mut buf).unwrap();
        NameList::of(&["ssh-ed25519"]).encode(&mut buf).unwrap();
        for list in cipher.into_iter().chain(mac) {
            NameList::of(list).encode(&mut buf).unwrap();
        }
        NameList::of(&["none"]).encode(&mut buf).unwrap();
        NameList::of(&["none"]).encode(&mut buf).unwrap();
        NameList::default().encode(&mut buf).unwrap();
        NameList::default().encode(&mut buf).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 0, 0]);
        buf
    }

    #[test]
    fn each_direction_has_its_own_cipher() {
        let server = asymmetric_kexinit(
            [&["aes128-ctr"], &["aes256-ctr"]],
            [&["hmac-sha1"], &["hmac-sha2-512"]],
        );
        let names = Side::Client.read_kex(&server, &Preferred::DEFAULT, true).unwrap();
        assert_eq!(names.client_to_server(), (cipher::AES_128_CTR, mac::HMAC_SHA1));
        assert_eq!(names.server_to_client(), (cipher::AES_256_CTR, mac::HMAC_SHA512));

        // An AEAD cipher one way does not drop the MAC the other way.
        let server = asymmetric_kexinit(
            [&["chacha20-poly1305@openssh.com"], &["aes192-ctr"]],
            [&["hmac-sha1"], &["hmac-sha2-256"]],
        );
        let names = Side::Client.read_kex(&server, &Preferred::DEFAULT, true).unwrap();
        assert_eq!(names.client_to_server(), (cipher::CHACHA20_POLY1305, mac::NONE));
        assert_eq!(names.server_to_client(), (cipher::AES_192_CTR, mac::HMAC_SHA256));

        // Only the direction without overlap fails.
        let server = asymmetric_kexinit(
            [&["aes128-ctr"], &["3des-cbc"]],
            [&["hmac-sha1"], &["hmac-sha1"]],
        );
        match Side::Client.read_kex(&server, &Preferred::DEFAULT, true) {
            Err(Error::NoCommonAlgo { kind, theirs, .. }) => {
                assert!(matches!(kind, AlgorithmKind::Cipher));
                assert_eq!(theirs, ["3des-cbc"]);
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn strict_kex_needs_both_sides_and_the_first_exchange() {
        let mut prefs = server_prefs();
        prefs.kex = Cow::Owned(vec![kex::CURVE25519]);
        let server = kexinit(&prefs, true);
        assert!(!Side::Client.read_kex(&server, &Preferred::DEFAULT, true)
            .unwrap()
            .strict_kex());

        let server = kexinit(&server_prefs(), true);
        assert!(!Side::Client.read_kex(&server, &Preferred::DEFAULT, false)
            .unwrap()
            .strict_kex());
    }

    #[test]
    fn no_common_algorithm() {
        let mut prefs = server_prefs();
        prefs.cipher = Cow::Owned(vec![cipher::AES_192_CTR]);
        let server = kexinit(&prefs, true);
        let client = Preferred {
            cipher: Cow::Owned(vec![cipher::AES_256_CTR]),
            ..Preferred::DEFAULT
        };
        match Side::Client.read_kex(&server, &client, true) {
            Err(Error::NoCommonAlgo { kind, ours, theirs }) => {
                assert!(matches!(kind, AlgorithmKind::Cipher));
                assert_eq!(ours, vec!["aes256-ctr".to_string()]);
                assert_eq!(theirs, vec!["aes192-ctr".to_string()]);
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn pseudo_algorithms_are_never_selected() {
        let mut prefs = server_prefs();
        // A confused server listing our pseudo-algorithm as a real one.
        prefs.kex = Cow::Owned(vec![kex::EXTENSION_SUPPORT_AS_CLIENT, kex::CURVE25519]);
        let server = kexinit(&prefs, false);
        let client = Preferred {
            kex: Cow::Owned(vec![kex::EXTENSION_SUPPORT_AS_CLIENT, kex::CURVE25519]),
            ..Preferred::DEFAULT
        };
        let names = Side::Client.read_kex(&server, &client, true).unwrap();
        assert_eq!(names.kex, kex::CURVE25519);
    }

    #[test]
    fn client_kexinit_only_has_client_extensions() {
        let mut prefs = Preferred::DEFAULT;
        prefs.kex = Cow::Owned(vec![
            kex::CURVE25519,
            kex::EXTENSION_SUPPORT_AS_CLIENT,
            kex::EXTENSION_SUPPORT_AS_SERVER,
            kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER,
        ]);
        let buf = kexinit(&prefs, false);
        let mut r = &buf[17..];
        let kexes = String::decode(&mut r).unwrap();
        assert_eq!(kexes, "curve25519-sha256,ext-info-c");
        // first_kex_packet_follows and reserved
        assert_eq!(&buf[buf.len() - 5..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn guessed_packets() {
        let mut server = kexinit(&server_prefs(), true).to_vec();
        let follows = server.len() - 5;
        server[follows] = 1;
        // Server's first kex guess (group14) is not our first choice.
        let names = Side::Client.read_kex(&server, &Preferred::DEFAULT, true).unwrap();
        assert!(names.ignore_guessed);
    }

    #[test]
    fn broken_curve25519_servers() {
        for (version, filtered) in [
            ("SSH-2.0-OpenSSH_6.5", true),
            ("SSH-2.0-OpenSSH_6.5p1", true),
            ("SSH-2.0-OpenSSH_6.6", true),
            ("SSH-2.0-OpenSSH_6.6p1 Ubuntu-2", true),
            ("SSH-2.0-OpenSSH_6.6.1", false),
            ("SSH-2.0-OpenSSH_6.6.1p1", false),
            ("SSH-2.0-OpenSSH_6.7", false),
            ("SSH-2.0-OpenSSH_9.6", false),
            ("SSH-2.0-dropbear_2022.83", false),
        ] {
            let id = ServerId::parse(version).unwrap();
            let p = Preferred::DEFAULT.adjusted_for_server(&id);
            let has_curve = p.kex.contains(&kex::CURVE25519)
                || p.kex.contains(&kex::CURVE25519_PRE_RFC_8731);
            assert_eq!(has_curve, !filtered, "{version}");
            assert!(p.kex.contains(&kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT));
        }
    }
}
