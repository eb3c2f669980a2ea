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
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use log::{debug, error, warn};
use signature::Verifier;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Mpint, PublicKey, Signature};

use super::{Config, Handler, IncomingSshPacket, RunError};
use crate::cipher::SealingKey;
use crate::kex::dh::DhGroup;
use crate::kex::{KexAlgorithm, KEXES};
use crate::negotiation::{Names, Preferred, Side};
use crate::session::{Exchange, NewKeys};
use crate::sshbuffer::PacketWriter;
use crate::{msg, negotiation, CryptoVec, Error, SshId};

/// Why a key exchange is running.
#[derive(Debug, Clone)]
pub(crate) enum KexCause {
    Initial,
    Rekey {
        /// Strict kex was negotiated in the initial exchange.
        strict: bool,
        session_id: CryptoVec,
    },
}

impl KexCause {
    pub fn is_rekey(&self) -> bool {
        matches!(self, KexCause::Rekey { .. })
    }

    pub fn is_strict_rekey(&self) -> bool {
        matches!(self, KexCause::Rekey { strict: true, .. })
    }

    fn session_id(&self) -> Option<&CryptoVec> {
        match self {
            KexCause::Initial => None,
            KexCause::Rekey { session_id, .. } => Some(session_id),
        }
    }
}

pub(crate) enum KexProgress {
    NeedsReply {
        kex: ClientKex,
        /// Our NEWKEYS went out with this step: the sealing key is
        /// already switched.
        sent_newkeys: bool,
    },
    Done {
        newkeys: NewKeys,
    },
}

type Algo = Box<dyn KexAlgorithm + Send>;

#[allow(clippy::large_enum_variant)]
enum KexState {
    /// Our KEXINIT may be out, theirs has not arrived.
    Created,
    /// Group exchange request sent.
    GexRequested { names: Names, kex: Algo },
    /// Our ephemeral key sent.
    DhSent { names: Names, kex: Algo },
    /// Our NEWKEYS sent.
    NewKeysSent { newkeys: NewKeys },
}

impl KexState {
    fn names(&self) -> Option<&Names> {
        match self {
            KexState::Created => None,
            KexState::GexRequested { names, .. } | KexState::DhSent { names, .. } => Some(names),
            KexState::NewKeysSent { newkeys } => Some(&newkeys.names),
        }
    }
}

pub(crate) struct ClientKex {
    exchange: Exchange,
    cause: KexCause,
    state: KexState,
    config: Arc<Config>,
    preferred: Preferred,
}

impl Debug for ClientKex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            KexState::Created => "created",
            KexState::GexRequested { .. } => "waiting for KEX_DH_GEX_GROUP",
            KexState::DhSent { .. } => "waiting for the DH reply",
            KexState::NewKeysSent { .. } => "waiting for NEWKEYS",
        };
        f.debug_struct("ClientKex")
            .field("cause", &self.cause)
            .field("state", &state)
            .finish()
    }
}

/// Check the message type of a kex packet.
fn expect(input: &IncomingSshPacket<'_>, message_type: u8) -> Result<(), Error> {
    match input.buffer.first() {
        Some(t) if *t == message_type => Ok(()),
        t => {
            error!("expected kex message {message_type}, got {t:?}");
            Err(Error::Kex)
        }
    }
}

impl ClientKex {
    pub fn new(
        config: Arc<Config>,
        preferred: Preferred,
        client_sshid: &SshId,
        server_sshid: &[u8],
        cause: KexCause,
    ) -> Self {
        ClientKex {
            exchange: Exchange::new(client_sshid.as_kex_hash_bytes(), server_sshid),
            cause,
            state: KexState::Created,
            config,
            preferred,
        }
    }

    pub fn cause(&self) -> &KexCause {
        &self.cause
    }

    /// The server's KEXINIT has been received.
    pub fn has_peer_kexinit(&self) -> bool {
        !matches!(self.state, KexState::Created)
    }

    /// Our NEWKEYS has been sent.
    pub fn sent_newkeys(&self) -> bool {
        matches!(self.state, KexState::NewKeysSent { .. })
    }

    /// The initial exchange, with strict kex negotiated.
    pub fn is_initial_strict(&self) -> bool {
        !self.cause.is_rekey() && self.names().is_some_and(Names::strict_kex)
    }

    /// The negotiated algorithms, once known.
    pub fn names(&self) -> Option<&Names> {
        self.state.names()
    }

    /// Send our KEXINIT.
    pub fn kexinit(&mut self, output: &mut PacketWriter) -> Result<(), Error> {
        self.exchange.client_kex_init =
            output.packet(|w| negotiation::write_kex(&self.preferred, w, false))?;
        Ok(())
    }

    pub async fn step<H: Handler>(
        mut self,
        input: &IncomingSshPacket<'_>,
        output: &mut PacketWriter,
        handler: &mut H,
    ) -> Result<KexProgress, RunError<H::Error>> {
        let state = std::mem::replace(&mut self.state, KexState::Created);
        self.state = match state {
            KexState::Created => self.server_kexinit(input, output)?,
            KexState::GexRequested { names, kex } => self.gex_group(input, output, names, kex)?,
            KexState::DhSent { mut names, kex } if names.ignore_guessed => {
                // The server guessed wrong, and its guessed packet is
                // this one.
                debug!("ignoring guessed kex packet");
                names.ignore_guessed = false;
                KexState::DhSent { names, kex }
            }
            KexState::DhSent { names, mut kex } => {
                let reply = if kex.is_dh_gex() {
                    msg::KEX_DH_GEX_REPLY
                } else {
                    msg::KEX_ECDH_REPLY
                };
                expect(input, reply)?;
                let (hash, server_host_key) = self.dh_reply(input, &names, &mut kex)?;
                if !self.cause.is_rekey() {
                    let accepted = handler
                        .check_server_key(&server_host_key)
                        .await
                        .map_err(RunError::Handler)?;
                    if !accepted {
                        debug!("server key rejected by the handler");
                        return Err(Error::UnknownKey.into());
                    }
                }
                let (newkeys, sealing_key) = self.new_keys(hash, kex, names, server_host_key)?;
                output.packet(|w| Ok(msg::NEWKEYS.encode(w)?))?;
                output.set_cipher(sealing_key);
                if newkeys.names.strict_kex() || self.cause.is_strict_rekey() {
                    output.reset_seqn();
                }
                self.state = KexState::NewKeysSent { newkeys };
                return Ok(KexProgress::NeedsReply {
                    kex: self,
                    sent_newkeys: true,
                });
            }
            KexState::NewKeysSent { newkeys } => {
                expect(input, msg::NEWKEYS)?;
                return Ok(KexProgress::Done { newkeys });
            }
        };
        Ok(KexProgress::NeedsReply {
            kex: self,
            sent_newkeys: false,
        })
    }

    /// Negotiate, then send the first message of the chosen method.
    fn server_kexinit(
        &mut self,
        input: &IncomingSshPacket<'_>,
        output: &mut PacketWriter,
    ) -> Result<KexState, Error> {
        if input.buffer.first() != Some(&msg::KEXINIT) {
            return Err(Error::KexInit);
        }
        let initial = !self.cause.is_rekey();
        let names = Side::Client.read_kex(input.buffer, &self.preferred, initial)?;
        self.exchange.server_kex_init.extend(input.buffer);

        if initial && names.strict_kex() && input.seqn.0 != 0 {
            warn!(
                "strict kex: KEXINIT received with sequence number {}",
                input.seqn.0
            );
            return Err(Error::KexInitNotFirst);
        }

        let mut kex = KEXES.get(&names.kex).ok_or(Error::UnknownAlgo)?.make();
        if kex.is_dh_gex() {
            output.packet(|w| kex.client_dh_gex_init(&self.config.gex, w))?;
            return Ok(KexState::GexRequested { names, kex });
        }
        let exchange = &mut self.exchange;
        output.packet(|w| kex.client_dh(&mut exchange.client_ephemeral, w))?;
        Ok(KexState::DhSent { names, kex })
    }

    fn gex_group(
        &mut self,
        input: &IncomingSshPacket<'_>,
        output: &mut PacketWriter,
        names: Names,
        mut kex: Algo,
    ) -> Result<KexState, Error> {
        expect(input, msg::KEX_DH_GEX_GROUP)?;
        let mut r = input.buffer.get(1..).ok_or(Error::Inconsistent)?;
        let prime = Mpint::decode(&mut r)?;
        let generator = Mpint::decode(&mut r)?;
        debug!("received gex group: prime={prime}, generator={generator}");

        // Sizes are checked against our request by the algorithm.
        kex.dh_gex_set_group(DhGroup::new(
            prime.as_positive_bytes().ok_or(Error::Kex)?.to_vec(),
            generator.as_positive_bytes().ok_or(Error::Kex)?.to_vec(),
        ))?;

        let exchange = &mut self.exchange;
        output.packet(|w| kex.client_dh(&mut exchange.client_ephemeral, w))?;
        Ok(KexState::DhSent { names, kex })
    }

    /// Check the server's signature over the exchange hash. Returns the
    /// hash and the host key.
    fn dh_reply(
        &mut self,
        input: &IncomingSshPacket<'_>,
        names: &Names,
        kex: &mut Algo,
    ) -> Result<(CryptoVec, PublicKey), Error> {
        let r = &mut input.buffer.get(1..).ok_or(Error::Inconsistent)?;
        let host_key_blob = Vec::<u8>::decode(r)?;
        let server_host_key = PublicKey::from_bytes(&host_key_blob)?;
        debug!("server host key: {:?}", server_host_key.algorithm());
        let server_ephemeral = Vec::<u8>::decode(r)?;
        let signature = Vec::<u8>::decode(r)?;

        kex.compute_shared_secret(&server_ephemeral)?;
        self.exchange.server_ephemeral.clear();
        self.exchange.server_ephemeral.extend(&server_ephemeral);

        let mut encoded_key = CryptoVec::new();
        host_key_blob.encode(&mut encoded_key)?;
        let hash = kex.compute_exchange_hash(&encoded_key, &self.exchange, &mut CryptoVec::new())?;

        let signature = Signature::decode(&mut &signature[..])?;
        if signature.algorithm() != names.key {
            debug!(
                "signature algorithm {:?}, expected {:?}",
                signature.algorithm(),
                names.key
            );
            return Err(Error::WrongServerSig);
        }
        Verifier::verify(&server_host_key, &hash[..], &signature).map_err(|e| {
            debug!("wrong server signature: {e:?}");
            Error::WrongServerSig
        })?;
        Ok((hash, server_host_key))
    }

    /// Derive the keys of this exchange. The first exchange hash is the
    /// session id for good.
    fn new_keys(
        &self,
        hash: CryptoVec,
        kex: Algo,
        names: Names,
        server_host_key: PublicKey,
    ) -> Result<(NewKeys, Box<dyn SealingKey + Send>), Error> {
        let session_id = self.cause.session_id().unwrap_or(&hash).clone();
        let pair = kex.compute_keys(
            &session_id,
            &hash,
            names.client_to_server(),
            names.server_to_client(),
            false,
        )?;
        Ok((
            NewKeys {
                names,
                kex,
                opening_key: pair.remote_to_local,
                session_id,
                server_host_key,
            },
            pair.local_to_remote,
        ))
    }
}
