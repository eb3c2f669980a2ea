//! A scripted server for driving the client over an in-memory stream.
//! Tests decide every packet it sends, including the wrong ones.

use std::borrow::Cow;
use std::num::Wrapping;
use std::sync::Arc;

use async_trait::async_trait;
use signature::Signer;
use ssh_encoding::Encode;
use ssh_key::{PrivateKey, PublicKey, Signature};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::channels::{Channel, ChannelKind};
use crate::cipher::{self, clear, OpeningKey};
use crate::kex::{self, KexAlgorithm, KEXES};
use crate::negotiation::{self, Names, Preferred};
use crate::session::Exchange;
use crate::sshbuffer::{read_ssh_id, PacketWriter, SSHBuffer};
use crate::{client, msg, ChannelId, CryptoVec, Error};

pub(crate) const SERVER_ID: &str = "SSH-2.0-FakeServer_1.0";

pub(crate) fn preferred(strict: bool) -> Preferred {
    Preferred {
        kex: if strict {
            Cow::Borrowed(&[kex::CURVE25519, kex::EXTENSION_OPENSSH_STRICT_KEX_AS_SERVER])
        } else {
            Cow::Borrowed(&[kex::CURVE25519])
        },
        key: Cow::Borrowed(&[ssh_key::Algorithm::Ed25519]),
        ..Preferred::DEFAULT
    }
}

pub(crate) fn host_key() -> PrivateKey {
    PrivateKey::random(&mut rand_core::OsRng, ssh_key::Algorithm::Ed25519).unwrap()
}

/// Build a payload.
pub(crate) fn payload<F: FnOnce(&mut CryptoVec) -> Result<(), ssh_encoding::Error>>(
    f: F,
) -> CryptoVec {
    let mut w = CryptoVec::new();
    f(&mut w).unwrap();
    w
}

pub(crate) struct FakeServer {
    read: BufReader<ReadHalf<DuplexStream>>,
    write: WriteHalf<DuplexStream>,
    input: SSHBuffer,
    opening: Box<dyn OpeningKey + Send>,
    writer: PacketWriter,
    exchange: Exchange,
    session_id: Option<CryptoVec>,
    pub key: PrivateKey,
    pub preferred: Preferred,
    pub strict: bool,
    /// Forget to reset the outbound sequence number at NEWKEYS.
    pub skip_seqn_reset: bool,
}

impl FakeServer {
    /// Exchange identification lines.
    pub async fn accept(stream: DuplexStream, preferred: Preferred) -> Self {
        let (read, mut write) = tokio::io::split(stream);
        write
            .write_all(format!("{SERVER_ID}\r\n").as_bytes())
            .await
            .unwrap();
        let mut read = BufReader::new(read);
        let client_id = read_ssh_id(&mut read).await.unwrap();
        FakeServer {
            read,
            write,
            input: SSHBuffer::new(),
            opening: Box::new(clear::Key),
            writer: PacketWriter::clear(0),
            exchange: Exchange::new(client_id.as_bytes(), SERVER_ID.as_bytes()),
            session_id: None,
            key: host_key(),
            preferred,
            strict: false,
            skip_seqn_reset: false,
        }
    }

    pub async fn send(&mut self, payload: &[u8]) {
        self.writer.packet_raw(payload).unwrap();
        let buffer = &mut self.writer.buffer().buffer;
        self.write.write_all(buffer).await.unwrap();
        buffer.clear();
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        self.input.buffer.clear();
        cipher::read(&mut self.read, &mut self.input, &mut *self.opening).await?;
        Ok(self.input.buffer.get(5..).unwrap_or_default().to_vec())
    }

    /// The next packet that is not IGNORE.
    pub async fn recv_msg(&mut self) -> Vec<u8> {
        loop {
            let p = self.recv().await.unwrap();
            if p.first() != Some(&msg::IGNORE) {
                return p;
            }
        }
    }

    /// Sequence number of the last packet received.
    pub fn last_seqn(&self) -> u32 {
        (self.input.seqn - Wrapping(1)).0
    }

    pub async fn send_kexinit(&mut self) {
        let mut kexinit = CryptoVec::new();
        negotiation::write_kex(&self.preferred, &mut kexinit, true).unwrap();
        self.exchange.server_kex_init = kexinit.clone();
        self.send(&kexinit).await;
    }

    /// Our KEXINIT is out: read the client's and run the exchange.
    pub async fn kex(&mut self, initial: bool) -> Names {
        let client_kexinit = self.recv_msg().await;
        assert_eq!(client_kexinit[0], msg::KEXINIT);
        self.finish_kex(client_kexinit, initial).await
    }

    pub async fn finish_kex(&mut self, client_kexinit: Vec<u8>, initial: bool) -> Names {
        let names =
            negotiation::Side::Server.read_kex(&client_kexinit, &self.preferred, initial).unwrap();
        if initial {
            self.strict = names.strict_kex();
        }
        self.exchange.client_kex_init = CryptoVec::from(client_kexinit);
        let mut algo = KEXES.get(&names.kex).unwrap().make();

        let init = self.recv_msg().await;
        self.exchange.client_ephemeral =
            CryptoVec::from_slice(kex::kex_payload_string(&init, msg::KEX_ECDH_INIT).unwrap());
        algo.server_dh(&mut self.exchange, &init).unwrap();

        let key_blob = self.key.public_key().to_bytes().unwrap();
        let mut pubkey_vec = CryptoVec::new();
        key_blob.encode(&mut pubkey_vec).unwrap();
        let mut buffer = CryptoVec::new();
        let hash = algo
            .compute_exchange_hash(&pubkey_vec, &self.exchange, &mut buffer)
            .unwrap();
        let signature: Signature = Signer::try_sign(&self.key, &hash[..]).unwrap();
        let mut sig = Vec::new();
        signature.encode(&mut sig).unwrap();

        let reply = payload(|w| {
            msg::KEX_ECDH_REPLY.encode(w)?;
            key_blob.encode(w)?;
            self.exchange.server_ephemeral[..].encode(w)?;
            sig.encode(w)
        });
        self.send(&reply).await;

        let session_id = self.session_id.get_or_insert_with(|| hash.clone()).clone();
        let pair = algo
            .compute_keys(
                &session_id,
                &hash,
                names.client_to_server(),
                names.server_to_client(),
                true,
            )
            .unwrap();

        self.send(&[msg::NEWKEYS]).await;
        self.writer.set_cipher(pair.local_to_remote);
        if self.strict && !self.skip_seqn_reset {
            self.writer.reset_seqn();
        }

        let newkeys = self.recv_msg().await;
        assert_eq!(newkeys, [msg::NEWKEYS]);
        self.opening = pair.remote_to_local;
        if self.strict {
            self.input.seqn = Wrapping(0);
        }
        names
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    KexDone { rekey: bool, strict: bool },
    ServiceMessage(Vec<u8>),
    ExtInfo(Vec<String>),
    UnknownChannel(ChannelId, u8),
    ServerChannel(Channel<client::Msg>, ChannelKind),
}

pub(crate) struct TestClient {
    pub events: UnboundedSender<Event>,
    pub accept_channels: bool,
}

#[async_trait]
impl client::Handler for TestClient {
    type Error = Error;

    async fn check_server_key(&mut self, _: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn kex_done(&mut self, names: &Names, rekey: bool) -> Result<(), Self::Error> {
        let _ = self.events.send(Event::KexDone {
            rekey,
            strict: names.strict_kex(),
        });
        Ok(())
    }

    async fn service_message(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        let _ = self.events.send(Event::ServiceMessage(payload.to_vec()));
        Ok(())
    }

    async fn ext_info(&mut self, extensions: &[(String, Vec<u8>)]) -> Result<(), Self::Error> {
        let names = extensions.iter().map(|(name, _)| name.clone()).collect();
        let _ = self.events.send(Event::ExtInfo(names));
        Ok(())
    }

    async fn server_channel_open(
        &mut self,
        channel: Channel<client::Msg>,
        kind: &ChannelKind,
    ) -> Result<bool, Self::Error> {
        if !self.accept_channels {
            return Ok(false);
        }
        let _ = self.events.send(Event::ServerChannel(channel, kind.clone()));
        Ok(true)
    }

    async fn unknown_channel(&mut self, id: ChannelId, message_type: u8) -> Result<(), Self::Error> {
        let _ = self.events.send(Event::UnknownChannel(id, message_type));
        Ok(())
    }
}

pub(crate) struct Pair {
    pub handle: client::Handle<TestClient>,
    pub server: FakeServer,
    pub events: UnboundedReceiver<Event>,
}

/// Start a client, without running key exchange.
pub(crate) async fn start(
    config: client::Config,
    preferred: Preferred,
    accept_channels: bool,
) -> (
    tokio::task::JoinHandle<Result<client::Handle<TestClient>, Error>>,
    FakeServer,
    UnboundedReceiver<Event>,
) {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 20);
    let (events, receiver) = unbounded_channel();
    let handler = TestClient {
        events,
        accept_channels,
    };
    let client = tokio::spawn(client::connect_stream(
        Arc::new(config),
        client_stream,
        handler,
    ));
    let server = FakeServer::accept(server_stream, preferred).await;
    (client, server, receiver)
}

/// A client and a server past the first key exchange.
pub(crate) async fn connected_with(
    config: client::Config,
    strict: bool,
    accept_channels: bool,
) -> Pair {
    let (client, mut server, mut events) = start(config, preferred(strict), accept_channels).await;
    server.send_kexinit().await;
    server.kex(true).await;
    let handle = client.await.unwrap().unwrap();
    match events.recv().await {
        Some(Event::KexDone { rekey: false, .. }) => {}
        e => panic!("unexpected event {e:?}"),
    }
    Pair {
        handle,
        server,
        events,
    }
}

pub(crate) async fn connected(strict: bool) -> Pair {
    connected_with(client::Config::default(), strict, false).await
}
