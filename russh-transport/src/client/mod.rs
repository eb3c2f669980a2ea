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

//! # Implementing clients
//!
//! Maybe surprisingly, the data types used by this crate to
//! implement a client are relatively more complicated than for
//! servers. This is mostly related to the fact that clients are
//! generally used both in a synchronous way (in the case of SSH, we
//! can think of sending a shell command), and asynchronously (because
//! the server may send unsolicited messages), and hence need to
//! handle multiple interfaces.
//!
//! The [`Handler`] receives the unsolicited part. Everything the
//! application initiates goes through the [`Handle`] returned by
//! [`connect`], and through the [`Channel`]s it opens.
//!
//! ```no_run
//! use std::sync::Arc;
//! use russh_transport::client;
//!
//! struct Client;
//!
//! #[async_trait::async_trait]
//! impl client::Handler for Client {
//!     type Error = russh_transport::Error;
//!
//!     async fn check_server_key(
//!         &mut self,
//!         _server_public_key: &ssh_key::PublicKey,
//!     ) -> Result<bool, Self::Error> {
//!         Ok(true)
//!     }
//! }
//!
//! # async fn run() -> Result<(), russh_transport::Error> {
//! let config = Arc::new(client::Config::default());
//! let session = client::connect(config, ("localhost", 22), Client).await?;
//! // Authentication is up to the caller: SERVICE_REQUEST, then the
//! // user authentication messages, through `send_message`.
//! session.request_service("ssh-userauth").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::num::Wrapping;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use ssh_encoding::Encode;
use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::pin;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, ChannelKind, ChannelMsg, ChannelRef, WindowSizeRef};
use crate::cipher::{self, clear, OpeningKey};
use crate::compression::Decompress;
use crate::kex::GexParams;
use crate::negotiation::{Names, Preferred};
use crate::parsing::{parse_disconnect, write_disconnect};
use crate::session::{Encrypted, GlobalRequestResponse, NewKeys};
use crate::sshbuffer::{read_ssh_id, PacketWriter, SSHBuffer};
use crate::{
    msg, ChannelId, CryptoVec, Disconnect, Error, Limits, RemoteDisconnectInfo, ServerId, SshId,
};

mod encrypted;
mod kex;

use kex::{ClientKex, KexCause, KexProgress};

/// The configuration of clients.
#[derive(Debug)]
pub struct Config {
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: SshId,
    /// The bytes and time limits before key re-exchange.
    pub limits: Limits,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Buffer size for each channel (a number of unprocessed messages to store before propagating backpressure to the TCP stream)
    pub channel_buffer_size: usize,
    /// Lists of preferred algorithms.
    pub preferred: Preferred,
    /// Time allowed for the connection and the first key exchange.
    pub connection_timeout: Option<Duration>,
    /// Interval of silence from the server after which a
    /// `keepalive@openssh.com` request is sent.
    pub keepalive_interval: Option<Duration>,
    /// Number of unanswered keepalive requests before the session is
    /// dropped.
    pub keepalive_max: usize,
    /// Group sizes requested in diffie-hellman-group-exchange.
    pub gex: GexParams,
    /// Random padding added to every packet, in blocks, to hide the
    /// length of what is typed.
    pub extra_padding: u8,
}

/// Largest maximum packet size we announce for a channel.
const MAXIMUM_PACKET_SIZE: u32 = 256 * 1024;

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            limits: Limits::default(),
            window_size: 2097152,
            maximum_packet_size: 32768,
            channel_buffer_size: 100,
            preferred: Default::default(),
            connection_timeout: None,
            keepalive_interval: None,
            keepalive_max: 3,
            gex: GexParams::default(),
            extra_padding: 0,
        }
    }
}

impl Config {
    fn check(&self) -> Result<(), Error> {
        self.gex.validate()?;
        if self.maximum_packet_size == 0 || self.maximum_packet_size > MAXIMUM_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "maximum_packet_size must be in 1..={MAXIMUM_PACKET_SIZE}"
            )));
        }
        if self.preferred.kex.is_empty()
            || self.preferred.key.is_empty()
            || self.preferred.cipher.is_empty()
        {
            return Err(Error::InvalidConfig("empty algorithm list".into()));
        }
        Ok(())
    }
}

/// Why the session ended, as reported to [`Handler::disconnected`].
#[derive(Debug)]
pub enum DisconnectReason<E: From<crate::Error> + Send> {
    /// The server sent a DISCONNECT message.
    ReceivedDisconnect(RemoteDisconnectInfo),
    /// The session failed.
    Error(E),
}

/// A client handler. Note that messages can be received from the
/// server at any time during a session.
///
/// Note: this is an `async_trait`. Click `[source]` on the right to see actual async function definitions.
#[async_trait]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + Debug;

    /// Called with the server's identification line, before key
    /// exchange starts.
    #[allow(unused_variables)]
    async fn server_identification(&mut self, id: &ServerId) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called to check the server's public key. This is a very important
    /// step to help prevent man-in-the-middle attacks. The default
    /// implementation rejects all keys.
    #[allow(unused_variables)]
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Called after each completed key exchange.
    #[allow(unused_variables)]
    async fn kex_done(&mut self, names: &Names, rekey: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called with each message of the service layer: SERVICE_ACCEPT
    /// and the user authentication messages (50 to 79). `payload`
    /// starts with the message type.
    #[allow(unused_variables)]
    async fn service_message(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends EXT_INFO
    /// ([RFC8308](https://tools.ietf.org/html/rfc8308)).
    #[allow(unused_variables)]
    async fn ext_info(&mut self, extensions: &[(String, Vec<u8>)]) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens a channel: forwarded TCP/IP
    /// connections, X11 or agent forwarding. Return `true` to accept
    /// it, in which case the handler takes ownership of `channel`. The
    /// default implementation refuses everything.
    #[allow(unused_variables)]
    async fn server_channel_open(
        &mut self,
        channel: Channel<Msg>,
        kind: &ChannelKind,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Called when the server sends a channel message for a channel
    /// we do not know.
    #[allow(unused_variables)]
    async fn unknown_channel(&mut self, id: ChannelId, message_type: u8) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the session ends, either because the server sent
    /// DISCONNECT or because of an error. The default implementation
    /// returns the error, if any.
    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        debug!("disconnected: {reason:?}");
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(e) => Err(e),
        }
    }
}

/// Commands sent to the session task by [`Handle`] and by channels.
#[derive(Debug)]
pub struct Msg(Command);

#[derive(Debug)]
enum Command {
    ChannelOpen {
        kind: ChannelKind,
        sender: UnboundedSender<ChannelMsg>,
        window_size: WindowSizeRef,
        /// Our window and maximum packet size for this channel.
        initial_window_size: u32,
        maximum_packet_size: u32,
    },
    Channel(ChannelId, ChannelMsg),
    Payload(CryptoVec),
    TcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Option<u32>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<bool>,
    },
    Rekey,
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg(Command::Channel(id, msg))
    }
}

/// Where the session is, as observed through [`Handle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingIdentification,
    ExchangingIdentification,
    /// Our KEXINIT is out, the server's is not in yet.
    AwaitingKexInit,
    PerformingKeyExchange,
    /// Our NEWKEYS is out.
    AwaitingNewKeys,
    Running,
    Disconnecting,
    Closed,
}

/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    state: watch::Receiver<State>,
    join: JoinHandle<Result<(), H::Error>>,
    /// Channel defaults from the [`Config`].
    window_size: u32,
    maximum_packet_size: u32,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// The current state of the session.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    async fn send(&self, command: Command) -> Result<(), Error> {
        self.sender
            .send(Msg(command))
            .await
            .map_err(|_| Error::SendError)
    }

    /// Open a channel with the window and packet size of the
    /// [`Config`], and wait for the server to answer.
    ///
    /// Dropping the returned future before the answer closes the
    /// channel as soon as the server confirms it.
    pub async fn channel_open(&self, kind: ChannelKind) -> Result<Channel<Msg>, Error> {
        self.channel_open_with(kind, self.window_size, self.maximum_packet_size)
            .await
    }

    /// Like [`Handle::channel_open`], announcing `initial_window_size`
    /// and `maximum_packet_size` for the data the server sends us.
    pub async fn channel_open_with(
        &self,
        kind: ChannelKind,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<Channel<Msg>, Error> {
        if maximum_packet_size == 0 || maximum_packet_size > MAXIMUM_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "maximum_packet_size must be in 1..={MAXIMUM_PACKET_SIZE}"
            )));
        }
        let (sender, mut receiver) = unbounded_channel();
        let window_size = WindowSizeRef::new(0);
        self.send(Command::ChannelOpen {
            kind,
            sender,
            window_size: window_size.clone(),
            initial_window_size,
            maximum_packet_size,
        })
        .await?;
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open {
                    id,
                    max_packet_size,
                    ..
                }) => {
                    return Ok(Channel {
                        id,
                        sender: self.sender.clone(),
                        receiver,
                        max_packet_size,
                        window_size,
                    });
                }
                Some(ChannelMsg::OpenFailure {
                    reason,
                    description,
                }) => {
                    return Err(Error::ChannelOpenFailure {
                        reason,
                        description,
                    });
                }
                None => {
                    return Err(Error::Disconnect);
                }
                Some(msg) => {
                    debug!("msg = {msg:?}");
                }
            }
        }
    }

    /// Open a session channel.
    pub async fn channel_open_session(&self) -> Result<Channel<Msg>, Error> {
        self.channel_open(ChannelKind::Session).await
    }

    /// Open a TCP/IP forwarding channel. This is usually done when a
    /// connection comes to a locally forwarded TCP/IP port. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7). The
    /// TCP/IP packets can then be tunneled through the channel using
    /// `.data()`.
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel<Msg>, Error> {
        self.channel_open(ChannelKind::DirectTcpip {
            host_to_connect: host_to_connect.into(),
            port_to_connect,
            originator_address: originator_address.into(),
            originator_port,
        })
        .await
    }

    /// Open a channel to a Unix socket on the server
    /// (`direct-streamlocal@openssh.com`).
    pub async fn channel_open_direct_streamlocal<S: Into<String>>(
        &self,
        socket_path: S,
    ) -> Result<Channel<Msg>, Error> {
        self.channel_open(ChannelKind::DirectStreamLocal {
            socket_path: socket_path.into(),
        })
        .await
    }

    /// Send SERVICE_REQUEST. The answer reaches
    /// [`Handler::service_message`].
    pub async fn request_service<S: Into<String>>(&self, name: S) -> Result<(), Error> {
        let mut payload = CryptoVec::new();
        msg::SERVICE_REQUEST.encode(&mut payload)?;
        name.into().encode(&mut payload)?;
        self.send(Command::Payload(payload)).await
    }

    /// Send a raw message, e.g. for user authentication. Transport
    /// messages other than IGNORE, DEBUG and SERVICE_REQUEST, and
    /// connection layer messages, are refused: the session sends
    /// those itself.
    pub async fn send_message<P: Into<CryptoVec>>(&self, payload: P) -> Result<(), Error> {
        let payload = payload.into();
        let Some(&message_type) = payload.first() else {
            return Err(Error::Inconsistent);
        };
        if message_type == msg::DISCONNECT
            || msg::is_kex_msg(message_type)
            || msg::is_connection_msg(message_type)
        {
            return Err(Error::ForbiddenMessage(message_type));
        }
        self.send(Command::Payload(payload)).await
    }

    /// Ask the session to start a key re-exchange after the packets
    /// already queued.
    pub async fn rekey_soon(&self) -> Result<(), Error> {
        self.send(Command::Rekey).await
    }

    /// Ask the server to listen on `address:port` and forward the
    /// connections it gets through `forwarded-tcpip` channels. Returns
    /// the port, which the server picks if `port` is 0.
    pub async fn tcpip_forward<A: Into<String>>(&self, address: A, port: u32) -> Result<u32, Error> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::TcpIpForward {
            address: address.into(),
            port,
            reply,
        })
        .await?;
        match answer.await {
            Ok(Some(0)) => Ok(port),
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(Error::RequestDenied),
            Err(e) => {
                error!("Unable to receive TcpIpForward result: {e:?}");
                Err(Error::Disconnect)
            }
        }
    }

    pub async fn cancel_tcpip_forward<A: Into<String>>(
        &self,
        address: A,
        port: u32,
    ) -> Result<(), Error> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::CancelTcpIpForward {
            address: address.into(),
            port,
            reply,
        })
        .await?;
        match answer.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(e) => {
                error!("Unable to receive CancelTcpIpForward result: {e:?}");
                Err(Error::Disconnect)
            }
        }
    }

    /// Send DISCONNECT and end the session. Never fails: a session
    /// that is already gone is disconnected.
    pub async fn disconnect(&self, reason: Disconnect, description: &str, language_tag: &str) {
        let _ = self
            .send(Command::Disconnect {
                reason,
                description: description.into(),
                language_tag: language_tag.into(),
            })
            .await;
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Connect to a server at the address specified, using the [`Handler`]
/// (implemented by you) and [`Config`] specified. Returns a future that
/// resolves to a [`Handle`] once the first key exchange is done. This
/// handle can then be used to authenticate and open channels.
pub async fn connect<H: Handler + Send + 'static, A: ToSocketAddrs>(
    config: Arc<Config>,
    addrs: A,
    handler: H,
) -> Result<Handle<H>, H::Error> {
    let socket = match config.connection_timeout {
        Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(addrs))
            .await
            .map_err(|_| crate::Error::ConnectionTimeout)?
            .map_err(crate::Error::from)?,
        None => TcpStream::connect(addrs).await.map_err(crate::Error::from)?,
    };
    if let Err(e) = socket.set_nodelay(true) {
        debug!("set_nodelay: {e:?}");
    }
    connect_stream(config, socket, handler).await
}

/// Connect a client on an existing stream.
pub async fn connect_stream<H, R>(
    config: Arc<Config>,
    stream: R,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    connect_stream_with_cancellation(config, stream, handler, CancellationToken::new()).await
}

/// Connect a client on an existing stream, giving up when `cancel`
/// fires, or after [`Config::connection_timeout`], whichever comes
/// first. The session is torn down in both cases.
pub async fn connect_stream_with_cancellation<H, R>(
    config: Arc<Config>,
    stream: R,
    handler: H,
    cancel: CancellationToken,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(crate::Error::Cancelled.into());
    }
    config.check()?;

    let (handle_sender, session_receiver) = channel(config.channel_buffer_size.max(1));
    let (state_sender, state_receiver) = watch::channel(State::AwaitingIdentification);
    let (kex_done_sender, kex_done_receiver) = oneshot::channel();

    let session = Session::new(config.clone(), session_receiver, state_sender, kex_done_sender);
    let join = tokio::spawn(session.run(stream, handler));
    let mut handle = Handle {
        sender: handle_sender,
        state: state_receiver,
        join,
        window_size: config.window_size,
        maximum_packet_size: config.maximum_packet_size,
    };

    let first_kex = async {
        match config.connection_timeout {
            Some(timeout) => tokio::time::timeout(timeout, kex_done_receiver)
                .await
                .map_err(|_| ()),
            None => Ok(kex_done_receiver.await),
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("connection attempt cancelled");
            handle.join.abort();
            Err(crate::Error::Cancelled.into())
        }
        done = first_kex => match done {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(_)) => {
                // The session ended before the first key exchange.
                match (&mut handle.join).await {
                    Ok(Ok(())) => Err(crate::Error::Disconnect.into()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(crate::Error::from(e).into()),
                }
            }
            Err(()) => {
                debug!("connection timeout");
                handle.join.abort();
                Err(crate::Error::ConnectionTimeout.into())
            }
        }
    }
}

/// An incoming packet: the payload, decrypted and decompressed, and
/// its sequence number.
pub(crate) struct IncomingSshPacket<'a> {
    pub buffer: &'a [u8],
    pub seqn: Wrapping<u32>,
}

/// Errors of the session task: those of the transport, and those
/// returned by the handler, which go back to the caller untouched.
#[derive(Debug)]
pub(crate) enum RunError<E> {
    Transport(crate::Error),
    Handler(E),
}

impl<E> From<crate::Error> for RunError<E> {
    fn from(e: crate::Error) -> Self {
        RunError::Transport(e)
    }
}

impl<E> From<ssh_encoding::Error> for RunError<E> {
    fn from(e: ssh_encoding::Error) -> Self {
        RunError::Transport(e.into())
    }
}

impl<E> From<ssh_key::Error> for RunError<E> {
    fn from(e: ssh_key::Error) -> Self {
        RunError::Transport(e.into())
    }
}

impl<E> From<std::io::Error> for RunError<E> {
    fn from(e: std::io::Error) -> Self {
        RunError::Transport(e.into())
    }
}

/// What processing a packet changed in the reading half.
enum Processed {
    Continue,
    /// The server's NEWKEYS: install its key.
    NewKeys {
        opening_key: Box<dyn OpeningKey + Send>,
        reset_seqn: bool,
    },
}

/// The session task. It owns the stream, and is the only one to write
/// to it.
pub(crate) struct Session {
    config: Arc<Config>,
    /// `config.preferred`, minus what the server is known to get wrong.
    preferred: Preferred,
    server_id: Option<ServerId>,
    writer: PacketWriter,
    kex: Option<ClientKex>,
    encrypted: Option<Encrypted>,
    strict_kex: bool,
    receiver: Receiver<Msg>,
    inbound_channel_sender: Sender<Msg>,
    inbound_channel_receiver: Receiver<Msg>,
    channels: HashMap<ChannelId, ChannelRef>,
    open_global_requests: VecDeque<GlobalRequestResponse>,
    state: watch::Sender<State>,
    phase: State,
    disconnecting: bool,
    kex_done: Option<oneshot::Sender<()>>,
    keepalive_reference: Instant,
    keepalive_sent: usize,
}

async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: Box<dyn OpeningKey + Send>,
) -> Result<(R, SSHBuffer, Box<dyn OpeningKey + Send>), Error> {
    buffer.buffer.clear();
    match cipher::read(&mut stream_read, &mut buffer, &mut *cipher).await {
        Ok(_) => Ok((stream_read, buffer, cipher)),
        Err(Error::IO(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::HUP),
        Err(e) => Err(e),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    fn new(
        config: Arc<Config>,
        receiver: Receiver<Msg>,
        state: watch::Sender<State>,
        kex_done: oneshot::Sender<()>,
    ) -> Self {
        let (inbound_channel_sender, inbound_channel_receiver) =
            channel(config.channel_buffer_size.max(1));
        Session {
            writer: PacketWriter::clear(config.extra_padding),
            preferred: config.preferred.clone(),
            config,
            server_id: None,
            kex: None,
            encrypted: None,
            strict_kex: false,
            receiver,
            inbound_channel_sender,
            inbound_channel_receiver,
            channels: HashMap::new(),
            open_global_requests: VecDeque::new(),
            state,
            phase: State::AwaitingIdentification,
            disconnecting: false,
            kex_done: Some(kex_done),
            keepalive_reference: Instant::now(),
            keepalive_sent: 0,
        }
    }

    async fn run<H: Handler, R: AsyncRead + AsyncWrite + Unpin + Send>(
        mut self,
        stream: R,
        mut handler: H,
    ) -> Result<(), H::Error> {
        let (stream_read, mut stream_write) = tokio::io::split(stream);
        let result = self
            .run_inner(BufReader::new(stream_read), &mut stream_write, &mut handler)
            .await;

        self.set_phase(State::Disconnecting);
        for (_, channel) in self.channels.drain() {
            channel.window_size().close().await;
        }
        // Pending global requests fail when their senders are dropped.
        self.open_global_requests.clear();

        let result = match result {
            Ok(()) => Ok(()),
            Err(RunError::Handler(e)) => {
                self.send_disconnect(&mut stream_write, Disconnect::ByApplication, "")
                    .await;
                Err(e)
            }
            Err(RunError::Transport(Error::RemoteDisconnect(info))) => {
                info!("disconnected by the server: {info}");
                let first_kex_done = self.encrypted.is_some();
                let r = handler
                    .disconnected(DisconnectReason::ReceivedDisconnect(info.clone()))
                    .await;
                if first_kex_done {
                    r
                } else {
                    Err(Error::RemoteDisconnect(info).into())
                }
            }
            Err(RunError::Transport(e)) => {
                debug!("session error: {e:?}");
                if let Some(reason) = e.disconnect_reason() {
                    self.send_disconnect(&mut stream_write, reason, &e.to_string())
                        .await;
                }
                handler.disconnected(DisconnectReason::Error(e.into())).await
            }
        };
        if let Err(e) = stream_write.shutdown().await {
            trace!("shutdown: {e:?}");
        }
        self.set_phase(State::Closed);
        result
    }

    async fn run_inner<H: Handler, R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send>(
        &mut self,
        mut stream_read: BufReader<R>,
        stream_write: &mut W,
        handler: &mut H,
    ) -> Result<(), RunError<H::Error>> {
        self.set_phase(State::ExchangingIdentification);
        let mut id = CryptoVec::new();
        self.config.client_id.write(&mut id);
        stream_write.write_all(&id).await?;
        stream_write.flush().await?;

        let server_id = read_ssh_id(&mut stream_read).await?;
        debug!("server id: {:?}", server_id.as_str());
        handler
            .server_identification(&server_id)
            .await
            .map_err(RunError::Handler)?;
        self.start_kex(server_id)?;
        self.flush(stream_write).await?;

        let buffer = SSHBuffer::new();
        let opening_key: Box<dyn OpeningKey + Send> = Box::new(clear::Key);
        let reading = start_reading(stream_read, buffer, opening_key);
        pin!(reading);
        let mut decompressed = CryptoVec::new();

        while !self.disconnecting {
            let accepts_commands = self.kex.is_none() && self.encrypted.is_some();
            let keepalive = self.keepalive_deadline();
            let rekey = self.rekey_deadline();
            tokio::select! {
                r = &mut reading => {
                    let (stream_read, mut buffer, mut opening_key) = r?;
                    let seqn = buffer.seqn - Wrapping(1);
                    let raw = buffer.buffer.get(5..).ok_or(Error::IndexOutOfBounds)?;
                    let payload = match self.encrypted.as_mut() {
                        Some(enc) if enc.decompress.is_active() => {
                            decompressed.clear();
                            enc.decompress.decompress(raw, &mut decompressed)?
                        }
                        _ => raw,
                    };
                    self.keepalive_reference = Instant::now();
                    self.keepalive_sent = 0;

                    let packet = IncomingSshPacket { buffer: payload, seqn };
                    if let Processed::NewKeys { opening_key: key, reset_seqn } =
                        self.process(handler, &packet).await?
                    {
                        opening_key = key;
                        if reset_seqn {
                            buffer.seqn = Wrapping(0);
                        }
                        buffer.bytes = 0;
                    }
                    if buffer.bytes >= self.config.limits.rekey_read_limit {
                        if let Some(enc) = self.encrypted.as_mut() {
                            enc.rekey_wanted = true;
                        }
                    }
                    self.publish_state();
                    reading.set(start_reading(stream_read, buffer, opening_key));
                }
                msg = self.receiver.recv(), if accepts_commands => {
                    match msg {
                        Some(Msg(command)) => self.command(command).await?,
                        None => {
                            debug!("all handles dropped, disconnecting");
                            self.command(Command::Disconnect {
                                reason: Disconnect::ByApplication,
                                description: String::new(),
                                language_tag: String::new(),
                            }).await?;
                        }
                    }
                }
                Some(Msg(command)) = self.inbound_channel_receiver.recv(), if accepts_commands => {
                    self.command(command).await?
                }
                () = sleep_until(keepalive) => {
                    self.keepalive()?;
                }
                () = sleep_until(rekey) => {
                    debug!("rekey time limit reached");
                    if let Some(enc) = self.encrypted.as_mut() {
                        enc.rekey_wanted = true;
                    }
                }
            }
            self.flush(stream_write).await?;
        }
        self.set_phase(State::Disconnecting);
        Ok(())
    }

    /// Encrypt what is queued, write it out, and start a key
    /// re-exchange if one is due.
    async fn flush<W: AsyncWrite + Unpin>(&mut self, stream_write: &mut W) -> Result<(), Error> {
        // Between our KEXINIT and our NEWKEYS, only key exchange
        // messages may go out.
        let kex_allows = self.kex.as_ref().map_or(true, |kex| kex.sent_newkeys());
        if let (true, Some(enc)) = (kex_allows, self.encrypted.as_mut()) {
            if enc.flush(&self.config.limits, &mut self.writer)?
                && self.kex.is_none()
                && !self.disconnecting
            {
                self.begin_rekey()?;
            }
        }
        let buffer = &mut self.writer.buffer().buffer;
        if !buffer.is_empty() {
            stream_write.write_all(buffer).await?;
            stream_write.flush().await?;
            buffer.clear();
        }
        Ok(())
    }

    /// Queue our first KEXINIT.
    fn start_kex(&mut self, server_id: ServerId) -> Result<(), Error> {
        self.preferred = self.config.preferred.adjusted_for_server(&server_id);
        let mut kex = ClientKex::new(
            self.config.clone(),
            self.preferred.clone(),
            &self.config.client_id,
            server_id.as_bytes(),
            KexCause::Initial,
        );
        self.server_id = Some(server_id);
        kex.kexinit(&mut self.writer)?;
        self.kex = Some(kex);
        self.publish_state();
        Ok(())
    }

    fn begin_rekey(&mut self) -> Result<(), Error> {
        // What is queued goes out under the current keys.
        if let Some(enc) = self.encrypted.as_mut() {
            enc.flush(&self.config.limits, &mut self.writer)?;
        }
        let (Some(enc), Some(server_id)) = (self.encrypted.as_ref(), self.server_id.as_ref())
        else {
            return Err(Error::Inconsistent);
        };
        debug!("starting key re-exchange");
        let mut kex = ClientKex::new(
            self.config.clone(),
            self.preferred.clone(),
            &self.config.client_id,
            server_id.as_bytes(),
            KexCause::Rekey {
                strict: self.strict_kex,
                session_id: enc.session_id.clone(),
            },
        );
        kex.kexinit(&mut self.writer)?;
        self.kex = Some(kex);
        self.publish_state();
        Ok(())
    }

    /// Best effort: the session is going away anyway.
    async fn send_disconnect<W: AsyncWrite + Unpin>(
        &mut self,
        stream_write: &mut W,
        reason: Disconnect,
        description: &str,
    ) {
        if self.server_id.is_none() {
            return;
        }
        if let Err(e) = self
            .writer
            .packet(|w| write_disconnect(w, reason, description, ""))
        {
            debug!("could not frame DISCONNECT: {e:?}");
            return;
        }
        let buffer = &mut self.writer.buffer().buffer;
        let _ = stream_write.write_all(buffer).await;
        let _ = stream_write.flush().await;
        buffer.clear();
    }

    async fn process<H: Handler>(
        &mut self,
        handler: &mut H,
        packet: &IncomingSshPacket<'_>,
    ) -> Result<Processed, RunError<H::Error>> {
        let Some(&message_type) = packet.buffer.first() else {
            return Err(Error::Inconsistent.into());
        };
        trace!("received message {message_type:?}, seqn {}", packet.seqn);

        if message_type == msg::DISCONNECT {
            let info = parse_disconnect(packet.buffer.get(1..).unwrap_or_default())?;
            return Err(Error::RemoteDisconnect(info).into());
        }

        let Some(kex) = self.kex.take() else {
            if message_type == msg::KEXINIT {
                // The server starts a key re-exchange.
                self.begin_rekey()?;
                let kex = self.kex.take().ok_or(Error::Inconsistent)?;
                return self.kex_step(kex, handler, packet).await;
            }
            if msg::is_kex_msg(message_type) {
                return Err(crate::unexpected_message(message_type, packet.seqn.0).into());
            }
            return self.process_running(handler, packet).await;
        };

        if !kex.has_peer_kexinit() {
            if message_type == msg::KEXINIT {
                return self.kex_step(kex, handler, packet).await;
            }
            if msg::is_kex_msg(message_type) {
                return Err(crate::unexpected_message(message_type, packet.seqn.0).into());
            }
            if kex.cause().is_rekey() {
                // Our KEXINIT is out, the server's is not in yet: the
                // connection goes on.
                self.kex = Some(kex);
                return self.process_running(handler, packet).await;
            }
            if packet.seqn.0 == u32::MAX {
                // Strict kex could not reset it in time.
                return Err(Error::SequenceNumberWrap.into());
            }
            if msg::is_transport_generic(message_type) {
                // Strictness is only known with the server's KEXINIT,
                // which then checks the sequence number.
                trace!("message {message_type} before the server's KEXINIT");
                self.kex = Some(kex);
                return Ok(Processed::Continue);
            }
            return Err(crate::unexpected_message(message_type, packet.seqn.0).into());
        }

        if msg::is_kex_msg(message_type) {
            return self.kex_step(kex, handler, packet).await;
        }
        if kex.is_initial_strict() || !msg::is_transport_generic(message_type) {
            return Err(crate::unexpected_message(message_type, packet.seqn.0).into());
        }
        trace!("ignoring message {message_type} during key exchange");
        self.kex = Some(kex);
        Ok(Processed::Continue)
    }

    async fn kex_step<H: Handler>(
        &mut self,
        kex: ClientKex,
        handler: &mut H,
        packet: &IncomingSshPacket<'_>,
    ) -> Result<Processed, RunError<H::Error>> {
        match kex.step(packet, &mut self.writer, handler).await? {
            KexProgress::NeedsReply { kex, sent_newkeys } => {
                if sent_newkeys {
                    if let Some(names) = kex.names() {
                        let authenticated =
                            self.encrypted.as_ref().is_some_and(|enc| enc.authenticated);
                        names
                            .client_compression
                            .init_compress(self.writer.compress(), authenticated);
                    }
                    // Bytes are counted per key.
                    self.writer.buffer().bytes = 0;
                }
                self.kex = Some(kex);
                Ok(Processed::Continue)
            }
            KexProgress::Done { newkeys } => self.install_newkeys(handler, newkeys).await,
        }
    }

    async fn install_newkeys<H: Handler>(
        &mut self,
        handler: &mut H,
        newkeys: NewKeys,
    ) -> Result<Processed, RunError<H::Error>> {
        let NewKeys {
            names,
            opening_key,
            session_id,
            server_host_key,
            ..
        } = newkeys;
        let rekey = self.encrypted.is_some();
        let reset_seqn = self.strict_kex || names.strict_kex();

        if let Some(enc) = self.encrypted.as_mut() {
            if enc.server_host_key.key_data() != server_host_key.key_data() {
                warn!("the server host key changed during key re-exchange");
                return Err(Error::UnknownKey.into());
            }
            names
                .server_compression
                .init_decompress(&mut enc.decompress, enc.authenticated);
            enc.names = names.clone();
            enc.last_rekey = Instant::now();
        } else {
            self.strict_kex = names.strict_kex();
            let mut decompress = Decompress::None;
            names
                .server_compression
                .init_decompress(&mut decompress, false);
            self.encrypted = Some(Encrypted::new(
                session_id,
                server_host_key,
                names.clone(),
                decompress,
            ));
        }
        debug!(
            "key exchange done: {:?} {:?} {:?}/{:?}",
            names.kex, names.key, names.client_cipher, names.server_cipher
        );
        self.publish_state();
        handler
            .kex_done(&names, rekey)
            .await
            .map_err(RunError::Handler)?;
        if let Some(done) = self.kex_done.take() {
            let _ = done.send(());
        }
        Ok(Processed::NewKeys {
            opening_key,
            reset_seqn,
        })
    }

    fn keepalive_deadline(&self) -> Option<Instant> {
        if self.encrypted.is_none() || self.kex.is_some() {
            return None;
        }
        self.config
            .keepalive_interval
            .map(|interval| self.keepalive_reference + interval)
    }

    fn rekey_deadline(&self) -> Option<Instant> {
        if self.kex.is_some() {
            return None;
        }
        self.encrypted
            .as_ref()
            .map(|enc| enc.last_rekey + self.config.limits.rekey_time_limit)
    }

    fn keepalive(&mut self) -> Result<(), Error> {
        if self.keepalive_sent >= self.config.keepalive_max {
            warn!("no answer to {} keepalive requests", self.keepalive_sent);
            return Err(Error::KeepaliveTimeout);
        }
        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
        enc.packet(|w| {
            msg::GLOBAL_REQUEST.encode(w)?;
            "keepalive@openssh.com".encode(w)?;
            1u8.encode(w)?;
            Ok(())
        })?;
        self.open_global_requests
            .push_back(GlobalRequestResponse::Keepalive);
        self.keepalive_sent += 1;
        self.keepalive_reference = Instant::now();
        debug!("keepalive sent ({})", self.keepalive_sent);
        Ok(())
    }

    fn compute_state(&self) -> State {
        if matches!(self.phase, State::Disconnecting | State::Closed) || self.disconnecting {
            return if self.phase == State::Closed {
                State::Closed
            } else {
                State::Disconnecting
            };
        }
        match (&self.kex, &self.encrypted) {
            (Some(kex), _) if kex.sent_newkeys() => State::AwaitingNewKeys,
            (Some(kex), _) if kex.has_peer_kexinit() => State::PerformingKeyExchange,
            (Some(_), _) => State::AwaitingKexInit,
            (None, Some(_)) => State::Running,
            (None, None) => self.phase,
        }
    }

    fn publish_state(&self) {
        let state = self.compute_state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            trace!("session state {current:?} -> {state:?}");
            *current = state;
            true
        });
    }

    fn set_phase(&mut self, phase: State) {
        self.phase = phase;
        self.publish_state();
    }

    /// Handle a command from the handle or from a channel.
    async fn command(&mut self, command: Command) -> Result<(), Error> {
        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
        match command {
            Command::ChannelOpen {
                kind,
                sender,
                window_size,
                initial_window_size,
                maximum_packet_size,
            } => {
                let id = enc.new_channel(initial_window_size, maximum_packet_size);
                debug!("opening {} channel {id}", kind.channel_type());
                enc.packet(|w| {
                    msg::CHANNEL_OPEN.encode(w)?;
                    kind.channel_type().encode(w)?;
                    id.encode(w)?;
                    initial_window_size.encode(w)?;
                    maximum_packet_size.encode(w)?;
                    kind.encode_open(w)?;
                    Ok(())
                })?;
                self.channels
                    .insert(id, ChannelRef::new(sender, window_size));
            }
            Command::Channel(id, msg) => self.channel_command(id, msg).await?,
            Command::Payload(payload) => {
                enc.packet(|w| {
                    w.extend(&payload);
                    Ok(())
                })?;
            }
            Command::TcpIpForward {
                address,
                port,
                reply,
            } => {
                enc.packet(|w| {
                    msg::GLOBAL_REQUEST.encode(w)?;
                    "tcpip-forward".encode(w)?;
                    1u8.encode(w)?;
                    address.encode(w)?;
                    port.encode(w)?;
                    Ok(())
                })?;
                self.open_global_requests
                    .push_back(GlobalRequestResponse::TcpIpForward(reply));
            }
            Command::CancelTcpIpForward {
                address,
                port,
                reply,
            } => {
                enc.packet(|w| {
                    msg::GLOBAL_REQUEST.encode(w)?;
                    "cancel-tcpip-forward".encode(w)?;
                    1u8.encode(w)?;
                    address.encode(w)?;
                    port.encode(w)?;
                    Ok(())
                })?;
                self.open_global_requests
                    .push_back(GlobalRequestResponse::CancelTcpIpForward(reply));
            }
            Command::Rekey => enc.rekey_wanted = true,
            Command::Disconnect {
                reason,
                description,
                language_tag,
            } => {
                debug!("disconnecting: {reason:?} {description:?}");
                enc.packet(|w| write_disconnect(w, reason, &description, &language_tag))?;
                self.disconnecting = true;
                self.publish_state();
            }
        }
        Ok(())
    }
}
