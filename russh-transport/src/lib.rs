#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
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

//! Asynchronous SSH-2.0 client transport, based on tokio.
//!
//! This crate covers the layers of an SSH client that sit below
//! authentication and user-facing tools:
//!
//! * the binary packet protocol (framing, padding, encryption, MACs,
//!   compression, sequence numbers),
//! * algorithm negotiation and key exchange, including OpenSSH's
//!   "strict kex" extension,
//! * the connection state machine with rekeying,
//! * and the channel multiplexer with flow control.
//!
//! The entry points are [`client::connect`] and
//! [`client::connect_stream`]. Both return a [`client::Handle`] once
//! the first key exchange has completed; from there, callers open
//! channels ([`Channel`]), request services and exchange
//! authentication messages through [`client::Handle::send_message`].
//!
//! Lifecycle events are reported to a [`client::Handler`], which also
//! decides whether the server's host key is acceptable.
//!
//! # Internal details of the event loop
//!
//! Every connection is driven by one background task which owns the
//! socket, both cipher states and the channel table. Handles and
//! channels talk to it over queues. Packets produced while a key
//! exchange is in progress are buffered and only encrypted once the
//! new keys are in place, so the task is the single writer of the
//! outbound packet stream.

use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

use log::warn;
pub use russh_cryptovec::CryptoVec;
use ssh_encoding::{Decode, Encode};
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Cipher names
pub mod cipher;
/// Compression algorithm names
pub mod compression;
/// Key exchange algorithm names
pub mod kex;
/// MAC algorithm names
pub mod mac;

mod helpers;
mod msg;
mod negotiation;
mod sshbuffer;

pub use negotiation::{Names, Preferred};
pub use sshbuffer::{ServerId, SshId};

/// Append a length-prefixed payload to a queue of outgoing packets:
/// `$x` writes the payload into `$buffer`.
macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        let start = $buffer.len();
        $buffer.extend(&[0; 4]);
        let x = $x;
        let len = ($buffer.len() - start - 4) as u32;
        if let Some(prefix) = $buffer.get_mut(start..start + 4) {
            prefix.copy_from_slice(&len.to_be_bytes());
        }
        x
    }};
}

mod channels;
pub use channels::{Channel, ChannelKind, ChannelMsg};

mod parsing;
mod session;

/// Client side of this library.
pub mod client;

#[derive(Debug)]
pub enum AlgorithmKind {
    Kex,
    Key,
    Cipher,
    Compression,
    Mac,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// Unknown algorithm name.
    #[error("Unknown algorithm")]
    UnknownAlgo,

    /// No common algorithm found during key exchange.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgo {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// Invalid SSH version string.
    #[error("invalid SSH version string")]
    Version,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Index out of bounds.
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// The handler refused the server key.
    #[error("Unknown server key")]
    UnknownKey,

    /// The server provided a wrong signature.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// Excessive packet size.
    #[error("Bad packet size: {0}")]
    PacketSize(usize),

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Server refused to open a channel.
    #[error("Failed to open channel ({reason:?}): {description}")]
    ChannelOpenFailure {
        reason: ChannelOpenFailure,
        description: String,
    },

    /// The session is gone.
    #[error("Disconnected")]
    Disconnect,

    /// The server sent a DISCONNECT message.
    #[error("Disconnected by the server: {0}")]
    RemoteDisconnect(RemoteDisconnectInfo),

    /// Connection closed by the remote side.
    #[error("Connection closed by the remote side")]
    HUP,

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// The connection attempt was cancelled by the caller.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// Keepalive timeout.
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    #[error("Channel send error")]
    SendError,

    #[error("Failed to decrypt a packet")]
    DecryptionError,

    /// Strict key exchange requires the server's KEXINIT to be the
    /// very first packet of the connection.
    #[error("KEXINIT was not the first packet during strict key exchange.")]
    KexInitNotFirst,

    /// A message that is not allowed in the current state of the
    /// connection, for instance a non-kex message in the middle of a
    /// strict key exchange.
    #[error("Message type {message_type} is not valid in the current context.")]
    UnexpectedMessage {
        message_type: u8,
        sequence_number: u32,
    },

    #[error("Inbound packet sequence number is about to wrap during initial key exchange.")]
    SequenceNumberWrap,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    #[cfg(feature = "flate2")]
    Compress(#[from] flate2::CompressError),

    #[error(transparent)]
    #[cfg(feature = "flate2")]
    Decompress(#[from] flate2::DecompressError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The session closed the channel before its reply arrived.
    #[error("Unable to receive more messages from the channel")]
    RecvError,

    /// The server answered a global request with REQUEST_FAILURE.
    #[error("Request denied by the server")]
    RequestDenied,

    /// Transport and connection layer messages are sent by the session
    /// itself, not through [`client::Handle::send_message`].
    #[error("Message type {0} cannot be sent by the application")]
    ForbiddenMessage(u8),
}

impl Error {
    /// The disconnect reason associated with this error, if any.
    ///
    /// Errors received from the server carry the server's own code;
    /// errors detected locally map to the code we send (or would
    /// send) to the server. Local conditions that are not a protocol
    /// failure of the connection (I/O errors, timeouts, cancellation,
    /// messages that are merely out of place) return `None`.
    pub fn disconnect_reason(&self) -> Option<Disconnect> {
        match self {
            Error::RemoteDisconnect(info) => Disconnect::try_from(info.reason_code).ok(),
            Error::PacketAuth | Error::DecryptionError => Some(Disconnect::MACError),
            Error::KexInitNotFirst
            | Error::SequenceNumberWrap
            | Error::Kex
            | Error::KexInit
            | Error::NoCommonAlgo { .. }
            | Error::WrongServerSig => Some(Disconnect::KeyExchangeFailed),
            Error::UnknownKey => Some(Disconnect::HostKeyNotVerifiable),
            Error::Version => Some(Disconnect::ProtocolVersionNotSupported),
            #[cfg(feature = "flate2")]
            Error::Compress(_) | Error::Decompress(_) => Some(Disconnect::CompressionError),
            Error::PacketSize(_) | Error::Inconsistent | Error::IndexOutOfBounds => {
                Some(Disconnect::ProtocolError)
            }
            _ => None,
        }
    }
}

pub(crate) fn unexpected_message(message_type: u8, sequence_number: u32) -> crate::Error {
    warn!("unexpected message {message_type:?} at sequence no. {sequence_number:?}");
    crate::Error::UnexpectedMessage {
        message_type,
        sequence_number,
    }
}

/// The contents of a DISCONNECT message sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDisconnectInfo {
    /// Raw reason code; see [`Disconnect`] for the known values.
    pub reason_code: u32,
    pub message: String,
    pub lang_tag: String,
}

impl RemoteDisconnectInfo {
    pub fn reason(&self) -> Option<Disconnect> {
        Disconnect::try_from(self.reason_code).ok()
    }
}

impl Display for RemoteDisconnectInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{reason:?} ({:?})", self.message),
            None => write!(f, "code {} ({:?})", self.reason_code, self.message),
        }
    }
}

/// The number of bytes read/written, and the number of seconds before a key
/// re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot lead to
    /// nonce reuse.
    pub fn new(
        write_limit: usize,
        read_limit: usize,
        time_limit: std::time::Duration,
    ) -> Result<Limits, Error> {
        if write_limit > 1 << 30 || read_limit > 1 << 30 {
            return Err(Error::InvalidConfig(format!(
                "rekey limits must not exceed {} bytes",
                1 << 30
            )));
        }
        Ok(Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        })
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 Gb
            rekey_read_limit: 1 << 30,  // 1 Gb
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection, as in
/// [RFC4253 section 11.1](https://tools.ietf.org/html/rfc4253#section-11.1).
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl Disconnect {
    const ALL: [Disconnect; 15] = [
        Disconnect::HostNotAllowedToConnect,
        Disconnect::ProtocolError,
        Disconnect::KeyExchangeFailed,
        Disconnect::Reserved,
        Disconnect::MACError,
        Disconnect::CompressionError,
        Disconnect::ServiceNotAvailable,
        Disconnect::ProtocolVersionNotSupported,
        Disconnect::HostKeyNotVerifiable,
        Disconnect::ConnectionLost,
        Disconnect::ByApplication,
        Disconnect::TooManyConnections,
        Disconnect::AuthCancelledByUser,
        Disconnect::NoMoreAuthMethodsAvailable,
        Disconnect::IllegalUserName,
    ];
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Disconnect::ALL
            .iter()
            .find(|reason| **reason as u32 == code)
            .copied()
            .ok_or(crate::Error::Inconsistent)
    }
}

macro_rules! signals {
    ($(#[$meta:meta])* $name:ident { $($sig:ident),* $(,)? }) => {
        $(#[$meta])*
        pub enum $name {
            $($sig,)*
            Custom(String),
        }

        impl $name {
            /// The name on the wire, without the `SIG` prefix.
            fn name(&self) -> &str {
                match self {
                    $($name::$sig => stringify!($sig),)*
                    $name::Custom(c) => c,
                }
            }

            fn from_name(name: &str) -> $name {
                match name {
                    $(stringify!($sig) => $name::$sig,)*
                    x => $name::Custom(x.to_string()),
                }
            }
        }
    };
}

signals! {
    /// The type of signals that can be sent to a remote process. If you
    /// plan to use custom signals, read [the
    /// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
    /// understand the encoding.
    #[allow(missing_docs)]
    #[derive(Debug, Clone, PartialEq, Eq)]
    Sig { ABRT, ALRM, FPE, HUP, ILL, INT, KILL, PIPE, QUIT, SEGV, TERM, USR1 }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    /// A code outside of RFC 4254's table.
    Other(u32),
}

impl ChannelOpenFailure {
    pub(crate) fn from_u32(x: u32) -> ChannelOpenFailure {
        match x {
            1 => ChannelOpenFailure::AdministrativelyProhibited,
            2 => ChannelOpenFailure::ConnectFailed,
            3 => ChannelOpenFailure::UnknownChannelType,
            4 => ChannelOpenFailure::ResourceShortage,
            x => ChannelOpenFailure::Other(x),
        }
    }

    pub(crate) fn as_u32(&self) -> u32 {
        match *self {
            ChannelOpenFailure::AdministrativelyProhibited => 1,
            ChannelOpenFailure::ConnectFailed => 2,
            ChannelOpenFailure::UnknownChannelType => 3,
            ChannelOpenFailure::ResourceShortage => 4,
            ChannelOpenFailure::Other(x) => x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
