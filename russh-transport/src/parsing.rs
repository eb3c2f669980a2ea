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
use ssh_encoding::{Decode, Encode, Reader, Writer};

use crate::channels::ChannelKind;
use crate::{msg, ChannelId, ChannelOpenFailure, CryptoVec, Error};

/// A CHANNEL_OPEN sent by the server.
#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub typ: String,
    /// `None` for channel types we do not know about.
    pub kind: Option<ChannelKind>,
    pub recipient_channel: u32,
    pub recipient_window_size: u32,
    pub recipient_maximum_packet_size: u32,
}

impl OpenChannelMessage {
    /// Parse the message, `r` starting after the message type.
    pub fn parse<R: Reader>(r: &mut R) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let typ = String::decode(r)?;
        let sender = u32::decode(r)?;
        let window = u32::decode(r)?;
        let maxpacket = u32::decode(r)?;
        let kind = ChannelKind::decode_open(&typ, r)?;

        Ok(Self {
            typ,
            kind,
            recipient_channel: sender,
            recipient_window_size: window,
            recipient_maximum_packet_size: maxpacket,
        })
    }

    /// Write a CHANNEL_OPEN_CONFIRMATION for this channel.
    pub fn confirm(
        &self,
        buffer: &mut CryptoVec,
        sender_channel: ChannelId,
        window_size: u32,
        packet_size: u32,
    ) -> Result<(), Error> {
        push_packet!(buffer, {
            msg::CHANNEL_OPEN_CONFIRMATION.encode(buffer)?;
            self.recipient_channel.encode(buffer)?; // remote channel number.
            sender_channel.encode(buffer)?; // our channel number.
            window_size.encode(buffer)?;
            packet_size.encode(buffer)?;
        });
        Ok(())
    }

    /// Write a CHANNEL_OPEN_FAILURE for this channel.
    pub fn fail(
        &self,
        buffer: &mut CryptoVec,
        reason: ChannelOpenFailure,
        message: &str,
    ) -> Result<(), Error> {
        push_packet!(buffer, {
            msg::CHANNEL_OPEN_FAILURE.encode(buffer)?;
            self.recipient_channel.encode(buffer)?;
            reason.as_u32().encode(buffer)?;
            message.encode(buffer)?;
            "en".encode(buffer)?;
        });
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub recipient_channel: ChannelId,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl Decode for ChannelOpenConfirmation {
    type Error = ssh_encoding::Error;

    fn decode(r: &mut impl Reader) -> Result<Self, Self::Error> {
        Ok(Self {
            recipient_channel: ChannelId::decode(r)?,
            sender_channel: u32::decode(r)?,
            initial_window_size: u32::decode(r)?,
            maximum_packet_size: u32::decode(r)?,
        })
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenFailureMessage {
    pub recipient_channel: ChannelId,
    pub reason: ChannelOpenFailure,
    pub description: String,
}

impl Decode for ChannelOpenFailureMessage {
    type Error = ssh_encoding::Error;

    fn decode(r: &mut impl Reader) -> Result<Self, Self::Error> {
        let recipient_channel = ChannelId::decode(r)?;
        let reason = ChannelOpenFailure::from_u32(u32::decode(r)?);
        let description = String::decode(r)?;
        // The language tag is optional in practice.
        let _ = String::decode(r);
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}

/// The body of a DISCONNECT message.
pub(crate) fn parse_disconnect(mut r: &[u8]) -> Result<crate::RemoteDisconnectInfo, Error> {
    let reason_code = u32::decode(&mut r)?;
    let message = String::decode(&mut r)?;
    let lang_tag = String::decode(&mut r).unwrap_or_default();
    Ok(crate::RemoteDisconnectInfo {
        reason_code,
        message,
        lang_tag,
    })
}

/// Write a DISCONNECT payload.
pub(crate) fn write_disconnect<W: Writer>(
    w: &mut W,
    reason: crate::Disconnect,
    description: &str,
    language_tag: &str,
) -> Result<(), Error> {
    msg::DISCONNECT.encode(w)?;
    (reason as u32).encode(w)?;
    description.encode(w)?;
    language_tag.encode(w)?;
    Ok(())
}

/// Parse the extensions of an EXT_INFO message, `r` starting after the
/// message type. https://tools.ietf.org/html/rfc8308#section-2.3
pub(crate) fn parse_ext_info(mut r: &[u8]) -> Result<Vec<(String, Vec<u8>)>, Error> {
    let n = u32::decode(&mut r)?;
    let mut extensions = Vec::new();
    for _ in 0..n {
        let name = String::decode(&mut r)?;
        let value = Vec::<u8>::decode(&mut r)?;
        extensions.push((name, value));
    }
    Ok(extensions)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
    use super::*;

    #[test]
    fn parses_forwarded_tcpip_open() {
        let mut payload = CryptoVec::new();
        "forwarded-tcpip".encode(&mut payload).unwrap();
        7u32.encode(&mut payload).unwrap();
        1024u32.encode(&mut payload).unwrap();
        512u32.encode(&mut payload).unwrap();
        "10.0.0.1".encode(&mut payload).unwrap();
        8080u32.encode(&mut payload).unwrap();
        "10.0.0.2".encode(&mut payload).unwrap();
        45678u32.encode(&mut payload).unwrap();

        let open = OpenChannelMessage::parse(&mut &payload[..]).unwrap();
        assert_eq!(open.recipient_channel, 7);
        assert_eq!(open.recipient_window_size, 1024);
        assert_eq!(open.recipient_maximum_packet_size, 512);
        match open.kind {
            Some(ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_port,
                ..
            }) => {
                assert_eq!(connected_address, "10.0.0.1");
                assert_eq!(connected_port, 8080);
                assert_eq!(originator_port, 45678);
            }
            k => panic!("unexpected kind {k:?}"),
        }
    }

    #[test]
    fn unknown_channel_types_are_kept_by_name() {
        let mut payload = CryptoVec::new();
        "weird@example.com".encode(&mut payload).unwrap();
        1u32.encode(&mut payload).unwrap();
        2u32.encode(&mut payload).unwrap();
        3u32.encode(&mut payload).unwrap();
        let open = OpenChannelMessage::parse(&mut &payload[..]).unwrap();
        assert!(open.kind.is_none());
        assert_eq!(open.typ, "weird@example.com");

        let mut out = CryptoVec::new();
        open.fail(&mut out, ChannelOpenFailure::UnknownChannelType, "no")
            .unwrap();
        // Length prefix, then the message.
        assert_eq!(out[4], msg::CHANNEL_OPEN_FAILURE);
        assert_eq!(&out[5..9], &[0, 0, 0, 1]);
        assert_eq!(&out[9..13], &[0, 0, 0, 3]);
    }

    #[test]
    fn disconnect_without_language_tag() {
        let mut payload = CryptoVec::new();
        12u32.encode(&mut payload).unwrap();
        "too many".encode(&mut payload).unwrap();
        let info = parse_disconnect(&payload).unwrap();
        assert_eq!(info.reason(), Some(crate::Disconnect::TooManyConnections));
        assert_eq!(info.message, "too many");
        assert_eq!(info.lang_tag, "");
    }
}
