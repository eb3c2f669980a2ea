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

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::mem::replace;
use std::num::Wrapping;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use ssh_encoding::Encode;
use ssh_key::PublicKey;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cipher::OpeningKey;
use crate::compression::Decompress;
use crate::kex::KexAlgorithm;
use crate::negotiation::Names;
use crate::sshbuffer::PacketWriter;
use crate::{msg, ChannelId, CryptoVec, Error, Limits};

/// What both sides said during a key exchange, for the exchange hash.
#[derive(Debug, Default, Clone)]
pub(crate) struct Exchange {
    pub client_id: CryptoVec,
    pub server_id: CryptoVec,
    pub client_kex_init: CryptoVec,
    pub server_kex_init: CryptoVec,
    pub client_ephemeral: CryptoVec,
    pub server_ephemeral: CryptoVec,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        Exchange {
            client_id: client_id.into(),
            server_id: server_id.into(),
            ..Default::default()
        }
    }
}

/// The result of a completed key exchange, waiting for the server's
/// NEWKEYS to be installed.
pub(crate) struct NewKeys {
    pub names: Names,
    pub kex: Box<dyn KexAlgorithm + Send>,
    pub opening_key: Box<dyn OpeningKey + Send>,
    pub session_id: CryptoVec,
    pub server_host_key: PublicKey,
}

impl Debug for NewKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewKeys")
            .field("names", &self.names)
            .field("kex", &self.kex)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for the server.
    Opening,
    Open,
    /// One side has sent CHANNEL_CLOSE.
    Closing,
}

/// The parameters of a channel.
#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    pub recipient_window_size: u32,
    pub sender_window_size: u32,
    /// The window we announced, restored by WINDOW_ADJUST.
    pub sender_initial_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    pub state: ChannelState,
    pub close_sent: bool,
    pub close_received: bool,
    /// Requests sent with `want_reply`, oldest first.
    pub pending_replies: VecDeque<&'static str>,
    /// Data that did not fit in the server's window yet.
    pub pending_data: VecDeque<(CryptoVec, Option<u32>, usize)>,
    pub pending_eof: bool,
    pub pending_close: bool,
}

impl ChannelParams {
    pub fn confirm(&mut self, recipient_channel: u32, window_size: u32, maximum_packet_size: u32) {
        self.recipient_channel = recipient_channel;
        self.recipient_window_size = window_size;
        self.recipient_maximum_packet_size = maximum_packet_size;
        self.state = ChannelState::Open;
    }

    /// Both CHANNEL_CLOSE messages have been exchanged.
    pub fn is_closed(&self) -> bool {
        self.close_sent && self.close_received
    }
}

/// Replies to our global requests arrive in the order the requests
/// were sent.
#[derive(Debug)]
pub(crate) enum GlobalRequestResponse {
    /// request was for Keepalive, ignore result
    Keepalive,
    /// request was for TcpIpForward, sends Some(port) for success or None for failure
    TcpIpForward(oneshot::Sender<Option<u32>>),
    /// request was for CancelTcpIpForward, sends true for success or false for failure
    CancelTcpIpForward(oneshot::Sender<bool>),
}

/// The state of the session once the first key exchange is done.
#[derive(Debug)]
pub(crate) struct Encrypted {
    pub session_id: CryptoVec,
    pub server_host_key: PublicKey,
    pub names: Names,
    pub channels: HashMap<ChannelId, ChannelParams>,
    pub last_channel_id: Wrapping<u32>,
    /// Length-prefixed payloads, encrypted on the next flush.
    pub write: CryptoVec,
    pub write_cursor: usize,
    pub last_rekey: Instant,
    pub decompress: Decompress,
    pub authenticated: bool,
    pub rekey_wanted: bool,
}

impl Encrypted {
    pub fn new(
        session_id: CryptoVec,
        server_host_key: PublicKey,
        names: Names,
        decompress: Decompress,
    ) -> Self {
        Encrypted {
            session_id,
            server_host_key,
            names,
            channels: HashMap::new(),
            last_channel_id: Wrapping(1),
            write: CryptoVec::new(),
            write_cursor: 0,
            last_rekey: Instant::now(),
            decompress,
            authenticated: false,
            rekey_wanted: false,
        }
    }

    /// Queue a payload.
    pub fn packet<F: FnOnce(&mut CryptoVec) -> Result<(), Error>>(
        &mut self,
        f: F,
    ) -> Result<(), Error> {
        push_packet!(self.write, f(&mut self.write)?);
        Ok(())
    }

    pub fn byte(&mut self, channel: ChannelId, msg: u8) -> Result<(), Error> {
        if let Some(channel) = self.channels.get(&channel) {
            push_packet!(self.write, {
                self.write.push(msg);
                channel.recipient_channel.encode(&mut self.write)?;
            });
        }
        Ok(())
    }

    pub fn eof(&mut self, channel: ChannelId) -> Result<(), Error> {
        if let Some(channel) = self.has_pending_data_mut(channel) {
            channel.pending_eof = true;
        } else {
            self.byte(channel, msg::CHANNEL_EOF)?;
        }
        Ok(())
    }

    /// Send our CHANNEL_CLOSE, once. Returns `true` if the channel was
    /// removed, i.e. the server's close was already in.
    pub fn close(&mut self, id: ChannelId) -> Result<bool, Error> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(false);
        };
        if channel.close_sent {
            return Ok(false);
        }
        if !channel.pending_data.is_empty() && !channel.close_received {
            channel.pending_close = true;
            return Ok(false);
        }
        channel.close_sent = true;
        channel.pending_data.clear();
        channel.state = ChannelState::Closing;
        let removed = channel.is_closed();
        self.byte(id, msg::CHANNEL_CLOSE)?;
        if removed {
            debug!("channel {id} closed");
            self.channels.remove(&id);
        }
        Ok(removed)
    }

    /// Record the server's CHANNEL_CLOSE and answer it. The channel is
    /// removed.
    pub fn close_received(&mut self, id: ChannelId) -> Result<(), Error> {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.close_received = true;
            channel.state = ChannelState::Closing;
        }
        self.close(id)?;
        if self.channels.get(&id).is_some_and(|c| c.is_closed()) {
            self.channels.remove(&id);
        }
        Ok(())
    }

    /// Account for `len` bytes received on `channel`, and send a
    /// WINDOW_ADJUST back to the announced window once the window falls
    /// under half of it.
    pub fn adjust_window_size(&mut self, channel: ChannelId, len: usize) -> Result<bool, Error> {
        if let Some(channel) = self.channels.get_mut(&channel) {
            let target = channel.sender_initial_window_size;
            trace!(
                "adjust_window_size, channel = {}, size = {},",
                channel.sender_channel,
                target
            );
            // Ignore extra data.
            // https://tools.ietf.org/html/rfc4254#section-5.2
            if len as u32 <= channel.sender_window_size {
                channel.sender_window_size -= len as u32;
            } else {
                warn!(
                    "server overran the window of channel {}",
                    channel.sender_channel
                );
                channel.sender_window_size = 0;
            }
            if channel.sender_window_size < target / 2 && !channel.close_sent {
                debug!(
                    "sender_window_size {:?}, target {:?}",
                    channel.sender_window_size, target
                );
                push_packet!(self.write, {
                    self.write.push(msg::CHANNEL_WINDOW_ADJUST);
                    channel.recipient_channel.encode(&mut self.write)?;
                    (target - channel.sender_window_size).encode(&mut self.write)?;
                });
                channel.sender_window_size = target;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Push the largest prefix of `buf0[from..]` that fits in the
    /// window, split into packets of at most the server's maximum
    /// packet size. Returns the new offset.
    fn data_noqueue(
        write: &mut CryptoVec,
        channel: &mut ChannelParams,
        buf0: &[u8],
        ext: Option<u32>,
        from: usize,
    ) -> Result<usize, Error> {
        let rest = buf0.get(from..).unwrap_or_default();
        let len = rest.len().min(channel.recipient_window_size as usize);
        let mut buf = rest.get(..len).unwrap_or_default();
        let max = (channel.recipient_maximum_packet_size as usize).max(1);

        while !buf.is_empty() {
            let (now, later) = buf.split_at(buf.len().min(max));
            match ext {
                None => push_packet!(write, {
                    write.push(msg::CHANNEL_DATA);
                    channel.recipient_channel.encode(write)?;
                    now.encode(write)?;
                }),
                Some(ext) => push_packet!(write, {
                    write.push(msg::CHANNEL_EXTENDED_DATA);
                    channel.recipient_channel.encode(write)?;
                    ext.encode(write)?;
                    now.encode(write)?;
                }),
            }
            channel.recipient_window_size -= now.len() as u32;
            buf = later;
        }
        trace!(
            "sent {len} bytes, window is now {}",
            channel.recipient_window_size
        );
        Ok(from + len)
    }

    pub fn data(&mut self, id: ChannelId, ext: Option<u32>, buf0: CryptoVec) -> Result<(), Error> {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!("{id:?} not saved for this session");
            return Ok(());
        };
        if channel.state != ChannelState::Open || channel.close_sent {
            debug!("dropping data for channel {id} in state {:?}", channel.state);
            return Ok(());
        }
        if !channel.pending_data.is_empty() {
            channel.pending_data.push_back((buf0, ext, 0));
            return Ok(());
        }
        let sent = Self::data_noqueue(&mut self.write, channel, &buf0, ext, 0)?;
        if sent < buf0.len() {
            // The window is shared with the channel handle, so this only
            // happens if the handle is ahead of our accounting.
            debug!("channel {id}: {} bytes waiting for window", buf0.len() - sent);
            channel.pending_data.push_back((buf0, ext, sent))
        }
        Ok(())
    }

    /// The server opened the window of `id`: send what was waiting.
    pub fn window_adjusted(&mut self, id: ChannelId, by: u32) -> Result<Option<u32>, Error> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(None);
        };
        channel.recipient_window_size = channel.recipient_window_size.saturating_add(by);
        let new_size = channel.recipient_window_size;
        self.flush_pending(id)?;
        Ok(Some(new_size))
    }

    fn has_pending_data_mut(&mut self, channel: ChannelId) -> Option<&mut ChannelParams> {
        self.channels
            .get_mut(&channel)
            .filter(|c| !c.pending_data.is_empty())
    }

    fn flush_pending(&mut self, id: ChannelId) -> Result<(), Error> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        while let Some((buf, ext, from)) = channel.pending_data.pop_front() {
            let sent = Self::data_noqueue(&mut self.write, channel, &buf, ext, from)?;
            if sent < buf.len() {
                channel.pending_data.push_front((buf, ext, sent));
                return Ok(());
            }
        }
        let (eof, close) = (channel.pending_eof, channel.pending_close);
        channel.pending_eof = false;
        channel.pending_close = false;
        if eof {
            self.byte(id, msg::CHANNEL_EOF)?;
        }
        if close {
            self.close(id)?;
        }
        Ok(())
    }

    /// Encrypt the queued payloads. Returns whether a key re-exchange
    /// is due.
    pub fn flush(&mut self, limits: &Limits, writer: &mut PacketWriter) -> Result<bool, Error> {
        while self.write_cursor < self.write.len() {
            let start = self.write_cursor;
            let len = self
                .write
                .get(start..start + 4)
                .map(BigEndian::read_u32)
                .ok_or(Error::IndexOutOfBounds)? as usize;
            let to_write = self
                .write
                .get(start + 4..start + 4 + len)
                .ok_or(Error::IndexOutOfBounds)?;
            writer.packet_raw(to_write)?;
            self.write_cursor += 4 + len
        }
        // All packets have been written.
        self.write_cursor = 0;
        self.write.clear();

        let dur = Instant::now().duration_since(self.last_rekey);
        Ok(replace(&mut self.rekey_wanted, false)
            || writer.buffer().bytes >= limits.rekey_write_limit
            || dur >= limits.rekey_time_limit)
    }

    /// Allocate a channel id. Ids come from a wrapping counter and
    /// skip the ones still in the table.
    pub fn new_channel(&mut self, window_size: u32, maxpacket: u32) -> ChannelId {
        loop {
            self.last_channel_id += Wrapping(1);
            if let std::collections::hash_map::Entry::Vacant(vacant_entry) =
                self.channels.entry(ChannelId(self.last_channel_id.0))
            {
                vacant_entry.insert(ChannelParams {
                    recipient_channel: 0,
                    sender_channel: ChannelId(self.last_channel_id.0),
                    sender_window_size: window_size,
                    sender_initial_window_size: window_size,
                    recipient_window_size: 0,
                    sender_maximum_packet_size: maxpacket,
                    recipient_maximum_packet_size: 0,
                    state: ChannelState::Opening,
                    close_sent: false,
                    close_received: false,
                    pending_replies: VecDeque::new(),
                    pending_data: VecDeque::new(),
                    pending_eof: false,
                    pending_close: false,
                });
                return ChannelId(self.last_channel_id.0);
            }
        }
    }
}
