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
use std::collections::HashMap;

use log::{debug, error, info, trace, warn};
use ssh_encoding::{Decode, Encode};
use tokio::sync::mpsc::unbounded_channel;

use super::{Handler, IncomingSshPacket, Msg, Processed, RunError, Session};
use crate::channels::{Channel, ChannelKind, ChannelMsg, ChannelRef, WindowSizeRef};
use crate::parsing::{
    parse_ext_info, ChannelOpenConfirmation, ChannelOpenFailureMessage, OpenChannelMessage,
};
use crate::session::{ChannelState, GlobalRequestResponse};
use crate::{msg, ChannelId, ChannelOpenFailure, CryptoVec, Error, Sig};

/// Drop the session's end of a channel: the handle sees the end of its
/// message stream, and writers waiting for window fail.
async fn forget_channel(channels: &mut HashMap<ChannelId, ChannelRef>, id: ChannelId) {
    if let Some(channel) = channels.remove(&id) {
        channel.window_size().close().await;
    }
}

impl Session {
    /// Messages outside of key exchange.
    pub(super) async fn process_running<H: Handler>(
        &mut self,
        handler: &mut H,
        packet: &IncomingSshPacket<'_>,
    ) -> Result<Processed, RunError<H::Error>> {
        let buf = packet.buffer;
        let message_type = buf.first().copied().ok_or(Error::Inconsistent)?;
        let mut r = buf.get(1..).unwrap_or_default();

        let Some(enc) = self.encrypted.as_mut() else {
            return Err(crate::unexpected_message(message_type, packet.seqn.0).into());
        };

        match message_type {
            msg::IGNORE => {}
            msg::DEBUG => {
                let always_display = u8::decode(&mut r)? != 0;
                let message = String::decode(&mut r)?;
                if always_display {
                    info!("server says: {message:?}");
                } else {
                    debug!("server debug message: {message:?}");
                }
            }
            msg::UNIMPLEMENTED => {
                let seqn = u32::decode(&mut r)?;
                warn!("server did not implement our packet {seqn}");
            }
            msg::EXT_INFO => {
                let extensions = parse_ext_info(r)?;
                debug!(
                    "server extensions: {:?}",
                    extensions.iter().map(|(name, _)| name).collect::<Vec<_>>()
                );
                handler
                    .ext_info(&extensions)
                    .await
                    .map_err(RunError::Handler)?;
            }
            msg::SERVICE_ACCEPT | 50..=79 => {
                if message_type == msg::USERAUTH_SUCCESS && !enc.authenticated {
                    debug!("authenticated");
                    enc.authenticated = true;
                    // Delayed compression starts now, in both directions.
                    enc.names
                        .client_compression
                        .init_compress(self.writer.compress(), true);
                    enc.names
                        .server_compression
                        .init_decompress(&mut enc.decompress, true);
                }
                handler
                    .service_message(buf)
                    .await
                    .map_err(RunError::Handler)?;
            }
            m if msg::is_connection_msg(m) => {
                self.process_connection(handler, message_type, packet.seqn.0, r)
                    .await?;
            }
            m => {
                debug!("unimplemented message {m}, seqn {}", packet.seqn);
                enc.packet(|w| {
                    msg::UNIMPLEMENTED.encode(w)?;
                    packet.seqn.0.encode(w)?;
                    Ok(())
                })?;
            }
        }
        Ok(Processed::Continue)
    }

    async fn unknown_channel<H: Handler>(
        handler: &mut H,
        id: ChannelId,
        message_type: u8,
    ) -> Result<(), RunError<H::Error>> {
        warn!("message {message_type} for unknown channel {id}");
        handler
            .unknown_channel(id, message_type)
            .await
            .map_err(RunError::Handler)
    }

    async fn process_connection<H: Handler>(
        &mut self,
        handler: &mut H,
        message_type: u8,
        seqn: u32,
        mut r: &[u8],
    ) -> Result<(), RunError<H::Error>> {
        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
        match message_type {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let confirmation = ChannelOpenConfirmation::decode(&mut r)?;
                let id = confirmation.recipient_channel;
                match enc.channels.get_mut(&id) {
                    Some(params) if params.state == ChannelState::Opening => {
                        params.confirm(
                            confirmation.sender_channel,
                            confirmation.initial_window_size,
                            confirmation.maximum_packet_size,
                        );
                    }
                    _ => return Self::unknown_channel(handler, id, message_type).await,
                }
                debug!(
                    "channel {id} open, window {}, max packet {}",
                    confirmation.initial_window_size, confirmation.maximum_packet_size
                );
                let delivered = match self.channels.get(&id) {
                    Some(channel) => {
                        channel
                            .window_size()
                            .grow(confirmation.initial_window_size)
                            .await;
                        channel
                            .send(ChannelMsg::Open {
                                id,
                                max_packet_size: confirmation.maximum_packet_size,
                                window_size: confirmation.initial_window_size,
                            })
                            .is_ok()
                    }
                    None => false,
                };
                if !delivered {
                    // Nobody is waiting for this channel anymore.
                    debug!("channel {id} was abandoned, closing it");
                    if enc.close(id)? {
                        forget_channel(&mut self.channels, id).await;
                    }
                }
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let failure = ChannelOpenFailureMessage::decode(&mut r)?;
                let id = failure.recipient_channel;
                match enc.channels.get(&id) {
                    Some(params) if params.state == ChannelState::Opening => {}
                    _ => return Self::unknown_channel(handler, id, message_type).await,
                }
                debug!(
                    "channel {id} refused: {:?} {:?}",
                    failure.reason, failure.description
                );
                enc.channels.remove(&id);
                if let Some(channel) = self.channels.get(&id) {
                    let _ = channel.send(ChannelMsg::OpenFailure {
                        reason: failure.reason,
                        description: failure.description,
                    });
                }
                forget_channel(&mut self.channels, id).await;
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let id = ChannelId::decode(&mut r)?;
                let amount = u32::decode(&mut r)?;
                let Some(new_size) = enc.window_adjusted(id, amount)? else {
                    return Self::unknown_channel(handler, id, message_type).await;
                };
                trace!("channel {id}: window adjusted to {new_size}");
                if let Some(channel) = self.channels.get(&id) {
                    let size = channel.window_size().grow(amount).await;
                    let _ = channel.send(ChannelMsg::WindowAdjusted { new_size: size });
                }
            }
            msg::CHANNEL_DATA | msg::CHANNEL_EXTENDED_DATA => {
                let id = ChannelId::decode(&mut r)?;
                let ext = if message_type == msg::CHANNEL_EXTENDED_DATA {
                    Some(u32::decode(&mut r)?)
                } else {
                    None
                };
                let data = Vec::<u8>::decode(&mut r)?;
                match enc.channels.get(&id) {
                    Some(params) if params.state != ChannelState::Opening => {}
                    _ => return Self::unknown_channel(handler, id, message_type).await,
                }
                enc.adjust_window_size(id, data.len())?;
                if let Some(channel) = self.channels.get(&id) {
                    let data = CryptoVec::from(data);
                    let _ = channel.send(match ext {
                        Some(ext) => ChannelMsg::ExtendedData { data, ext },
                        None => ChannelMsg::Data { data },
                    });
                }
            }
            msg::CHANNEL_EOF => {
                let id = ChannelId::decode(&mut r)?;
                if !enc.channels.contains_key(&id) {
                    return Self::unknown_channel(handler, id, message_type).await;
                }
                if let Some(channel) = self.channels.get(&id) {
                    let _ = channel.send(ChannelMsg::Eof);
                }
            }
            msg::CHANNEL_CLOSE => {
                let id = ChannelId::decode(&mut r)?;
                if !enc.channels.contains_key(&id) {
                    return Self::unknown_channel(handler, id, message_type).await;
                }
                debug!("server closed channel {id}");
                enc.close_received(id)?;
                if let Some(channel) = self.channels.get(&id) {
                    let _ = channel.send(ChannelMsg::Close);
                }
                if !enc.channels.contains_key(&id) {
                    forget_channel(&mut self.channels, id).await;
                }
            }
            msg::CHANNEL_REQUEST => {
                let id = ChannelId::decode(&mut r)?;
                let req = String::decode(&mut r)?;
                let want_reply = u8::decode(&mut r)? != 0;
                let Some(params) = enc.channels.get(&id) else {
                    return Self::unknown_channel(handler, id, message_type).await;
                };
                let recipient_channel = params.recipient_channel;
                let msg = match req.as_str() {
                    "exit-status" => Some(ChannelMsg::ExitStatus {
                        exit_status: u32::decode(&mut r)?,
                    }),
                    "exit-signal" => {
                        let signal_name = Sig::from_name(&String::decode(&mut r)?);
                        let core_dumped = u8::decode(&mut r)? != 0;
                        let error_message = String::decode(&mut r)?;
                        let lang_tag = String::decode(&mut r).unwrap_or_default();
                        Some(ChannelMsg::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        })
                    }
                    "xon-xoff" => Some(ChannelMsg::XonXoff {
                        client_can_do: u8::decode(&mut r)? != 0,
                    }),
                    "keepalive@openssh.com" => None,
                    _ => {
                        info!("unknown channel request {req:?} on channel {id}");
                        None
                    }
                };
                let understood = msg.is_some();
                if let (Some(msg), Some(channel)) = (msg, self.channels.get(&id)) {
                    let _ = channel.send(msg);
                }
                if want_reply {
                    enc.packet(|w| {
                        if understood {
                            msg::CHANNEL_SUCCESS.encode(w)?;
                        } else {
                            msg::CHANNEL_FAILURE.encode(w)?;
                        }
                        recipient_channel.encode(w)?;
                        Ok(())
                    })?;
                }
            }
            msg::CHANNEL_SUCCESS | msg::CHANNEL_FAILURE => {
                let id = ChannelId::decode(&mut r)?;
                let Some(params) = enc.channels.get_mut(&id) else {
                    return Self::unknown_channel(handler, id, message_type).await;
                };
                match params.pending_replies.pop_front() {
                    Some(req) => {
                        trace!("reply to {req} on channel {id}");
                        if let Some(channel) = self.channels.get(&id) {
                            let _ = channel.send(if message_type == msg::CHANNEL_SUCCESS {
                                ChannelMsg::Success
                            } else {
                                ChannelMsg::Failure
                            });
                        }
                    }
                    None => warn!("unsolicited reply {message_type} on channel {id}"),
                }
            }
            msg::CHANNEL_OPEN => {
                let open = OpenChannelMessage::parse(&mut r)?;
                debug!("server opens a {:?} channel", open.typ);
                match open.kind {
                    Some(
                        ref kind @ (ChannelKind::ForwardedTcpip { .. }
                        | ChannelKind::X11 { .. }
                        | ChannelKind::AgentForward),
                    ) => {
                        let id =
                            enc.new_channel(self.config.window_size, self.config.maximum_packet_size);
                        if let Some(params) = enc.channels.get_mut(&id) {
                            params.confirm(
                                open.recipient_channel,
                                open.recipient_window_size,
                                open.recipient_maximum_packet_size,
                            );
                        }
                        let (sender, receiver) = unbounded_channel();
                        let window_size = WindowSizeRef::new(open.recipient_window_size);
                        self.channels
                            .insert(id, ChannelRef::new(sender, window_size.clone()));
                        let channel = Channel::<Msg> {
                            id,
                            sender: self.inbound_channel_sender.clone(),
                            receiver,
                            max_packet_size: open.recipient_maximum_packet_size,
                            window_size,
                        };

                        let accepted = handler
                            .server_channel_open(channel, kind)
                            .await
                            .map_err(RunError::Handler)?;
                        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
                        if accepted {
                            open.confirm(
                                &mut enc.write,
                                id,
                                self.config.window_size,
                                self.config.maximum_packet_size,
                            )?;
                        } else {
                            debug!("handler refused channel {id}");
                            enc.channels.remove(&id);
                            forget_channel(&mut self.channels, id).await;
                            open.fail(
                                &mut enc.write,
                                ChannelOpenFailure::AdministrativelyProhibited,
                                "Refused",
                            )?;
                        }
                    }
                    Some(_) => {
                        // Servers do not get to open sessions on clients.
                        open.fail(
                            &mut enc.write,
                            ChannelOpenFailure::AdministrativelyProhibited,
                            "Not allowed",
                        )?;
                    }
                    None => {
                        open.fail(
                            &mut enc.write,
                            ChannelOpenFailure::UnknownChannelType,
                            "Unknown channel type",
                        )?;
                    }
                }
            }
            msg::GLOBAL_REQUEST => {
                let req = String::decode(&mut r)?;
                let want_reply = u8::decode(&mut r)? != 0;
                debug!("server global request {req:?}");
                if want_reply {
                    enc.packet(|w| {
                        msg::REQUEST_FAILURE.encode(w)?;
                        Ok(())
                    })?;
                }
            }
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                let success = message_type == msg::REQUEST_SUCCESS;
                match self.open_global_requests.pop_front() {
                    Some(GlobalRequestResponse::Keepalive) => {
                        trace!("keepalive answered");
                    }
                    Some(GlobalRequestResponse::TcpIpForward(reply)) => {
                        let result = if success {
                            // The port is only there if we asked for port 0.
                            Some(u32::decode(&mut r).unwrap_or(0))
                        } else {
                            None
                        };
                        let _ = reply.send(result);
                    }
                    Some(GlobalRequestResponse::CancelTcpIpForward(reply)) => {
                        let _ = reply.send(success);
                    }
                    None => {
                        error!("Received global request response for unknown request!")
                    }
                }
            }
            m => {
                debug!("unimplemented connection message {m}");
                enc.packet(|w| {
                    msg::UNIMPLEMENTED.encode(w)?;
                    seqn.encode(w)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// A message from a [`Channel`] handle.
    pub(super) async fn channel_command(&mut self, id: ChannelId, msg: ChannelMsg) -> Result<(), Error> {
        let enc = self.encrypted.as_mut().ok_or(Error::Inconsistent)?;
        match msg {
            ChannelMsg::Data { data } => enc.data(id, None, data)?,
            ChannelMsg::ExtendedData { data, ext } => enc.data(id, Some(ext), data)?,
            ChannelMsg::Eof => enc.eof(id)?,
            ChannelMsg::Close => {
                if enc.close(id)? {
                    forget_channel(&mut self.channels, id).await;
                }
            }
            msg => {
                let Some((req, want_reply)) = msg.request_type() else {
                    debug!("ignoring {msg:?} from the handle of channel {id}");
                    return Ok(());
                };
                let Some(params) = enc.channels.get_mut(&id) else {
                    debug!("request {req} on unknown channel {id}");
                    return Ok(());
                };
                if params.state != ChannelState::Open || params.close_sent {
                    debug!("request {req} on channel {id} in state {:?}", params.state);
                    return Ok(());
                }
                let recipient_channel = params.recipient_channel;
                if want_reply {
                    params.pending_replies.push_back(req);
                }
                enc.packet(|w| {
                    msg::CHANNEL_REQUEST.encode(w)?;
                    recipient_channel.encode(w)?;
                    req.encode(w)?;
                    (want_reply as u8).encode(w)?;
                    msg.encode_request(w)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}
