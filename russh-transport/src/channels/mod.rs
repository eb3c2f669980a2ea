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
use log::{debug, trace};
use russh_cryptovec::CryptoVec;
use ssh_encoding::{Decode, Encode, Reader, Writer};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::{ChannelId, ChannelOpenFailure, Error, Sig};

mod channel_ref;
pub(crate) use channel_ref::{ChannelRef, WindowSizeRef};

/// The kinds of channels that can be opened, with their type-specific
/// open data. https://tools.ietf.org/html/rfc4254#section-5.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// An interactive session: shell, exec or subsystem.
    Session,
    /// A connection to `host_to_connect:port_to_connect`, made by the
    /// server on our behalf.
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
    /// A connection accepted on a port forwarded with
    /// [`crate::client::Handle::tcpip_forward`].
    ForwardedTcpip {
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    /// A connection to a Unix socket on the server.
    DirectStreamLocal { socket_path: String },
    /// A request from the server to reach our authentication agent.
    AgentForward,
}

impl ChannelKind {
    /// The channel type name, as sent in CHANNEL_OPEN.
    pub fn channel_type(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::X11 { .. } => "x11",
            ChannelKind::DirectStreamLocal { .. } => "direct-streamlocal@openssh.com",
            ChannelKind::AgentForward => "auth-agent@openssh.com",
        }
    }

    /// Write the type-specific part of CHANNEL_OPEN.
    pub(crate) fn encode_open<W: Writer>(&self, w: &mut W) -> Result<(), Error> {
        match self {
            ChannelKind::Session | ChannelKind::AgentForward => {}
            ChannelKind::DirectTcpip {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            } => {
                host_to_connect.encode(w)?;
                port_to_connect.encode(w)?;
                originator_address.encode(w)?;
                originator_port.encode(w)?;
            }
            ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                connected_address.encode(w)?;
                connected_port.encode(w)?;
                originator_address.encode(w)?;
                originator_port.encode(w)?;
            }
            ChannelKind::X11 {
                originator_address,
                originator_port,
            } => {
                originator_address.encode(w)?;
                originator_port.encode(w)?;
            }
            ChannelKind::DirectStreamLocal { socket_path } => {
                socket_path.encode(w)?;
                // reserved
                "".encode(w)?;
                0u32.encode(w)?;
            }
        }
        Ok(())
    }

    /// Read the type-specific part of a CHANNEL_OPEN of type `typ`.
    /// Unknown types give `None`.
    pub(crate) fn decode_open<R: Reader>(typ: &str, r: &mut R) -> Result<Option<Self>, Error> {
        Ok(Some(match typ {
            "session" => ChannelKind::Session,
            "direct-tcpip" => ChannelKind::DirectTcpip {
                host_to_connect: String::decode(r)?,
                port_to_connect: u32::decode(r)?,
                originator_address: String::decode(r)?,
                originator_port: u32::decode(r)?,
            },
            "forwarded-tcpip" => ChannelKind::ForwardedTcpip {
                connected_address: String::decode(r)?,
                connected_port: u32::decode(r)?,
                originator_address: String::decode(r)?,
                originator_port: u32::decode(r)?,
            },
            "x11" => ChannelKind::X11 {
                originator_address: String::decode(r)?,
                originator_port: u32::decode(r)?,
            },
            "direct-streamlocal@openssh.com" => ChannelKind::DirectStreamLocal {
                socket_path: String::decode(r)?,
            },
            "auth-agent@openssh.com" => ChannelKind::AgentForward,
            _ => return Ok(None),
        }))
    }
}

#[derive(Debug)]
#[non_exhaustive]
/// Possible messages that [Channel::wait] can receive.
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    /// The server refused to open the channel.
    OpenFailure {
        reason: ChannelOpenFailure,
        description: String,
    },
    Data {
        data: CryptoVec,
    },
    ExtendedData {
        data: CryptoVec,
        ext: u32,
    },
    Eof,
    Close,
    /// (client only)
    RequestPty {
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        /// Opcode and argument pairs, https://tools.ietf.org/html/rfc4254#section-8
        terminal_modes: Vec<(u8, u32)>,
    },
    /// (client only)
    RequestShell {
        want_reply: bool,
    },
    /// (client only)
    Exec {
        want_reply: bool,
        command: Vec<u8>,
    },
    /// (client only)
    Signal {
        signal: Sig,
    },
    /// (client only)
    RequestSubsystem {
        want_reply: bool,
        name: String,
    },
    /// (client only)
    RequestX11 {
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
    },
    /// (client only)
    SetEnv {
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    /// (client only)
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    /// (client only)
    AgentForward {
        want_reply: bool,
    },

    /// (server only)
    XonXoff {
        client_can_do: bool,
    },
    /// (server only)
    ExitStatus {
        exit_status: u32,
    },
    /// (server only)
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    /// (server only)
    WindowAdjusted {
        new_size: u32,
    },
    /// Reply to the oldest pending request sent with `want_reply`.
    Success,
    /// Reply to the oldest pending request sent with `want_reply`.
    Failure,
}

impl ChannelMsg {
    /// The CHANNEL_REQUEST type of the client request messages, and
    /// whether the server should reply.
    pub(crate) fn request_type(&self) -> Option<(&'static str, bool)> {
        Some(match self {
            ChannelMsg::RequestPty { want_reply, .. } => ("pty-req", *want_reply),
            ChannelMsg::RequestShell { want_reply } => ("shell", *want_reply),
            ChannelMsg::Exec { want_reply, .. } => ("exec", *want_reply),
            ChannelMsg::Signal { .. } => ("signal", false),
            ChannelMsg::RequestSubsystem { want_reply, .. } => ("subsystem", *want_reply),
            ChannelMsg::RequestX11 { want_reply, .. } => ("x11-req", *want_reply),
            ChannelMsg::SetEnv { want_reply, .. } => ("env", *want_reply),
            ChannelMsg::WindowChange { .. } => ("window-change", false),
            ChannelMsg::AgentForward { want_reply } => ("auth-agent-req@openssh.com", *want_reply),
            _ => return None,
        })
    }

    /// Write the request-specific part of a CHANNEL_REQUEST.
    pub(crate) fn encode_request<W: Writer>(&self, w: &mut W) -> Result<(), Error> {
        match self {
            ChannelMsg::RequestPty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
                ..
            } => {
                term.encode(w)?;
                col_width.encode(w)?;
                row_height.encode(w)?;
                pix_width.encode(w)?;
                pix_height.encode(w)?;
                let mut modes = Vec::with_capacity(terminal_modes.len() * 5 + 1);
                for (opcode, value) in terminal_modes {
                    // TTY_OP_END is implied.
                    if *opcode == 0 || *opcode > 159 {
                        continue;
                    }
                    modes.push(*opcode);
                    modes.extend(value.to_be_bytes());
                }
                modes.push(0);
                modes.encode(w)?;
            }
            ChannelMsg::Exec { command, .. } => command.encode(w)?,
            ChannelMsg::Signal { signal } => signal.name().encode(w)?,
            ChannelMsg::RequestSubsystem { name, .. } => name.encode(w)?,
            ChannelMsg::RequestX11 {
                single_connection,
                x11_authentication_protocol,
                x11_authentication_cookie,
                x11_screen_number,
                ..
            } => {
                (*single_connection as u8).encode(w)?;
                x11_authentication_protocol.encode(w)?;
                x11_authentication_cookie.encode(w)?;
                x11_screen_number.encode(w)?;
            }
            ChannelMsg::SetEnv {
                variable_name,
                variable_value,
                ..
            } => {
                variable_name.encode(w)?;
                variable_value.encode(w)?;
            }
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                col_width.encode(w)?;
                row_height.encode(w)?;
                pix_width.encode(w)?;
                pix_height.encode(w)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// A handle to a session channel.
///
/// Allows you to read and write from a channel without borrowing the session
pub struct Channel<Send: From<(ChannelId, ChannelMsg)>> {
    pub(crate) id: ChannelId,
    pub(crate) sender: Sender<Send>,
    pub(crate) receiver: UnboundedReceiver<ChannelMsg>,
    pub(crate) max_packet_size: u32,
    pub(crate) window_size: WindowSizeRef,
}

impl<T: From<(ChannelId, ChannelMsg)>> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + 'static> Channel<S> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The largest payload the server accepts in one data message.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// What is left of the server's window.
    pub async fn window_size(&self) -> u32 {
        self.window_size.size().await
    }

    /// Request a pseudo-terminal with the given characteristics.
    #[allow(clippy::too_many_arguments)] // length checked
    pub async fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestPty {
            want_reply,
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes: terminal_modes.to_vec(),
        })
        .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestShell { want_reply }).await
    }

    /// Execute a remote program (will be passed to a shell). This can
    /// be used to implement scp (by calling a remote scp and
    /// tunneling to its standard input).
    pub async fn exec<A: Into<Vec<u8>>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Exec {
            want_reply,
            command: command.into(),
        })
        .await
    }

    /// Signal a remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Signal { signal }).await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestSubsystem {
            want_reply,
            name: name.into(),
        })
        .await
    }

    /// Request X11 forwarding through an already opened X11
    /// channel. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: A,
        x11_authentication_cookie: B,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestX11 {
            want_reply,
            single_connection,
            x11_authentication_protocol: x11_authentication_protocol.into(),
            x11_authentication_cookie: x11_authentication_cookie.into(),
            x11_screen_number,
        })
        .await
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::SetEnv {
            want_reply,
            variable_name: variable_name.into(),
            variable_value: variable_value.into(),
        })
        .await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        })
        .await
    }

    /// Inform the server that we will accept agent forwarding channels
    pub async fn agent_forward(&self, want_reply: bool) -> Result<(), Error> {
        self.send_msg(ChannelMsg::AgentForward { want_reply }).await
    }

    /// Send data to a channel, until `data` reaches EOF.
    pub async fn data<R: AsyncReadExt + Unpin>(&self, data: R) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send extended data (e.g. stderr, `ext == 1`) to a channel.
    pub async fn extended_data<R: AsyncReadExt + Unpin>(
        &self,
        ext: u32,
        data: R,
    ) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R: AsyncReadExt + Unpin>(
        &self,
        ext: Option<u32>,
        mut data: R,
    ) -> Result<(), Error> {
        let mut buf = CryptoVec::new_zeroed(self.max_packet_size.max(1) as usize);
        let mut total = 0;
        loop {
            let n = data.read(&mut buf[..]).await?;
            if n == 0 {
                break;
            }
            let mut chunk = buf.get(..n).ok_or(Error::IndexOutOfBounds)?;
            while !chunk.is_empty() {
                // Suspends until the server opens the window.
                let allowed = self.window_size.reserve(chunk.len() as u32).await? as usize;
                let (now, later) = chunk.split_at(allowed.min(chunk.len()));
                trace!("sending {} bytes on {:?}", now.len(), self.id);
                self.send_data_packet(ext, CryptoVec::from_slice(now))
                    .await?;
                chunk = later;
            }
            total += n;
        }
        debug!("sent {total} bytes on {:?}", self.id);
        Ok(())
    }

    async fn send_data_packet(&self, ext: Option<u32>, data: CryptoVec) -> Result<(), Error> {
        self.send_msg(if let Some(ext) = ext {
            ChannelMsg::ExtendedData { ext, data }
        } else {
            ChannelMsg::Data { data }
        })
        .await
    }

    pub async fn eof(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Eof).await
    }

    /// Wait for the next message from the server. `None` once the
    /// channel is closed on both sides, or the session is gone.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        self.receiver.recv().await
    }

    async fn send_msg(&self, msg: ChannelMsg) -> Result<(), Error> {
        self.sender
            .send((self.id, msg).into())
            .await
            .map_err(|_| Error::SendError)
    }

    /// Request that the channel be closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Close).await
    }
}
