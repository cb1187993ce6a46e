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
use std::net::SocketAddr;

use crate::{ChannelId, ChannelOpenFailure, Error};

/// How a channel came to be connected, as reported by
/// [`EventHandler::channel_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    /// A local listener accepted a connection and tunneled it.
    LocalForward,
    /// The peer forwarded a connection on a port we asked for.
    RemoteForward,
    /// The peer asked us to connect somewhere directly.
    Direct,
    Session,
    X11,
    Other,
}

/// Everything known about a channel-open request we refused or
/// could not satisfy.
#[derive(Debug, Clone)]
pub struct OpenFailureContext {
    pub channel_type: String,
    pub target_address: String,
    pub target_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    pub reason: ChannelOpenFailure,
    pub description: String,
}

/// A connection about to be tunneled through a forward.
#[derive(Debug, Clone)]
pub struct ForwardConnect {
    /// The address the connection was accepted on, for local
    /// forwards, or the address the peer listened on, for remote ones.
    pub listen_address: String,
    pub listen_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    pub kind: ConnectKind,
}

impl ForwardConnect {
    pub(crate) fn local(listen: SocketAddr, origin: SocketAddr) -> Self {
        ForwardConnect {
            listen_address: listen.ip().to_string(),
            listen_port: listen.port() as u32,
            originator_address: origin.ip().to_string(),
            originator_port: origin.port() as u32,
            kind: ConnectKind::LocalForward,
        }
    }
}

/// Observer of everything that happens on a connection's channels.
///
/// All methods have a default implementation that does nothing (and
/// accepts every forwarded connection). They are called from the
/// task that caused the event, and must not block.
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync {
    /// A channel was registered in the connection's table.
    fn channel_added(&self, id: ChannelId) {}

    /// A channel's slot was released.
    fn channel_deleted(&self, id: ChannelId) {}

    /// A channel was confirmed by both sides.
    fn channel_connected(&self, id: ChannelId, kind: ConnectKind) {}

    /// The peer closed a channel.
    fn channel_closed(&self, id: ChannelId) {}

    /// We refused (or failed to satisfy) a channel-open from the peer.
    fn local_open_failure(&self, context: &OpenFailureContext) {}

    /// The peer refused one of our channel-open requests.
    fn remote_open_failure(&self, id: ChannelId, reason: ChannelOpenFailure, description: &str) {}

    /// Decide whether to tunnel a forwarded connection. Returning
    /// `false` rejects it.
    fn forward_connect(&self, connect: &ForwardConnect) -> bool {
        true
    }

    /// The peer opened an X11 channel.
    fn x11_connect(&self, id: ChannelId, originator_address: &str, originator_port: u32) {}

    /// The connection is being torn down because of `error`.
    fn fatal_error(&self, error: &Error) {}
}

/// An [`EventHandler`] that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
