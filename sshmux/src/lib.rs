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

//! The connection protocol of SSH2
//! ([RFC4254](https://tools.ietf.org/html/rfc4254)), on top of an
//! already established transport.
//!
//! Everything below the connection protocol (key exchange,
//! encryption, packet framing, authentication) is somebody else's
//! job: this crate is handed decoded [`Message`]s and hands encoded
//! ones back through a [`Transport`].
//!
//! # Overview
//!
//! A [`Connection`] multiplexes many *channels* over one transport.
//! Each channel is an independently flow-controlled duplex byte
//! stream: interactive sessions ([`SessionChannel`]), TCP forwards in
//! both directions, and X11 forwards.
//!
//! The event loop feeding the connection typically looks like this:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshmux::{Config, Connection, Message, NoopHandler, PacketQueue};
//!
//! # async fn run(mut incoming: tokio::sync::mpsc::Receiver<Message>) -> Result<(), sshmux::Error> {
//! let (transport, mut outgoing) = PacketQueue::new(Config::default());
//! let connection = Connection::new(Arc::new(transport), Arc::new(NoopHandler))?;
//!
//! tokio::spawn(async move {
//!     while let Some(msg) = outgoing.recv().await {
//!         // encrypt and write `msg` to the socket.
//!         # drop(msg);
//!     }
//! });
//!
//! while let Some(msg) = incoming.recv().await {
//!     connection.handle_message(msg).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Threads of control
//!
//! Messages addressed to a channel are processed on the caller of
//! [`Connection::handle_message`]. Channel-open requests coming from
//! the peer are resolved on a separate background task, so that a
//! slow local `connect` never holds up traffic on other channels.
//! Each stream channel additionally owns a task reading its local
//! input and pushing it to the peer as the window allows.

use std::fmt::{Debug, Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

mod msg;

pub mod wire;
pub use wire::{Message, MessageReader};

mod parsing;
pub use parsing::{ChannelType, TcpChannelInfo};

mod config;
pub use config::Config;

mod transport;
pub use transport::{PacketQueue, Transport};

mod handler;
pub use handler::{ConnectKind, EventHandler, ForwardConnect, NoopHandler, OpenFailureContext};

pub mod channels;
pub use channels::{
    Channel, ChannelInfo, ChannelIo, ChannelOrigin, ExitStatus, OpenStatus, SessionChannel,
    StreamFilter,
};

mod table;

mod connection;
pub use connection::Connection;

mod connector;

pub mod forward;
pub use forward::{FilterFactory, ForwardTarget};

pub mod x11;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum Error {
    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Message received for a channel id that was never allocated.
    #[error("Channel {0} not open")]
    WrongChannel(ChannelId),

    /// The peer refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The peer sent more data than the window we advertised.
    #[error("Window exceeded on channel {channel} by {excess} bytes")]
    WindowExceeded { channel: ChannelId, excess: u64 },

    /// The channel table reached its hard limit.
    #[error("Too many channels")]
    TooManyChannels,

    /// The peer opened a forwarded channel we never asked for.
    #[error("Unsolicited forward attempted ({address}:{port})")]
    UnsolicitedForward { address: String, port: u32 },

    #[error("The request was rejected by the other party")]
    RequestDenied,

    /// The transport is gone.
    #[error("Disconnected")]
    Disconnect,

    #[error("Channel send error")]
    SendError,

    /// A stream filter refused the data flowing through it.
    #[error("Filter: {0}")]
    Filter(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid X11 display: {0}")]
    InvalidDisplay(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

impl Error {
    /// The reason sent to the peer if this error ends the connection,
    /// or `None` if it is contained within a single channel.
    pub fn disconnect_reason(&self) -> Option<Disconnect> {
        match self {
            Error::Inconsistent
            | Error::WrongChannel(_)
            | Error::WindowExceeded { .. }
            | Error::SshEncoding(_)
            | Error::Utf8(_) => Some(Disconnect::ProtocolError),
            Error::TooManyChannels => Some(Disconnect::TooManyConnections),
            _ => None,
        }
    }
}

/// A reason for disconnection.
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

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }

    /// POSIX signal number, where one is standardised.
    pub fn number(&self) -> Option<i32> {
        Some(match *self {
            Sig::HUP => 1,
            Sig::INT => 2,
            Sig::QUIT => 3,
            Sig::ILL => 4,
            Sig::ABRT => 6,
            Sig::FPE => 8,
            Sig::KILL => 9,
            Sig::USR1 => 10,
            Sig::SEGV => 11,
            Sig::PIPE => 13,
            Sig::ALRM => 14,
            Sig::TERM => 15,
            Sig::Custom(_) => return None,
        })
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
///
/// The low 16 bits index the connection's channel table, the high 16
/// bits count how many times that slot has been reused.
pub struct ChannelId(pub(crate) u32);

impl ChannelId {
    pub(crate) fn new(index: usize, generation: u16) -> Self {
        ChannelId(((generation as u32) << 16) | (index as u32 & 0xffff))
    }

    /// Slot of this channel in the connection's table.
    pub fn index(&self) -> usize {
        (self.0 & 0xffff) as usize
    }

    pub fn generation(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl From<u32> for ChannelId {
    fn from(c: u32) -> ChannelId {
        ChannelId(c)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locks a mutex, ignoring poisoning: every critical section in this
/// crate leaves its data consistent before anything can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
