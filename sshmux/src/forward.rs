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

//! Port forwarding in both directions.
//!
//! *Remote* forwards are ports the peer listens on: each connection
//! it accepts arrives as a `forwarded-tcpip` channel, connected here
//! to a [`ForwardTarget`]. *Local* forwards are listeners on this
//! side, each accepted socket being tunneled through a new
//! `direct-tcpip` channel.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::channels::{ChannelIo, ChannelKind, ChannelOrigin, StreamFilter};
use crate::connection::Shared;
use crate::{ChannelType, Error, ForwardConnect, TcpChannelInfo};

/// Builds a fresh filter for each connection of a forward.
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn StreamFilter> + Send + Sync>;

/// Where the connections of a remote forward end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    Tcp { host: String, port: u32 },
    /// Each connection is handed to a new instance of `program`, on
    /// its standard input and output.
    Command { program: String, args: Vec<String> },
}

impl ForwardTarget {
    pub(crate) async fn connect(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(ChannelIo, ChannelKind), Error> {
        match self {
            ForwardTarget::Tcp { host, port } => {
                let stream = connect_tcp(host, *port, timeout).await?;
                Ok((ChannelIo::from_stream(stream), ChannelKind::Stream))
            }
            ForwardTarget::Command { program, args } => {
                let (io, child) = spawn_command(program, args)?;
                Ok((io, ChannelKind::Process(Mutex::new(child))))
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct RemoteForward {
    pub target: ForwardTarget,
    pub filter: Option<FilterFactory>,
}

impl Debug for RemoteForward {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteForward")
            .field("target", &self.target)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

pub(crate) async fn connect_tcp(
    host: &str,
    port: u32,
    timeout: Option<Duration>,
) -> Result<TcpStream, Error> {
    let port = u16::try_from(port).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid port {}", port),
        )
    })?;
    debug!("connecting to {}:{}", host, port);
    let connect = TcpStream::connect((host, port));
    let stream = match timeout {
        Some(t) => tokio::time::timeout(t, connect).await??,
        None => connect.await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Starts `program`. What it writes on its standard output is sent on
/// the channel, what the channel receives goes to its standard input.
pub(crate) fn spawn_command(program: &str, args: &[String]) -> Result<(ChannelIo, Child), Error> {
    debug!("spawning {:?} {:?}", program, args);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child.stdin.take().ok_or(Error::Inconsistent)?;
    let stdout = child.stdout.take().ok_or(Error::Inconsistent)?;
    Ok((ChannelIo::new(stdout, stdin), child))
}

/// A listener tunneling the connections it accepts. Dropping it stops
/// listening; channels already open are left alone.
pub(crate) struct LocalForward {
    task: JoinHandle<()>,
}

impl LocalForward {
    /// Returns the address actually bound, which differs from
    /// `listen` if its port is 0.
    pub async fn bind(
        listen: SocketAddr,
        shared: Weak<Shared>,
        host: String,
        port: u32,
    ) -> Result<(SocketAddr, Self), Error> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        info!("forwarding {} to {}:{}", local, host, port);
        let task = tokio::spawn(accept_loop(listener, local, shared, host, port));
        Ok((local, LocalForward { task }))
    }
}

impl Drop for LocalForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: SocketAddr,
    shared: Weak<Shared>,
    host: String,
    port: u32,
) {
    loop {
        let (socket, origin) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("forward {}: accept failed: {}", local, e);
                break;
            }
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared
            .handler
            .forward_connect(&ForwardConnect::local(local, origin))
        {
            debug!("forward {}: connection from {} refused", local, origin);
            continue;
        }
        if let Err(e) = socket.set_nodelay(true) {
            debug!("forward {}: {}", local, e);
        }
        let info = TcpChannelInfo {
            host_to_connect: host.clone(),
            port_to_connect: port,
            originator_address: origin.ip().to_string(),
            originator_port: origin.port() as u32,
        };
        let opened = shared.open_channel(
            ChannelType::DirectTcpip(info),
            ChannelOrigin::ForwardListener,
            ChannelIo::from_stream(socket),
            ChannelKind::Stream,
        );
        if let Err(e) = opened {
            warn!("forward {}: could not open channel: {}", local, e);
            if shared.escalate(e).await.disconnect_reason().is_some() {
                break;
            }
        }
    }
    debug!("forward {}: listener stopped", local);
}
