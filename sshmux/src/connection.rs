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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use data_encoding::HEXLOWER_PERMISSIVE;
use log::{debug, error, info, trace, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channels::{
    Channel, ChannelInfo, ChannelIo, ChannelKind, ChannelOrigin, SessionChannel, SessionState,
};
use crate::connector::{self, Connector};
use crate::forward::{FilterFactory, ForwardTarget, LocalForward, RemoteForward};
use crate::parsing::{ChannelOpenConfirmation, ChannelOpenFailureMessage};
use crate::table::{ChannelTable, Lookup};
use crate::wire::{Message, MessageReader};
use crate::x11::{X11Display, X11State};
use crate::{
    lock, msg, ChannelId, ChannelType, Config, Disconnect, Error, EventHandler, TcpChannelInfo,
    Transport,
};

type GlobalReply = Option<Vec<u8>>;

/// State of a connection, shared by its handles, its channels (weakly)
/// and its background tasks (weakly).
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handler: Arc<dyn EventHandler>,
    table: Mutex<ChannelTable<Arc<Channel>>>,
    /// Keyed by the address and port the peer listens on.
    pub(crate) remote_forwards: Mutex<HashMap<(String, u32), RemoteForward>>,
    local_forwards: Mutex<HashMap<SocketAddr, LocalForward>>,
    /// Held for as long as a global request is waiting for its reply.
    global_gate: tokio::sync::Mutex<()>,
    global_pending: Mutex<Option<oneshot::Sender<GlobalReply>>>,
    pub(crate) x11: Mutex<X11State>,
    connector: Connector,
    fatal: AtomicBool,
    reaper: Option<JoinHandle<()>>,
}

impl Shared {
    fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Shared>| {
            let reaper = config
                .deferred_deletion
                .then(|| tokio::spawn(reap(weak.clone(), config.reaper_interval)));
            Shared {
                table: Mutex::new(ChannelTable::new(
                    config.table_increment,
                    config.max_channels,
                )),
                config,
                transport,
                handler,
                remote_forwards: Mutex::new(HashMap::new()),
                local_forwards: Mutex::new(HashMap::new()),
                global_gate: tokio::sync::Mutex::new(()),
                global_pending: Mutex::new(None),
                x11: Mutex::new(X11State::new()),
                connector: Connector::spawn(weak.clone()),
                fatal: AtomicBool::new(false),
                reaper,
            }
        })
    }

    /// Allocates an id for a new channel and adds it to the table.
    pub(crate) fn register(
        self: &Arc<Self>,
        channel_type: &str,
        origin: ChannelOrigin,
        io: ChannelIo,
        kind: ChannelKind,
    ) -> Result<Arc<Channel>, Error> {
        let channel = lock(&self.table).insert_with(|id| {
            Arc::new(Channel::new(id, self, channel_type, origin, io, kind))
        })?;
        debug!("channel {}: added ({})", channel.id(), channel_type);
        self.handler.channel_added(channel.id());
        Ok(channel)
    }

    /// Registers a channel and asks the peer to open its end.
    pub(crate) fn open_channel(
        self: &Arc<Self>,
        typ: ChannelType,
        origin: ChannelOrigin,
        io: ChannelIo,
        kind: ChannelKind,
    ) -> Result<Arc<Channel>, Error> {
        let channel = self.register(typ.name(), origin, io, kind)?;
        let sent = self
            .open_message(&typ, channel.id())
            .and_then(|m| self.transport.transmit(m));
        if let Err(e) = sent {
            channel.abandon();
            return Err(e);
        }
        Ok(channel)
    }

    fn open_message(&self, typ: &ChannelType, id: ChannelId) -> Result<Message, Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let mut m = Message::new(msg::CHANNEL_OPEN);
        m.write_string(typ.name())?
            .write_u32(id.into())?
            .write_u32(self.config.window_size)?
            .write_u32(self.config.maximum_packet_size)?;
        match typ {
            ChannelType::DirectTcpip(info) | ChannelType::ForwardedTcpIp(info) => {
                info.write(&mut m)?
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                m.write_string(originator_address)?
                    .write_u32(*originator_port)?;
            }
            _ => {}
        }
        Ok(m)
    }

    /// Called once per channel, when both sides closed it.
    pub(crate) fn release_channel(&self, id: ChannelId) {
        if self.config.deferred_deletion {
            debug!("channel {}: deletion deferred", id);
            lock(&self.table).defer(id, Instant::now() + self.config.deletion_grace);
            return;
        }
        let removed = lock(&self.table).remove(id);
        if removed.is_some() {
            debug!("channel {}: deleted", id);
            self.handler.channel_deleted(id);
        }
    }

    /// The channel a message is addressed to. Messages for channels
    /// that are gone, or whose slot was reused, yield `None`.
    fn lookup(&self, id: ChannelId) -> Result<Option<Arc<Channel>>, Error> {
        match lock(&self.table).get(id) {
            Lookup::Live(channel) if !channel.is_deleted() => Ok(Some(channel.clone())),
            Lookup::Live(_) | Lookup::Stale => {
                debug!("channel {}: message for a closed channel, dropped", id);
                Ok(None)
            }
            Lookup::Unknown => Err(Error::WrongChannel(id)),
        }
    }

    fn live_channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.table)
            .entries()
            .into_iter()
            .filter(|c| !c.is_deleted())
            .collect()
    }

    /// Tears the connection down if `error` calls for it. Returns
    /// `error` for the caller to report.
    pub(crate) async fn escalate(&self, error: Error) -> Error {
        if let Some(reason) = error.disconnect_reason() {
            self.fatal(reason, &error).await;
        }
        error
    }

    async fn fatal(&self, reason: Disconnect, error: &Error) {
        if self.fatal.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("fatal error, disconnecting: {}", error);
        self.transport.fatal_disconnect(reason, &error.to_string());
        self.handler.fatal_error(error);
        lock(&self.global_pending).take();
        self.connector.stop();
        for channel in self.live_channels() {
            channel.recv_close().await;
        }
        // Last: this may be running on one of the listeners' tasks.
        let forwards = std::mem::take(&mut *lock(&self.local_forwards));
        drop(forwards);
    }

    async fn global_request<F>(&self, name: &str, body: F) -> Result<GlobalReply, Error>
    where
        F: FnOnce(&mut Message) -> Result<(), Error>,
    {
        let _gate = self.global_gate.lock().await;
        let mut m = Message::new(msg::GLOBAL_REQUEST);
        m.write_string(name)?.write_bool(true);
        body(&mut m)?;
        let (sender, receiver) = oneshot::channel();
        *lock(&self.global_pending) = Some(sender);
        if self.fatal.load(Ordering::Acquire) {
            lock(&self.global_pending).take();
            return Err(Error::Disconnect);
        }
        if let Err(e) = self.transport.transmit(m) {
            lock(&self.global_pending).take();
            return Err(e);
        }
        debug!("global request {:?} sent", name);
        receiver.await.map_err(|_| Error::Disconnect)
    }

    fn global_reply(&self, reply: GlobalReply) {
        match lock(&self.global_pending).take() {
            Some(pending) => {
                let _ = pending.send(reply);
            }
            None => error!("global request reply, but nothing is pending"),
        }
    }

    fn global_request_received(&self, r: &mut MessageReader) -> Result<(), Error> {
        let name = r.read_string()?;
        let want_reply = r.read_bool()?;
        let accepted = match name.as_str() {
            "keepalive@openssh.com" => {
                trace!("keepalive received");
                true
            }
            _ => {
                info!("unhandled global request {:?}", name);
                false
            }
        };
        if want_reply {
            let reply = if accepted {
                msg::REQUEST_SUCCESS
            } else {
                msg::REQUEST_FAILURE
            };
            self.transport.transmit(Message::new(reply))?;
        }
        Ok(())
    }

    pub(crate) fn x11_grant(&self, owner: ChannelId, single: bool) -> String {
        lock(&self.x11).grant(owner, single)
    }

    pub(crate) fn x11_release(&self, owner: ChannelId) {
        lock(&self.x11).release(owner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
    }
}

async fn reap(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let freed = lock(&shared.table).reap(Instant::now());
        for id in freed {
            debug!("channel {}: deleted", id);
            shared.handler.channel_deleted(id);
        }
    }
}

/// The channel layer of one SSH connection.
///
/// Cloning a `Connection` gives another handle on the same channels.
/// It must be created, and used, within a tokio runtime.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, Error> {
        let config = transport.config().clone().validated()?;
        Ok(Connection {
            shared: Shared::new(config, transport, handler),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Processes one message from the peer.
    ///
    /// Errors that break the protocol (see
    /// [`Error::disconnect_reason`]) disconnect the whole connection
    /// before being returned.
    pub async fn handle_message(&self, m: Message) -> Result<(), Error> {
        match self.dispatch(m).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.shared.escalate(e).await),
        }
    }

    async fn dispatch(&self, m: Message) -> Result<(), Error> {
        let msg_type = m.msg_type();
        trace!("received {:?}", m);
        if msg_type == msg::CHANNEL_OPEN {
            return match self.shared.connector.submit(m) {
                Ok(()) => Ok(()),
                Err(m) => connector::refuse_stopped(&self.shared, &m),
            };
        }
        let mut r = m.reader();
        match msg_type {
            msg::GLOBAL_REQUEST => self.shared.global_request_received(&mut r),
            msg::REQUEST_SUCCESS => {
                self.shared.global_reply(Some(r.remaining().to_vec()));
                Ok(())
            }
            msg::REQUEST_FAILURE => {
                self.shared.global_reply(None);
                Ok(())
            }
            t if msg::is_channel_message(t) => self.channel_message(t, &mut r).await,
            t => {
                debug!("unhandled message type {}", t);
                Ok(())
            }
        }
    }

    async fn channel_message(&self, msg_type: u8, r: &mut MessageReader<'_>) -> Result<(), Error> {
        let id = ChannelId(r.read_u32()?);
        let Some(channel) = self.shared.lookup(id)? else {
            return Ok(());
        };
        match msg_type {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let c = ChannelOpenConfirmation::parse(r)?;
                channel.open_confirmation(
                    c.sender_channel,
                    c.initial_window_size,
                    c.maximum_packet_size,
                )
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let f = ChannelOpenFailureMessage::parse(r)?;
                channel.open_failure(f.reason, &f.description).await
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                channel.window_adjust(r.read_u32()?);
                Ok(())
            }
            msg::CHANNEL_DATA => channel.data(None, r.read_bytes()?).await,
            msg::CHANNEL_EXTENDED_DATA => {
                let ext = r.read_u32()?;
                channel.data(Some(ext), r.read_bytes()?).await
            }
            msg::CHANNEL_EOF => {
                channel.recv_eof().await;
                Ok(())
            }
            msg::CHANNEL_CLOSE => {
                channel.recv_close().await;
                Ok(())
            }
            msg::CHANNEL_REQUEST => channel.handle_request(r),
            msg::CHANNEL_SUCCESS => {
                channel.request_reply(true);
                Ok(())
            }
            msg::CHANNEL_FAILURE => {
                channel.request_reply(false);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn open(
        &self,
        typ: ChannelType,
        io: ChannelIo,
        kind: ChannelKind,
    ) -> Result<Arc<Channel>, Error> {
        match self
            .shared
            .open_channel(typ, ChannelOrigin::Internal, io, kind)
        {
            Ok(channel) => Ok(channel),
            Err(e) => Err(self.shared.escalate(e).await),
        }
    }

    /// Opens a session channel. Use [`Channel::open_status`] to wait
    /// for the peer's answer.
    pub async fn open_session(&self, io: ChannelIo) -> Result<SessionChannel, Error> {
        let channel = self
            .open(
                ChannelType::Session,
                io,
                ChannelKind::Session(SessionState::new()),
            )
            .await?;
        Ok(SessionChannel::new(channel))
    }

    /// Asks the peer to connect to `host:port`, and tunnels `io` there.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
        io: ChannelIo,
    ) -> Result<Arc<Channel>, Error> {
        let info = TcpChannelInfo {
            host_to_connect: host.to_string(),
            port_to_connect: port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.open(ChannelType::DirectTcpip(info), io, ChannelKind::Stream)
            .await
    }

    /// Asks the peer to listen on `address:port`, and to forward the
    /// connections it accepts to `target`. Returns the port actually
    /// bound, which the peer chooses if `port` is 0.
    ///
    /// With a fixed port, connections the peer forwards before its
    /// reply arrives are accepted. With port 0 they are refused as
    /// unsolicited: the bound port is only known from the reply.
    pub async fn request_remote_forward(
        &self,
        address: &str,
        port: u32,
        target: ForwardTarget,
        filter: Option<FilterFactory>,
    ) -> Result<u32, Error> {
        let key = (address.to_string(), port);
        // Registered before the request goes out, under the port asked
        // for. Re-keyed below if the peer picked one.
        lock(&self.shared.remote_forwards).insert(key.clone(), RemoteForward { target, filter });
        let reply = self
            .shared
            .global_request("tcpip-forward", |m| {
                m.write_string(address)?.write_u32(port)?;
                Ok(())
            })
            .await;
        let bound = match reply {
            Ok(Some(data)) if port == 0 => MessageReader::new(&data).read_u32(),
            Ok(Some(_)) => Ok(port),
            Ok(None) => Err(Error::RequestDenied),
            Err(e) => Err(e),
        };
        let mut forwards = lock(&self.shared.remote_forwards);
        match bound {
            Ok(bound) => {
                if bound != port {
                    if let Some(forward) = forwards.remove(&key) {
                        forwards.insert((address.to_string(), bound), forward);
                    }
                }
                info!("remote forward {}:{} established", address, bound);
                Ok(bound)
            }
            Err(e) => {
                warn!("remote forward {}:{} failed: {}", address, port, e);
                forwards.remove(&key);
                Err(e)
            }
        }
    }

    /// Stops a remote forward. Returns whether the peer acknowledged.
    pub async fn cancel_remote_forward(&self, address: &str, port: u32) -> Result<bool, Error> {
        let reply = self
            .shared
            .global_request("cancel-tcpip-forward", |m| {
                m.write_string(address)?.write_u32(port)?;
                Ok(())
            })
            .await;
        lock(&self.shared.remote_forwards).remove(&(address.to_string(), port));
        Ok(reply?.is_some())
    }

    /// Listens on `listen`, and tunnels each connection to
    /// `host:port` on the peer's side. Returns the address bound.
    pub async fn start_local_forward(
        &self,
        listen: SocketAddr,
        host: &str,
        port: u32,
    ) -> Result<SocketAddr, Error> {
        let (local, forward) =
            LocalForward::bind(listen, Arc::downgrade(&self.shared), host.to_string(), port)
                .await?;
        lock(&self.shared.local_forwards).insert(local, forward);
        Ok(local)
    }

    /// Stops listening on `local`. Returns `false` if there was no
    /// such forward.
    pub fn stop_local_forward(&self, local: SocketAddr) -> bool {
        lock(&self.shared.local_forwards).remove(&local).is_some()
    }

    /// Sends a keepalive the peer does not have to answer.
    pub fn send_keepalive(&self) -> Result<(), Error> {
        let mut m = Message::new(msg::GLOBAL_REQUEST);
        m.write_string("keepalive@openssh.com")?.write_bool(false);
        self.shared.transport.transmit(m)
    }

    /// Sets the display X11 connections from the peer are forwarded to.
    pub fn set_x11_display(&self, display: &str) -> Result<(), Error> {
        let display = X11Display::parse(display)?;
        lock(&self.shared.x11).set_display(display);
        Ok(())
    }

    /// Sets the authentication cookie of the local display, as
    /// printed by `xauth list`.
    pub fn x11_real_cookie(&self, hex: &str) -> Result<(), Error> {
        let cookie = HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("X11 cookie: {}", e)))?;
        lock(&self.shared.x11).set_real_cookie(cookie);
        Ok(())
    }

    /// The cookie handed to the peer instead of the real one.
    pub fn x11_fake_cookie(&self) -> String {
        lock(&self.shared.x11).fake_cookie()
    }

    /// A channel still in the table.
    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        match lock(&self.shared.table).get(id) {
            Lookup::Live(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        lock(&self.shared.table)
            .entries()
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Number of allocated channel ids, deferred deletions included.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared.table).len()
    }

    pub async fn close_all(&self) {
        let channels = self.shared.live_channels();
        futures::future::join_all(channels.iter().map(|c| c.close())).await;
    }

    /// Stops the background work: the connector, and the local
    /// forwarding listeners. Channels are left alone.
    pub fn stop(&self) {
        self.shared.connector.stop();
        lock(&self.shared.local_forwards).clear();
        if let Some(reaper) = &self.shared.reaper {
            reaper.abort();
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.fatal.load(Ordering::Acquire) && self.shared.transport.is_connected()
    }
}
