use std::fmt::{Debug, Formatter};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;

use crate::connection::Shared;
use crate::wire::{Message, MessageReader};
use crate::{lock, msg, ChannelId, ChannelOpenFailure, ConnectKind, Error, EventHandler, Transport};

pub mod filter;
mod session;
mod stream;
pub(crate) mod window;

pub use filter::StreamFilter;
pub(crate) use session::SessionState;
pub use session::{ExitStatus, SessionChannel, EXIT_STATUS_CLOSED, EXIT_STATUS_OPEN_FAILED};
pub(crate) use stream::Delivery;
pub use stream::ChannelIo;
use stream::StreamPipes;
use window::{ReceiveWindow, TransmitWindow};

/// Where a channel stands in the open handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenStatus {
    /// Waiting for the other side to confirm or refuse.
    #[default]
    Undefined,
    Open,
    /// Both sides closed it.
    Closed,
    /// The other side refused to open it.
    Failed,
}

/// Who asked for a channel to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// A local forwarding listener.
    ForwardListener,
    /// A session, on behalf of one of its requests (X11).
    Session,
    /// This side's API.
    Internal,
    /// The peer.
    None,
}

/// The concrete behaviours a channel can have, on top of streaming.
pub(crate) enum ChannelKind {
    Stream,
    Session(SessionState),
    /// The local end is a child process, killed when the output closes.
    Process(Mutex<tokio::process::Child>),
}

#[derive(Debug, Default)]
struct ChannelState {
    status: OpenStatus,
    peer_id: u32,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
    deleted: bool,
    /// `close` was called before the peer confirmed the channel.
    close_pending: bool,
}

/// Snapshot of a channel, for diagnostics.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub peer_id: u32,
    pub channel_type: String,
    pub origin: ChannelOrigin,
    pub status: OpenStatus,
    pub transmit_window: u32,
    pub transmit_max_packet: u32,
    pub receive_window: i64,
    pub receive_window_size: u32,
    pub receive_max_packet: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub eof_sent: bool,
    pub eof_received: bool,
    pub close_sent: bool,
    pub close_received: bool,
    pub deleted: bool,
}

type CloseListener = Box<dyn FnOnce(ChannelId) + Send>;

/// One multiplexed stream, and its half of the open/close handshake.
///
/// EOF and close are tracked independently in each direction. A
/// channel is released from its connection exactly once, when a close
/// has been both sent and received.
pub struct Channel {
    id: ChannelId,
    channel_type: String,
    origin: ChannelOrigin,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn EventHandler>,
    connection: Weak<Shared>,
    state: Mutex<ChannelState>,
    status: watch::Sender<OpenStatus>,
    closed: watch::Sender<bool>,
    tx_window: TransmitWindow,
    rx_window: Mutex<ReceiveWindow>,
    transmit_limit: u32,
    /// `None` once the listeners have run.
    listeners: Mutex<Option<Vec<CloseListener>>>,
    pipes: StreamPipes,
    kind: ChannelKind,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("type", &self.channel_type)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        shared: &Arc<Shared>,
        channel_type: &str,
        origin: ChannelOrigin,
        io: ChannelIo,
        kind: ChannelKind,
    ) -> Self {
        let config = &shared.config;
        let queue_depth = config.queued_delivery.then_some(config.queue_depth);
        Channel {
            id,
            channel_type: channel_type.to_string(),
            origin,
            transport: shared.transport.clone(),
            handler: shared.handler.clone(),
            connection: Arc::downgrade(shared),
            state: Mutex::new(ChannelState::default()),
            status: watch::channel(OpenStatus::Undefined).0,
            closed: watch::channel(false).0,
            tx_window: TransmitWindow::default(),
            rx_window: Mutex::new(ReceiveWindow::new(
                config.window_size,
                config.maximum_packet_size,
            )),
            transmit_limit: config.transmit_maximum_packet_size,
            listeners: Mutex::new(Some(Vec::new())),
            pipes: StreamPipes::new(io, queue_depth),
            kind,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn origin(&self) -> ChannelOrigin {
        self.origin
    }

    /// The id the peer gave this channel, once it is known.
    pub fn peer_id(&self) -> Option<u32> {
        let state = lock(&self.state);
        (state.status != OpenStatus::Undefined).then_some(state.peer_id)
    }

    pub fn status(&self) -> OpenStatus {
        lock(&self.state).status
    }

    /// Waits until the channel is confirmed or refused.
    pub async fn open_status(&self) -> OpenStatus {
        let mut status = self.status.subscribe();
        loop {
            let s = *status.borrow_and_update();
            if s != OpenStatus::Undefined {
                return s;
            }
            if status.changed().await.is_err() {
                return *status.borrow();
            }
        }
    }

    /// Waits until the channel is fully closed (or refused). Returns
    /// `false` if `timeout` elapsed first.
    pub async fn wait_until_closed(&self, timeout: Option<Duration>) -> bool {
        let mut closed = self.closed.subscribe();
        let wait = async move {
            loop {
                let done = *closed.borrow_and_update();
                if done || closed.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Runs `f` once, when the channel is released. If it already
    /// was, runs `f` right away.
    pub fn add_close_listener<F: FnOnce(ChannelId) + Send + 'static>(&self, f: F) {
        if let Some(listeners) = lock(&self.listeners).as_mut() {
            listeners.push(Box::new(f));
            return;
        }
        f(self.id)
    }

    pub fn info(&self) -> ChannelInfo {
        let state = lock(&self.state);
        let rx = lock(&self.rx_window);
        ChannelInfo {
            id: self.id,
            peer_id: state.peer_id,
            channel_type: self.channel_type.clone(),
            origin: self.origin,
            status: state.status,
            transmit_window: self.tx_window.available(),
            transmit_max_packet: self.tx_window.max_packet(),
            receive_window: rx.current(),
            receive_window_size: rx.size(),
            receive_max_packet: rx.max_packet(),
            bytes_sent: self.pipes.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.pipes.bytes_received.load(Ordering::Relaxed),
            eof_sent: state.eof_sent,
            eof_received: state.eof_received,
            close_sent: state.close_sent,
            close_received: state.close_received,
            deleted: state.deleted,
        }
    }

    pub(crate) fn connection(&self) -> Result<Arc<Shared>, Error> {
        self.connection.upgrade().ok_or(Error::Disconnect)
    }

    pub(crate) fn session(&self) -> Option<&SessionState> {
        match &self.kind {
            ChannelKind::Session(session) => Some(session),
            _ => None,
        }
    }

    pub(crate) fn set_filter(&self, filter: Box<dyn StreamFilter>) {
        self.pipes.set_filter(filter)
    }

    fn connect_kind(&self) -> ConnectKind {
        match (self.channel_type.as_str(), self.origin) {
            ("direct-tcpip", ChannelOrigin::ForwardListener) => ConnectKind::LocalForward,
            ("direct-tcpip", _) => ConnectKind::Direct,
            ("forwarded-tcpip", _) => ConnectKind::RemoteForward,
            ("session", _) => ConnectKind::Session,
            ("x11", _) => ConnectKind::X11,
            _ => ConnectKind::Other,
        }
    }

    /// Starts a message addressed to the peer's end of this channel.
    pub(crate) fn message(&self, msg_type: u8) -> Result<Message, Error> {
        addressed(msg_type, lock(&self.state).peer_id)
    }

    /// Sends `m` unless this side already closed the channel.
    pub(crate) fn transmit(&self, m: Message) -> Result<bool, Error> {
        let state = lock(&self.state);
        if state.close_sent || state.status != OpenStatus::Open {
            return Ok(false);
        }
        self.transport.transmit(m)?;
        Ok(true)
    }

    /// Sends channel data, unless EOF or close was already sent.
    pub(crate) fn send_payload(&self, data: &[u8]) -> Result<bool, Error> {
        let state = lock(&self.state);
        if state.eof_sent || state.close_sent || state.status != OpenStatus::Open {
            return Ok(false);
        }
        let mut m = addressed(msg::CHANNEL_DATA, state.peer_id)?;
        m.write_bytes(data)?;
        self.transport.transmit(m)?;
        Ok(true)
    }

    fn establish_locked(&self, state: &mut ChannelState, peer_id: u32, window: u32, packet: u32) {
        state.peer_id = peer_id;
        state.status = OpenStatus::Open;
        self.tx_window.init(window, packet.min(self.transmit_limit));
        debug!(
            "channel {}: open, peer {} window {} packet {}",
            self.id, peer_id, window, packet
        );
    }

    /// Records what the peer advertised in its channel-open, before we
    /// confirm it.
    pub(crate) fn establish(&self, peer_id: u32, window: u32, packet: u32) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.status != OpenStatus::Undefined {
            return Err(Error::Inconsistent);
        }
        self.establish_locked(&mut state, peer_id, window, packet);
        Ok(())
    }

    pub(crate) fn start(self: &Arc<Self>) {
        self.start_pumps();
    }

    pub(crate) fn connected(&self) {
        self.status.send_replace(OpenStatus::Open);
        self.handler.channel_connected(self.id, self.connect_kind());
    }

    /// The peer confirmed one of our channel-open requests.
    pub(crate) fn open_confirmation(
        self: &Arc<Self>,
        peer_id: u32,
        window: u32,
        packet: u32,
    ) -> Result<(), Error> {
        let close_pending = {
            let mut state = lock(&self.state);
            if state.status != OpenStatus::Undefined {
                error!("channel {}: duplicate open confirmation", self.id);
                return Err(Error::Inconsistent);
            }
            self.establish_locked(&mut state, peer_id, window, packet);
            self.start();
            state.close_pending
        };
        self.connected();
        if close_pending {
            self.send_close();
        }
        Ok(())
    }

    /// The peer refused one of our channel-open requests.
    pub(crate) async fn open_failure(
        &self,
        reason: ChannelOpenFailure,
        description: &str,
    ) -> Result<(), Error> {
        {
            let mut state = lock(&self.state);
            if state.status != OpenStatus::Undefined {
                error!("channel {}: open failure on an open channel", self.id);
                return Err(Error::Inconsistent);
            }
            state.status = OpenStatus::Failed;
            // The peer never created its end, there is nothing to close.
            state.eof_sent = true;
            state.close_sent = true;
            state.deleted = true;
        }
        debug!(
            "channel {}: open failed: {:?} {:?}",
            self.id, reason, description
        );
        self.close_output().await;
        if let Some(session) = self.session() {
            session.do_exit(self, ExitStatus::from_code(EXIT_STATUS_OPEN_FAILED));
            session.fail_requests();
        }
        self.handler.remote_open_failure(self.id, reason, description);
        self.release(OpenStatus::Failed);
        Ok(())
    }

    /// Gives up on a channel whose open request could not be sent.
    pub(crate) fn abandon(&self) {
        {
            let mut state = lock(&self.state);
            state.status = OpenStatus::Failed;
            state.eof_sent = true;
            state.close_sent = true;
            state.deleted = true;
        }
        self.pipes.stop();
        self.release(OpenStatus::Failed);
    }

    pub(crate) fn window_adjust(&self, increment: u32) {
        let available = self.tx_window.adjust(increment);
        trace!(
            "channel {}: window +{} = {}",
            self.id,
            increment,
            available
        );
    }

    /// Data (or extended data of type `ext`) received from the peer.
    pub(crate) async fn data(&self, ext: Option<u32>, data: Vec<u8>) -> Result<(), Error> {
        if let Err(excess) = lock(&self.rx_window).consume(data.len()) {
            return Err(Error::WindowExceeded {
                channel: self.id,
                excess,
            });
        }
        self.pipes
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let accept = {
            let state = lock(&self.state);
            state.status == OpenStatus::Open && !state.eof_received && !state.close_received
        };
        if !accept {
            warn!("channel {}: data after EOF, dropped", self.id);
        } else {
            match ext {
                None => self.deliver(Delivery::Data(Bytes::from(data))).await,
                Some(msg::SSH_EXTENDED_DATA_STDERR) => {
                    self.deliver(Delivery::Stderr(Bytes::from(data))).await
                }
                Some(code) => error!(
                    "channel {}: unknown extended data type {}",
                    self.id, code
                ),
            }
        }
        self.acknowledge()
    }

    fn acknowledge(&self) -> Result<(), Error> {
        let increment = lock(&self.rx_window).acknowledge();
        if let Some(increment) = increment {
            trace!("channel {}: acknowledging {} bytes", self.id, increment);
            let mut m = self.message(msg::CHANNEL_WINDOW_ADJUST)?;
            m.write_u32(increment)?;
            self.transmit(m)?;
        }
        Ok(())
    }

    pub(crate) fn handle_request(&self, r: &mut MessageReader) -> Result<(), Error> {
        let (typ, want_reply) = match (r.read_string(), r.read_bool()) {
            (Ok(typ), Ok(want_reply)) => (typ, want_reply),
            _ => {
                warn!("channel {}: malformed request", self.id);
                return Ok(());
            }
        };
        trace!("channel {}: request {:?} {}", self.id, typ, want_reply);
        let accepted = match self.session() {
            Some(session) => session.handle_request(self, &typ, r),
            None => false,
        };
        if !accepted {
            info!("channel {}: unhandled request {:?}", self.id, typ);
        }
        if want_reply {
            let reply = if accepted {
                msg::CHANNEL_SUCCESS
            } else {
                msg::CHANNEL_FAILURE
            };
            self.transmit(self.message(reply)?)?;
        }
        Ok(())
    }

    pub(crate) fn request_reply(&self, success: bool) {
        let handled = match self.session() {
            Some(session) => session.reply(success),
            None => false,
        };
        if !handled {
            error!(
                "channel {}: unexpected reply ({}), nothing pending",
                self.id, success
            );
        }
    }

    pub(crate) async fn recv_eof(&self) {
        let eof_sent = {
            let mut state = lock(&self.state);
            if state.eof_received {
                debug!("channel {}: duplicate EOF", self.id);
                return;
            }
            state.eof_received = true;
            state.eof_sent
        };
        debug!("channel {}: EOF received", self.id);
        self.finish_output().await;
        if eof_sent {
            self.send_close();
        }
    }

    pub(crate) async fn recv_close(&self) {
        {
            let mut state = lock(&self.state);
            if state.close_received {
                debug!("channel {}: duplicate close", self.id);
                return;
            }
            state.close_received = true;
            // Closing implies that nothing more can be sent.
            state.eof_sent = true;
        }
        debug!("channel {}: close received", self.id);
        self.tx_window.close();
        self.close_output().await;
        self.output_closed();
        if let Some(session) = self.session() {
            session.do_exit(self, ExitStatus::from_code(EXIT_STATUS_CLOSED));
            session.fail_requests();
        }
        self.send_close();
        self.handler.channel_closed(self.id);
        self.check_termination();
    }

    /// Sends EOF, once. If the peer already sent its own, closes.
    pub fn send_eof(&self) -> Result<(), Error> {
        let eof_received = {
            let mut state = lock(&self.state);
            if state.eof_sent || state.close_sent || state.status != OpenStatus::Open {
                return Ok(());
            }
            state.eof_sent = true;
            self.transport
                .transmit(addressed(msg::CHANNEL_EOF, state.peer_id)?)?;
            state.eof_received
        };
        debug!("channel {}: EOF sent", self.id);
        if eof_received {
            self.send_close();
        }
        Ok(())
    }

    pub(crate) fn send_close(&self) {
        let sent = {
            let mut state = lock(&self.state);
            if state.close_sent {
                false
            } else if state.status == OpenStatus::Undefined && self.transport.is_connected() {
                state.close_pending = true;
                false
            } else {
                state.close_sent = true;
                state.eof_sent = true;
                if state.status == OpenStatus::Open {
                    let sent = addressed(msg::CHANNEL_CLOSE, state.peer_id)
                        .and_then(|m| self.transport.transmit(m));
                    if let Err(e) = sent {
                        debug!("channel {}: close not sent: {}", self.id, e);
                    }
                }
                true
            }
        };
        if sent {
            debug!("channel {}: close sent", self.id);
            self.tx_window.close();
            self.pipes.stop();
        }
        self.check_termination();
    }

    /// Closes the channel. If the connection is already gone, the
    /// peer's close is synthesized so that the channel is released.
    pub async fn close(&self) {
        if !self.transport.is_connected() {
            self.recv_close().await;
        }
        self.send_close();
    }

    fn check_termination(&self) {
        let terminate = {
            let mut state = lock(&self.state);
            if state.close_sent && state.close_received && !state.deleted {
                state.deleted = true;
                state.status = match state.status {
                    OpenStatus::Open => OpenStatus::Closed,
                    // Torn down before the peer answered.
                    OpenStatus::Undefined => OpenStatus::Failed,
                    status => status,
                };
                Some(state.status)
            } else {
                None
            }
        };
        if let Some(status) = terminate {
            debug!("channel {}: terminated", self.id);
            self.release(status);
        }
    }

    fn release(&self, status: OpenStatus) {
        self.tx_window.close();
        self.pipes.stop();
        if let Some(shared) = self.connection.upgrade() {
            shared.release_channel(self.id);
        }
        let listeners = lock(&self.listeners).take();
        for listener in listeners.into_iter().flatten() {
            listener(self.id)
        }
        self.status.send_replace(status);
        self.closed.send_replace(true);
    }

    /// Nothing more can be written to the local output.
    fn output_closed(&self) {
        if let ChannelKind::Process(child) = &self.kind {
            debug!("channel {}: killing child process", self.id);
            if let Err(e) = lock(child).start_kill() {
                trace!("channel {}: kill: {}", self.id, e);
            }
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }
}

fn addressed(msg_type: u8, peer_id: u32) -> Result<Message, Error> {
    let mut m = Message::new(msg_type);
    m.write_u32(peer_id)?;
    Ok(m)
}
