#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)] // Allow unwraps, expects and panics in the test suite

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::wire::{Message, MessageReader};
use crate::{msg, *};

mod session;
mod window;

pub(crate) fn test_init() {
    let _ = env_logger::try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Added(ChannelId),
    Deleted(ChannelId),
    Connected(ChannelId, ConnectKind),
    Closed(ChannelId),
    LocalOpenFailure {
        channel_type: String,
        reason: ChannelOpenFailure,
        description: String,
    },
    RemoteOpenFailure(ChannelId, ChannelOpenFailure),
    X11(ChannelId),
    Fatal,
}

/// Records every event, in order.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Event>>,
    pub refuse_forwards: AtomicBool,
}

impl Recorder {
    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&Event) -> bool>(&self, f: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| f(e)).count()
    }
}

impl EventHandler for Recorder {
    fn channel_added(&self, id: ChannelId) {
        self.push(Event::Added(id))
    }

    fn channel_deleted(&self, id: ChannelId) {
        self.push(Event::Deleted(id))
    }

    fn channel_connected(&self, id: ChannelId, kind: ConnectKind) {
        self.push(Event::Connected(id, kind))
    }

    fn channel_closed(&self, id: ChannelId) {
        self.push(Event::Closed(id))
    }

    fn local_open_failure(&self, context: &OpenFailureContext) {
        self.push(Event::LocalOpenFailure {
            channel_type: context.channel_type.clone(),
            reason: context.reason,
            description: context.description.clone(),
        })
    }

    fn remote_open_failure(&self, id: ChannelId, reason: ChannelOpenFailure, _: &str) {
        self.push(Event::RemoteOpenFailure(id, reason))
    }

    fn forward_connect(&self, _: &ForwardConnect) -> bool {
        !self.refuse_forwards.load(Ordering::Relaxed)
    }

    fn x11_connect(&self, id: ChannelId, _: &str, _: u32) {
        self.push(Event::X11(id))
    }

    fn fatal_error(&self, _: &Error) {
        self.push(Event::Fatal)
    }
}

/// A connection whose peer is the test itself: it feeds the messages
/// the peer would send, and reads what the connection transmits.
pub(crate) struct Harness {
    pub conn: Connection,
    pub handler: Arc<Recorder>,
    outgoing: UnboundedReceiver<Message>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        test_init();
        let (transport, outgoing) = PacketQueue::new(config);
        let handler = Arc::new(Recorder::default());
        let conn = Connection::new(Arc::new(transport), handler.clone()).unwrap();
        Harness {
            conn,
            handler,
            outgoing,
        }
    }

    pub async fn feed(&self, m: Message) {
        self.conn.handle_message(m).await.unwrap()
    }

    pub async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.outgoing.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("transport closed")
    }

    pub async fn expect(&mut self, msg_type: u8) -> Message {
        let m = self.next().await;
        assert_eq!(m.msg_type(), msg_type, "unexpected {:?}", m);
        m
    }

    /// Stops reading what the connection sends, as if the transport
    /// went down.
    pub fn disconnect_peer(&mut self) {
        self.outgoing.close()
    }

    /// A message transmitted synchronously, if any.
    pub fn try_next(&mut self) -> Option<Message> {
        self.outgoing.try_recv().ok()
    }

    /// Opens a session and confirms it as peer channel `peer_id`.
    pub async fn open_session(
        &mut self,
        io: ChannelIo,
        peer_id: u32,
        window: u32,
        packet: u32,
    ) -> SessionChannel {
        let session = self.conn.open_session(io).await.unwrap();
        let open = self.expect(msg::CHANNEL_OPEN).await;
        assert_eq!(opened_id(&open), session.id());
        self.feed(confirmation(session.id(), peer_id, window, packet))
            .await;
        assert_eq!(session.open_status().await, OpenStatus::Open);
        session
    }
}

/// The sender channel of a channel-open we transmitted.
pub(crate) fn opened_id(m: &Message) -> ChannelId {
    let mut r = m.reader();
    r.read_string().unwrap();
    ChannelId(r.read_u32().unwrap())
}

pub(crate) fn recipient(m: &Message) -> u32 {
    m.reader().read_u32().unwrap()
}

pub(crate) fn confirmation(id: ChannelId, peer_id: u32, window: u32, packet: u32) -> Message {
    let mut m = Message::new(msg::CHANNEL_OPEN_CONFIRMATION);
    m.write_u32(id.0)
        .unwrap()
        .write_u32(peer_id)
        .unwrap()
        .write_u32(window)
        .unwrap()
        .write_u32(packet)
        .unwrap();
    m
}

pub(crate) fn to_channel(msg_type: u8, id: ChannelId) -> Message {
    let mut m = Message::new(msg_type);
    m.write_u32(id.0).unwrap();
    m
}

pub(crate) fn data(id: ChannelId, payload: &[u8]) -> Message {
    let mut m = to_channel(msg::CHANNEL_DATA, id);
    m.write_bytes(payload).unwrap();
    m
}

pub(crate) fn peer_open<F: FnOnce(&mut Message)>(
    typ: &str,
    sender: u32,
    window: u32,
    packet: u32,
    extra: F,
) -> Message {
    let mut m = Message::new(msg::CHANNEL_OPEN);
    m.write_string(typ)
        .unwrap()
        .write_u32(sender)
        .unwrap()
        .write_u32(window)
        .unwrap()
        .write_u32(packet)
        .unwrap();
    extra(&mut m);
    m
}

pub(crate) fn tcpip(m: &mut Message, host: &str, port: u32, origin: &str, origin_port: u32) {
    m.write_string(host)
        .unwrap()
        .write_u32(port)
        .unwrap()
        .write_string(origin)
        .unwrap()
        .write_u32(origin_port)
        .unwrap();
}

/// Reason code and description of an open failure.
pub(crate) fn failure(m: &Message) -> (u32, u32, String) {
    let mut r: MessageReader = m.reader();
    (
        r.read_u32().unwrap(),
        r.read_u32().unwrap(),
        r.read_string().unwrap(),
    )
}
