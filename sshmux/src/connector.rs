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

//! Channel-open requests from the peer, resolved off the dispatch
//! path: connecting to a local endpoint may take a while.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::channels::{ChannelIo, ChannelKind, ChannelOrigin, StreamFilter};
use crate::connection::Shared;
use crate::parsing::OpenChannelMessage;
use crate::wire::Message;
use crate::{
    forward, lock, ChannelOpenFailure, ChannelType, ConnectKind, Error, ForwardConnect,
    OpenFailureContext,
};

#[derive(Debug)]
pub(crate) enum ConnectorJob {
    Open(Message),
    Stop,
}

/// Handle on the worker. The worker stops when this is dropped, or
/// right away on [`Connector::stop`].
#[derive(Debug)]
pub(crate) struct Connector {
    sender: UnboundedSender<ConnectorJob>,
    stopped: AtomicBool,
}

impl Connector {
    pub fn spawn(shared: Weak<Shared>) -> Self {
        let (sender, receiver) = unbounded_channel();
        tokio::spawn(run(shared, receiver));
        Connector {
            sender,
            stopped: AtomicBool::new(false),
        }
    }

    /// Queues a channel-open. Once stopped, the open is handed back
    /// to be refused by the caller.
    pub fn submit(&self, open: Message) -> Result<(), Message> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(open);
        }
        match self.sender.send(ConnectorJob::Open(open)) {
            Ok(()) => Ok(()),
            Err(SendError(ConnectorJob::Open(open))) => Err(open),
            Err(SendError(ConnectorJob::Stop)) => Ok(()),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.sender.send(ConnectorJob::Stop);
    }
}

async fn run(shared: Weak<Shared>, mut jobs: UnboundedReceiver<ConnectorJob>) {
    while let Some(job) = jobs.recv().await {
        let ConnectorJob::Open(open) = job else {
            break;
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Err(e) = resolve(&shared, &open).await {
            debug!("channel open: {}", e);
            shared.escalate(e).await;
        }
    }
    // Opens queued behind the stop still get an answer.
    jobs.close();
    if let Some(shared) = shared.upgrade() {
        while let Ok(job) = jobs.try_recv() {
            if let ConnectorJob::Open(open) = job {
                if let Err(e) = refuse_stopped(&shared, &open) {
                    debug!("channel open: {}", e);
                }
            }
        }
    }
    debug!("connector stopped");
}

/// Answers a channel-open the stopped connector will never resolve.
pub(crate) fn refuse_stopped(shared: &Shared, open: &Message) -> Result<(), Error> {
    let open = OpenChannelMessage::parse(&mut open.reader())?;
    let refused = refuse(
        ChannelOpenFailure::AdministrativelyProhibited,
        "connection is shutting down",
    );
    debug!(
        "refusing {:?} channel: {}",
        open.typ.name(),
        refused.description
    );
    shared
        .transport
        .transmit(open.fail(refused.reason, &refused.description)?)?;
    shared
        .handler
        .local_open_failure(&failure_context(&open.typ, refused));
    Ok(())
}

struct Accepted {
    io: ChannelIo,
    kind: ChannelKind,
    origin: ChannelOrigin,
    filter: Option<Box<dyn StreamFilter>>,
}

struct Refused {
    reason: ChannelOpenFailure,
    description: String,
}

fn refuse(reason: ChannelOpenFailure, description: impl Into<String>) -> Refused {
    Refused {
        reason,
        description: description.into(),
    }
}

async fn resolve(shared: &Arc<Shared>, open: &Message) -> Result<(), Error> {
    let open = OpenChannelMessage::parse(&mut open.reader())?;
    debug!(
        "channel open {:?} from peer channel {}",
        open.typ.name(),
        open.sender_channel
    );
    match prepare(shared, &open.typ).await {
        Ok(accepted) => accept(shared, &open, accepted),
        Err(refused) => {
            warn!(
                "refusing {:?} channel: {}",
                open.typ.name(),
                refused.description
            );
            shared
                .transport
                .transmit(open.fail(refused.reason, &refused.description)?)?;
            shared
                .handler
                .local_open_failure(&failure_context(&open.typ, refused));
            Ok(())
        }
    }
}

async fn prepare(shared: &Shared, typ: &ChannelType) -> Result<Accepted, Refused> {
    let timeout = shared.config.connect_timeout;
    match typ {
        ChannelType::ForwardedTcpIp(info) => {
            let key = (info.host_to_connect.clone(), info.port_to_connect);
            let forward = lock(&shared.remote_forwards).get(&key).cloned();
            let Some(forward) = forward else {
                error!(
                    "unsolicited forward from {}:{}",
                    info.host_to_connect, info.port_to_connect
                );
                return Err(refuse(
                    ChannelOpenFailure::AdministrativelyProhibited,
                    "unsolicited forward attempted",
                ));
            };
            let connect = ForwardConnect {
                listen_address: info.host_to_connect.clone(),
                listen_port: info.port_to_connect,
                originator_address: info.originator_address.clone(),
                originator_port: info.originator_port,
                kind: ConnectKind::RemoteForward,
            };
            if !shared.handler.forward_connect(&connect) {
                return Err(refuse(
                    ChannelOpenFailure::AdministrativelyProhibited,
                    "forward refused",
                ));
            }
            let (io, kind) = forward
                .target
                .connect(timeout)
                .await
                .map_err(|e| refuse(ChannelOpenFailure::ConnectFailed, e.to_string()))?;
            Ok(Accepted {
                io,
                kind,
                origin: ChannelOrigin::None,
                filter: forward.filter.map(|make| make()),
            })
        }
        ChannelType::DirectTcpip(info) => {
            let stream = forward::connect_tcp(&info.host_to_connect, info.port_to_connect, timeout)
                .await
                .map_err(|e| refuse(ChannelOpenFailure::ConnectFailed, e.to_string()))?;
            Ok(Accepted {
                io: ChannelIo::from_stream(stream),
                kind: ChannelKind::Stream,
                origin: ChannelOrigin::None,
                filter: None,
            })
        }
        ChannelType::X11 { .. } => {
            // A single-use grant is spent even if the display is unreachable.
            let (display, filter) = {
                let mut x11 = lock(&shared.x11);
                if !x11.take_mapping() {
                    return Err(refuse(
                        ChannelOpenFailure::AdministrativelyProhibited,
                        "X11 forwarding not requested",
                    ));
                }
                (x11.display().cloned(), x11.filter())
            };
            let Some(display) = display else {
                return Err(refuse(
                    ChannelOpenFailure::ConnectFailed,
                    "no X11 display",
                ));
            };
            let io = display
                .connect(timeout)
                .await
                .map_err(|e| refuse(ChannelOpenFailure::ConnectFailed, e.to_string()))?;
            Ok(Accepted {
                io,
                kind: ChannelKind::Stream,
                origin: ChannelOrigin::Session,
                filter: Some(Box::new(filter)),
            })
        }
        ChannelType::Session | ChannelType::AgentForward => Err(refuse(
            ChannelOpenFailure::AdministrativelyProhibited,
            format!("{} channels are not supported", typ.name()),
        )),
        ChannelType::Unknown { typ } => Err(refuse(
            ChannelOpenFailure::UnknownChannelType,
            format!("unknown channel type {:?}", typ),
        )),
    }
}

fn accept(shared: &Arc<Shared>, open: &OpenChannelMessage, accepted: Accepted) -> Result<(), Error> {
    let channel = shared.register(
        open.typ.name(),
        accepted.origin,
        accepted.io,
        accepted.kind,
    )?;
    if let Some(filter) = accepted.filter {
        channel.set_filter(filter);
    }
    channel.establish(
        open.sender_channel,
        open.initial_window_size,
        open.maximum_packet_size,
    )?;
    let confirmation = open.confirm(
        channel.id(),
        shared.config.window_size,
        shared.config.maximum_packet_size,
    )?;
    // The peer must know the channel before any data flows on it.
    if let Err(e) = shared.transport.transmit(confirmation) {
        channel.abandon();
        return Err(e);
    }
    channel.start();
    channel.connected();
    if let ChannelType::X11 {
        originator_address,
        originator_port,
    } = &open.typ
    {
        shared
            .handler
            .x11_connect(channel.id(), originator_address, *originator_port);
    }
    Ok(())
}

fn failure_context(typ: &ChannelType, refused: Refused) -> OpenFailureContext {
    let (target_address, target_port, originator_address, originator_port) = match typ {
        ChannelType::DirectTcpip(info) | ChannelType::ForwardedTcpIp(info) => (
            info.host_to_connect.clone(),
            info.port_to_connect,
            info.originator_address.clone(),
            info.originator_port,
        ),
        ChannelType::X11 {
            originator_address,
            originator_port,
        } => (
            String::new(),
            0,
            originator_address.clone(),
            *originator_port,
        ),
        _ => (String::new(), 0, String::new(), 0),
    };
    OpenFailureContext {
        channel_type: typ.name().to_string(),
        target_address,
        target_port,
        originator_address,
        originator_port,
        reason: refused.reason,
        description: refused.description,
    }
}
