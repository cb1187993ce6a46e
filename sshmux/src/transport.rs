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
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::wire::Message;
use crate::{msg, Config, Disconnect, Error};

/// What the channel layer needs from the layer below it.
pub trait Transport: Send + Sync {
    /// Encrypts and sends one message. Messages must reach the peer
    /// in the order they are transmitted.
    fn transmit(&self, msg: Message) -> Result<(), Error>;

    fn config(&self) -> &Config;

    /// Tears down the whole connection, telling the peer why.
    fn fatal_disconnect(&self, reason: Disconnect, description: &str);

    fn is_connected(&self) -> bool;
}

/// A [`Transport`] that queues outgoing messages on an in-process
/// channel, for an external event loop (or a test) to drain.
#[derive(Debug)]
pub struct PacketQueue {
    sender: UnboundedSender<Message>,
    config: Config,
    disconnected: AtomicBool,
}

impl PacketQueue {
    pub fn new(config: Config) -> (Self, UnboundedReceiver<Message>) {
        let (sender, receiver) = unbounded_channel();
        (
            PacketQueue {
                sender,
                config,
                disconnected: AtomicBool::new(false),
            },
            receiver,
        )
    }
}

impl Transport for PacketQueue {
    fn transmit(&self, msg: Message) -> Result<(), Error> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(Error::Disconnect);
        }
        trace!("transmit {:?}", msg);
        self.sender.send(msg).map_err(|_| Error::SendError)
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn fatal_disconnect(&self, reason: Disconnect, description: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("disconnecting: {:?} {:?}", reason, description);
        // https://tools.ietf.org/html/rfc4253#section-11.1
        let mut m = Message::new(msg::DISCONNECT);
        let encoded = m
            .write_u32(reason as u32)
            .and_then(|m| m.write_string(description))
            .and_then(|m| m.write_string("en"))
            .is_ok();
        if encoded {
            let _ = self.sender.send(m);
        }
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}
