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
use std::time::Duration;

use log::warn;

use crate::Error;

/// The configuration of a connection's channel layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// The initial size of the receive window of our channels.
    pub window_size: u32,
    /// The largest packet we accept on our channels.
    pub maximum_packet_size: u32,
    /// The largest packet we send, whatever the peer advertises.
    pub transmit_maximum_packet_size: u32,
    /// Hand inbound channel data to a per-channel task instead of
    /// writing it to the local sink from the dispatcher.
    pub queued_delivery: bool,
    /// Number of payloads buffered per channel in queued mode.
    pub queue_depth: usize,
    /// Keep closed channels in the table for `deletion_grace` before
    /// freeing their slot.
    pub deferred_deletion: bool,
    pub deletion_grace: Duration,
    /// How often deferred deletions are collected.
    pub reaper_interval: Duration,
    /// Hard cap on the number of simultaneously allocated channel ids.
    pub max_channels: usize,
    /// Number of slots the channel table grows by.
    pub table_increment: usize,
    /// Timeout for local connections made on behalf of the peer.
    pub connect_timeout: Option<Duration>,
    /// Whether the transport may re-key this connection.
    pub rekey: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: 2097152,
            maximum_packet_size: 32768,
            transmit_maximum_packet_size: 32768,
            queued_delivery: false,
            queue_depth: 32,
            deferred_deletion: false,
            deletion_grace: Duration::from_secs(2),
            reaper_interval: Duration::from_secs(1),
            max_channels: 1024,
            table_increment: 16,
            connect_timeout: None,
            rekey: true,
        }
    }
}

impl Config {
    /// Checks the configuration, fixing up the combinations that
    /// cannot work together.
    pub fn validated(mut self) -> Result<Config, Error> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be positive".into()));
        }
        if self.maximum_packet_size == 0 || self.transmit_maximum_packet_size == 0 {
            return Err(Error::InvalidConfig(
                "packet sizes must be positive".into(),
            ));
        }
        if self.max_channels == 0 || self.max_channels > 65535 {
            return Err(Error::InvalidConfig(
                "max_channels must be between 1 and 65535".into(),
            ));
        }
        if self.table_increment == 0 {
            return Err(Error::InvalidConfig(
                "table_increment must be positive".into(),
            ));
        }
        if self.queued_delivery && self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be positive".into()));
        }
        if self.queued_delivery && self.rekey {
            warn!("re-keying is not supported with queued delivery, disabling it");
            self.rekey = false;
        }
        Ok(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn queued_delivery_disables_rekey() {
        let config = Config {
            queued_delivery: true,
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert!(!config.rekey);
        assert!(Config::default().validated().unwrap().rekey);
    }

    #[test]
    fn rejects_oversized_table() {
        let config = Config {
            max_channels: 70000,
            ..Default::default()
        };
        assert!(matches!(config.validated(), Err(Error::InvalidConfig(_))));
    }
}
