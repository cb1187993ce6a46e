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
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::lock;

#[derive(Debug, Default)]
struct TransmitState {
    available: u32,
    max_packet: u32,
    closed: bool,
}

/// How much we may still send to the peer on one channel.
///
/// There is a single consumer (the channel's transmit task), which
/// is woken whenever the window grows or the channel goes away.
#[derive(Debug, Default)]
pub(crate) struct TransmitWindow {
    state: Mutex<TransmitState>,
    notify: Notify,
}

impl TransmitWindow {
    pub fn init(&self, window: u32, max_packet: u32) {
        let mut state = lock(&self.state);
        state.available = window;
        state.max_packet = max_packet;
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `increment` bytes, never resetting what is left.
    pub fn adjust(&self, increment: u32) -> u32 {
        let mut state = lock(&self.state);
        state.available = state.available.saturating_add(increment);
        let available = state.available;
        drop(state);
        self.notify.notify_one();
        available
    }

    /// Waits until at least one byte may be sent, then takes up to
    /// `limit` bytes (and at most one packet) out of the window.
    /// Returns `None` once the window is closed.
    pub async fn reserve(&self, limit: usize) -> Option<usize> {
        loop {
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return None;
                }
                let n = (state.available.min(state.max_packet) as usize).min(limit);
                if n > 0 {
                    state.available -= n as u32;
                    return Some(n);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Gives back the part of a reservation that was not sent.
    pub fn release(&self, unused: usize) {
        if unused > 0 {
            self.adjust(unused as u32);
        }
    }

    /// Wakes the transmit task for good.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }

    pub fn available(&self) -> u32 {
        lock(&self.state).available
    }

    pub fn max_packet(&self) -> u32 {
        lock(&self.state).max_packet
    }
}

/// Accounting of what the peer may still send us.
#[derive(Debug)]
pub(crate) struct ReceiveWindow {
    size: u32,
    current: i64,
    max_packet: u32,
}

impl ReceiveWindow {
    pub fn new(size: u32, max_packet: u32) -> Self {
        ReceiveWindow {
            size,
            current: size as i64,
            max_packet,
        }
    }

    /// Takes `len` bytes out of the window. On overflow, returns by
    /// how much the peer exceeded it.
    pub fn consume(&mut self, len: usize) -> Result<(), u64> {
        self.current -= len as i64;
        if self.current < 0 {
            Err(self.current.unsigned_abs())
        } else {
            Ok(())
        }
    }

    /// If enough of the window was consumed, resets it to its full
    /// size and returns the increment to advertise.
    pub fn acknowledge(&mut self) -> Option<u32> {
        let consumed = self.size as i64 - self.current;
        if consumed <= 0 {
            return None;
        }
        if consumed * 2 >= self.size as i64 || consumed >= 3 * self.max_packet as i64 {
            self.current = self.size as i64;
            Some(consumed as u32)
        } else {
            None
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn half_window_acknowledged_once() {
        let mut w = ReceiveWindow::new(1000, 400);
        w.consume(250).unwrap();
        assert_eq!(w.acknowledge(), None);
        w.consume(250).unwrap();
        assert_eq!(w.acknowledge(), Some(500));
        assert_eq!(w.current(), 1000);
        assert_eq!(w.acknowledge(), None);
    }

    #[test]
    fn three_packets_acknowledged() {
        let mut w = ReceiveWindow::new(10000, 100);
        for _ in 0..2 {
            w.consume(100).unwrap();
            assert_eq!(w.acknowledge(), None);
        }
        w.consume(100).unwrap();
        assert_eq!(w.acknowledge(), Some(300));
    }

    #[test]
    fn overflow() {
        let mut w = ReceiveWindow::new(100, 100);
        w.consume(60).unwrap();
        assert_eq!(w.consume(60), Err(20));
    }

    #[tokio::test]
    async fn reserve_waits_for_adjust() {
        let w = Arc::new(TransmitWindow::default());
        w.init(10, 4);
        assert_eq!(w.reserve(100).await, Some(4));
        assert_eq!(w.reserve(3).await, Some(3));
        assert_eq!(w.reserve(100).await, Some(3));
        assert_eq!(w.available(), 0);

        let w2 = w.clone();
        let task = tokio::spawn(async move { w2.reserve(100).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        w.adjust(2);
        assert_eq!(task.await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn close_wakes_reserve() {
        let w = Arc::new(TransmitWindow::default());
        w.init(0, 32768);
        let w2 = w.clone();
        let task = tokio::spawn(async move { w2.reserve(100).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.close();
        assert_eq!(task.await.unwrap(), None);
    }
}
