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
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::filter::StreamFilter;
use super::Channel;
use crate::{lock, Error};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The local ends of a channel: where the bytes we send come from,
/// and where the bytes we receive go.
///
/// Any end can be left out, in which case nothing is sent (for the
/// input), or received data is dropped (for the outputs).
#[derive(Default)]
pub struct ChannelIo {
    pub(crate) input: Option<BoxedReader>,
    pub(crate) output: Option<BoxedWriter>,
    pub(crate) stderr: Option<BoxedWriter>,
}

impl ChannelIo {
    pub fn new<R, W>(input: R, output: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        ChannelIo {
            input: Some(Box::new(input)),
            output: Some(Box::new(output)),
            stderr: None,
        }
    }

    /// Sends the extended data of a session to `stderr`.
    pub fn with_stderr<W>(mut self, stderr: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Uses both halves of a duplex stream, such as a socket.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(r, w)
    }
}

impl Debug for ChannelIo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIo")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Data(Bytes),
    Stderr(Bytes),
    Eof,
}

/// Both pumps of a stream channel, and what they share.
pub(crate) struct StreamPipes {
    input: Mutex<Option<BoxedReader>>,
    output: tokio::sync::Mutex<Option<BoxedWriter>>,
    stderr: tokio::sync::Mutex<Option<BoxedWriter>>,
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    filter: Mutex<Option<Box<dyn StreamFilter>>>,
    stop: watch::Sender<bool>,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl StreamPipes {
    /// With a `queue_depth`, received data is handed to a dedicated
    /// task through a queue of that depth.
    pub fn new(io: ChannelIo, queue_depth: Option<usize>) -> Self {
        let (queue, queue_rx) = match queue_depth {
            Some(depth) => {
                let (tx, rx) = mpsc::channel(depth.max(1));
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        StreamPipes {
            input: Mutex::new(io.input),
            output: tokio::sync::Mutex::new(io.output),
            stderr: tokio::sync::Mutex::new(io.stderr),
            queue: Mutex::new(queue),
            queue_rx: Mutex::new(queue_rx),
            filter: Mutex::new(None),
            stop: watch::channel(false).0,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn set_filter(&self, filter: Box<dyn StreamFilter>) {
        *lock(&self.filter) = Some(filter);
    }

    /// Interrupts the transmit task if it is blocked reading.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

#[derive(Debug)]
enum Outcome {
    Eof,
    Failed,
    Closed,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow_and_update();
        if stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

impl Channel {
    pub(crate) fn start_pumps(self: &Arc<Self>) {
        if let Some(queue) = lock(&self.pipes.queue_rx).take() {
            tokio::spawn(self.clone().receive_loop(queue));
        }
        if let Some(input) = lock(&self.pipes.input).take() {
            tokio::spawn(self.clone().transmit_loop(input));
        }
    }

    async fn transmit_loop(self: Arc<Self>, mut input: BoxedReader) {
        let mut stop = self.pipes.stop.subscribe();
        let mut buf = Vec::new();
        let outcome = loop {
            let Some(n) = self.tx_window.reserve(usize::MAX).await else {
                break Outcome::Closed;
            };
            buf.resize(n, 0);
            let read = tokio::select! {
                r = input.read(&mut buf) => r,
                _ = stopped(&mut stop) => {
                    self.tx_window.release(n);
                    break Outcome::Closed;
                }
            };
            let k = match read {
                Ok(0) => {
                    self.tx_window.release(n);
                    break Outcome::Eof;
                }
                Ok(k) => k,
                Err(e) => {
                    debug!("channel {}: input failed: {}", self.id, e);
                    self.tx_window.release(n);
                    break Outcome::Failed;
                }
            };
            let data = match self.filter_outbound(buf.get(..k).unwrap_or_default().to_vec()) {
                Ok(data) => data,
                Err(e) => {
                    warn!("channel {}: {}", self.id, e);
                    self.tx_window.release(n);
                    break Outcome::Failed;
                }
            };
            self.tx_window.release(n - data.len());
            if data.is_empty() {
                continue;
            }
            match self.send_payload(&data) {
                Ok(true) => {
                    self.pipes
                        .bytes_sent
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Ok(false) => break Outcome::Closed,
                Err(e) => {
                    debug!("channel {}: {}", self.id, e);
                    break Outcome::Failed;
                }
            }
        };
        trace!("channel {}: transmit loop done ({:?})", self.id, outcome);
        match outcome {
            Outcome::Eof => {
                if let Err(e) = self.send_eof() {
                    debug!("channel {}: could not send EOF: {}", self.id, e);
                }
            }
            Outcome::Failed => self.close().await,
            Outcome::Closed => {}
        }
    }

    async fn receive_loop(self: Arc<Self>, mut queue: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = queue.recv().await {
            if let Err(e) = self.write_local(delivery).await {
                debug!("channel {}: output failed: {}", self.id, e);
                self.output_failed().await;
                break;
            }
        }
        self.shutdown_output().await;
        trace!("channel {}: receive loop done", self.id);
    }

    fn filter_outbound(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut filter = lock(&self.pipes.filter);
        let Some(filter) = filter.as_mut() else {
            return Ok(data);
        };
        let len = data.len();
        let data = filter.outbound(data)?;
        if data.len() > len {
            return Err(Error::Filter("outbound filter grew the stream".into()));
        }
        Ok(data)
    }

    fn filter_inbound(&self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        match lock(&self.pipes.filter).as_mut() {
            Some(filter) => filter.inbound(data),
            None => Ok(data),
        }
    }

    /// Hands received data to the local side, either directly or
    /// through the receive queue.
    pub(crate) async fn deliver(&self, delivery: Delivery) {
        let delivery = match delivery {
            Delivery::Data(data) => match self.filter_inbound(data.into()) {
                Ok(data) if data.is_empty() => return,
                Ok(data) => Delivery::Data(data.into()),
                Err(e) => {
                    warn!("channel {}: {}", self.id, e);
                    self.close().await;
                    return;
                }
            },
            delivery => delivery,
        };
        let queue = lock(&self.pipes.queue).clone();
        match queue {
            Some(queue) => {
                if queue.send(delivery).await.is_err() {
                    debug!("channel {}: receive queue is gone", self.id);
                }
            }
            None => {
                if let Err(e) = self.write_local(delivery).await {
                    debug!("channel {}: output failed: {}", self.id, e);
                    self.output_failed().await;
                }
            }
        }
    }

    async fn write_local(&self, delivery: Delivery) -> std::io::Result<()> {
        let (sink, data) = match delivery {
            Delivery::Data(data) => (&self.pipes.output, data),
            Delivery::Stderr(data) => (&self.pipes.stderr, data),
            Delivery::Eof => {
                self.shutdown_output().await;
                return Ok(());
            }
        };
        let mut sink = sink.lock().await;
        if let Some(w) = sink.as_mut() {
            w.write_all(&data).await?;
            w.flush().await?;
        }
        Ok(())
    }

    async fn shutdown_output(&self) {
        let output = self.pipes.output.lock().await.take();
        let stderr = self.pipes.stderr.lock().await.take();
        for mut w in output.into_iter().chain(stderr) {
            if let Err(e) = w.shutdown().await {
                trace!("channel {}: shutdown: {}", self.id, e);
            }
        }
    }

    /// No more data will be received: lets the local output drain.
    pub(crate) async fn finish_output(&self) {
        let queue = lock(&self.pipes.queue).clone();
        match queue {
            Some(queue) => {
                let _ = queue.send(Delivery::Eof).await;
            }
            None => self.shutdown_output().await,
        }
    }

    /// The channel is going away: stops both pumps.
    pub(crate) async fn close_output(&self) {
        self.pipes.stop();
        let queue = lock(&self.pipes.queue).take();
        if queue.is_none() {
            self.shutdown_output().await;
        }
    }

    async fn output_failed(&self) {
        self.output_closed();
        self.close().await;
    }
}
