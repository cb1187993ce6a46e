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
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{oneshot, watch};

use super::{Channel, OpenStatus};
use crate::wire::{Message, MessageReader};
use crate::x11::MIT_MAGIC_COOKIE;
use crate::{lock, msg, Error, Sig};

/// Exit status of a session whose channel was closed before the
/// remote command reported one.
pub const EXIT_STATUS_CLOSED: i32 = -1;
/// Exit status of a session whose channel could not be opened.
pub const EXIT_STATUS_OPEN_FAILED: i32 = -2;

/// How the remote command of a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub status: i32,
    /// Set if the command was killed by a signal.
    pub signal: Option<Sig>,
    pub core_dumped: bool,
    pub message: String,
}

impl ExitStatus {
    pub(crate) fn from_code(status: i32) -> Self {
        ExitStatus {
            status,
            signal: None,
            core_dumped: false,
            message: String::new(),
        }
    }

    fn from_signal(signal: Sig, core_dumped: bool, message: String) -> Self {
        // Same convention as POSIX shells.
        let status = signal.number().map(|n| 128 + n).unwrap_or(255);
        ExitStatus {
            status,
            signal: Some(signal),
            core_dumped,
            message,
        }
    }
}

/// The request/response sub-protocol and exit tracking of a session.
pub(crate) struct SessionState {
    blocking: AtomicBool,
    /// Held for as long as a request is waiting for its reply.
    gate: tokio::sync::Mutex<()>,
    pending: Mutex<Option<oneshot::Sender<bool>>>,
    requests_closed: AtomicBool,
    exit: watch::Sender<Option<ExitStatus>>,
    x11_mapping: AtomicBool,
    xon_xoff: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            blocking: AtomicBool::new(true),
            gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            requests_closed: AtomicBool::new(false),
            exit: watch::channel(None).0,
            x11_mapping: AtomicBool::new(false),
            xon_xoff: AtomicBool::new(false),
        }
    }

    /// Requests sent by the server on a session channel.
    pub fn handle_request(&self, channel: &Channel, typ: &str, r: &mut MessageReader) -> bool {
        let result = match typ {
            "exit-status" => r.read_u32().map(|status| {
                self.do_exit(channel, ExitStatus::from_code(status as i32));
            }),
            "exit-signal" => self.exit_signal(channel, r),
            "xon-xoff" => r.read_bool().map(|client_can_do| {
                self.xon_xoff.store(client_can_do, Ordering::Relaxed);
            }),
            "keepalive@openssh.com" | "eow@openssh.com" => Ok(()),
            _ => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "channel {}: malformed {:?} request: {}",
                    channel.id(),
                    typ,
                    e
                );
                false
            }
        }
    }

    fn exit_signal(&self, channel: &Channel, r: &mut MessageReader) -> Result<(), Error> {
        let signal = Sig::from_name(&r.read_string()?);
        let core_dumped = r.read_bool()?;
        let message = r.read_string()?;
        self.do_exit(
            channel,
            ExitStatus::from_signal(signal, core_dumped, message),
        );
        Ok(())
    }

    /// Completes the pending request. Returns `false` if there was none.
    pub fn reply(&self, success: bool) -> bool {
        match lock(&self.pending).take() {
            Some(pending) => {
                let _ = pending.send(success);
                true
            }
            None => false,
        }
    }

    /// Releases the pending request, if any, and refuses new ones.
    pub fn fail_requests(&self) {
        let mut pending = lock(&self.pending);
        self.requests_closed.store(true, Ordering::Release);
        if let Some(pending) = pending.take() {
            let _ = pending.send(false);
        }
    }

    /// Records how the session ended. Only the first call counts.
    pub fn do_exit(&self, channel: &Channel, status: ExitStatus) {
        let mut first = false;
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                debug!("channel {}: exit {:?}", channel.id(), status);
                *exit = Some(status);
                first = true;
                true
            } else {
                false
            }
        });
        if first && self.x11_mapping.swap(false, Ordering::AcqRel) {
            if let Ok(shared) = channel.connection() {
                shared.x11_release(channel.id());
            }
        }
    }
}

/// A session channel: a shell, a command, or a subsystem on the
/// server, with its standard streams.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    channel: Arc<Channel>,
}

impl Deref for SessionChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl SessionChannel {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        SessionChannel { channel }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn state(&self) -> Result<&SessionState, Error> {
        self.channel.session().ok_or(Error::Inconsistent)
    }

    /// In blocking mode (the default), requests wait for the
    /// server's reply. Otherwise they return as soon as they are sent.
    pub fn set_blocking(&self, blocking: bool) -> Result<(), Error> {
        self.state()?.blocking.store(blocking, Ordering::Relaxed);
        Ok(())
    }

    async fn request<F>(&self, typ: &str, reply: bool, body: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut Message) -> Result<(), Error>,
    {
        if self.channel.open_status().await != OpenStatus::Open {
            return Ok(false);
        }
        let session = self.state()?;
        let want_reply = reply && session.blocking.load(Ordering::Relaxed);
        let mut m = self.channel.message(msg::CHANNEL_REQUEST)?;
        m.write_string(typ)?.write_bool(want_reply);
        body(&mut m)?;
        debug!("channel {}: request {:?}", self.id(), typ);
        if !want_reply {
            return self.channel.transmit(m);
        }

        let _gate = session.gate.lock().await;
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = lock(&session.pending);
            if session.requests_closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            *pending = Some(sender);
        }
        match self.channel.transmit(m) {
            Ok(true) => {}
            sent => {
                lock(&session.pending).take();
                return sent;
            }
        }
        Ok(receiver.await.unwrap_or(false))
    }

    pub async fn do_shell(&self) -> Result<bool, Error> {
        self.request("shell", true, |_| Ok(())).await
    }

    pub async fn do_single_command(&self, command: &str) -> Result<bool, Error> {
        self.request("exec", true, |m| {
            m.write_string(command)?;
            Ok(())
        })
        .await
    }

    pub async fn do_subsystem(&self, name: &str) -> Result<bool, Error> {
        self.request("subsystem", true, |m| {
            m.write_string(name)?;
            Ok(())
        })
        .await
    }

    /// Requests a pseudo-terminal. `terminal_modes` are (opcode,
    /// argument) pairs, see RFC 4254, section 8.
    pub async fn request_pty(
        &self,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<bool, Error> {
        let mut modes = Vec::with_capacity(1 + 5 * terminal_modes.len());
        for &(code, value) in terminal_modes {
            modes.push(code);
            modes.extend_from_slice(&value.to_be_bytes());
        }
        // 0 code (to terminate the list)
        modes.push(0);
        self.request("pty-req", true, |m| {
            m.write_string(term)?
                .write_u32(col_width)?
                .write_u32(row_height)?
                .write_u32(pix_width)?
                .write_u32(pix_height)?
                .write_bytes(&modes)?;
            Ok(())
        })
        .await
    }

    pub async fn set_environment(&self, name: &str, value: &str) -> Result<bool, Error> {
        self.request("env", true, |m| {
            m.write_string(name)?.write_string(value)?;
            Ok(())
        })
        .await
    }

    /// Asks the server to forward X11 connections to the display
    /// configured with [`crate::Connection::set_x11_display`]. The
    /// server is handed a fake cookie, replaced by the real one on
    /// each forwarded connection.
    pub async fn request_x11_forward(
        &self,
        single_connection: bool,
        screen: u32,
    ) -> Result<bool, Error> {
        let shared = self.channel.connection()?;
        let session = self.state()?;
        let cookie = shared.x11_grant(self.id(), single_connection);
        session.x11_mapping.store(true, Ordering::Release);
        let granted = self
            .request("x11-req", true, |m| {
                m.write_bool(single_connection)
                    .write_string(MIT_MAGIC_COOKIE)?
                    .write_string(&cookie)?
                    .write_u32(screen)?;
                Ok(())
            })
            .await;
        if !matches!(granted, Ok(true)) && session.x11_mapping.swap(false, Ordering::AcqRel) {
            shared.x11_release(self.id());
        }
        granted
    }

    /// Tells the server the terminal was resized. There is no reply.
    pub async fn send_window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<bool, Error> {
        self.request("window-change", false, |m| {
            m.write_u32(col_width)?
                .write_u32(row_height)?
                .write_u32(pix_width)?
                .write_u32(pix_height)?;
            Ok(())
        })
        .await
    }

    pub async fn send_signal(&self, signal: Sig) -> Result<bool, Error> {
        self.request("signal", false, |m| {
            m.write_string(signal.name())?;
            Ok(())
        })
        .await
    }

    /// Sends a break of `length_ms` milliseconds (RFC 4335).
    pub async fn do_break(&self, length_ms: u32) -> Result<bool, Error> {
        self.request("break", true, |m| {
            m.write_u32(length_ms)?;
            Ok(())
        })
        .await
    }

    /// Waits for the remote command to exit, at most `timeout`
    /// (forever if it is zero). The result is only meaningful if
    /// [`SessionChannel::is_finished`] is true.
    pub async fn wait_for_exit(&self, timeout: Duration) -> i32 {
        let Ok(session) = self.state() else {
            return 0;
        };
        let mut exit = session.exit.subscribe();
        let wait = async move {
            loop {
                let status = exit.borrow_and_update().as_ref().map(|e| e.status);
                if let Some(status) = status {
                    return status;
                }
                if exit.changed().await.is_err() {
                    return 0;
                }
            }
        };
        if timeout.is_zero() {
            wait.await
        } else {
            tokio::time::timeout(timeout, wait).await.unwrap_or(0)
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state().ok()?.exit.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state()
            .map(|s| s.exit.borrow().is_some())
            .unwrap_or(false)
    }

    /// Whether the server allows the client to do flow control.
    pub fn xon_xoff(&self) -> bool {
        self.state()
            .map(|s| s.xon_xoff.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
