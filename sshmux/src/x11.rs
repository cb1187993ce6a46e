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

//! X11 forwarding: where the local display is, and how forwarded
//! clients are authenticated against it.

use std::path::PathBuf;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use data_encoding::HEXLOWER;
use log::debug;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::channels::{ChannelIo, StreamFilter};
use crate::{forward, ChannelId, Error};

/// The only authentication protocol we forward.
pub const MIT_MAGIC_COOKIE: &str = "MIT-MAGIC-COOKIE-1";

const X11_BASE_PORT: u32 = 6000;
const X11_UNIX_DIR: &str = "/tmp/.X11-unix";
const FAKE_COOKIE_LEN: usize = 16;

/// A local X server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X11Display {
    Unix { path: PathBuf },
    Tcp { host: String, port: u32 },
}

impl X11Display {
    /// Parses a `DISPLAY` value: `:0`, `:0.1`, `unix:0`, `host:10`,
    /// or a socket path as set by some launchers.
    pub fn parse(display: &str) -> Result<Self, Error> {
        if display.starts_with('/') {
            return Ok(X11Display::Unix {
                path: PathBuf::from(display),
            });
        }
        let invalid = || Error::InvalidDisplay(display.to_string());
        let (host, rest) = display.rsplit_once(':').ok_or_else(invalid)?;
        let number = rest.split('.').next().unwrap_or_default();
        let number: u32 = number.parse().map_err(|_| invalid())?;
        if host.is_empty() || host == "unix" {
            Ok(X11Display::Unix {
                path: PathBuf::from(format!("{}/X{}", X11_UNIX_DIR, number)),
            })
        } else {
            let port = number
                .checked_add(X11_BASE_PORT)
                .filter(|port| *port <= u16::MAX as u32)
                .ok_or_else(invalid)?;
            Ok(X11Display::Tcp {
                host: host.to_string(),
                port,
            })
        }
    }

    pub(crate) async fn connect(&self, timeout: Option<Duration>) -> Result<ChannelIo, Error> {
        debug!("connecting to X11 display {:?}", self);
        match self {
            X11Display::Tcp { host, port } => Ok(ChannelIo::from_stream(
                forward::connect_tcp(host, *port, timeout).await?,
            )),
            #[cfg(unix)]
            X11Display::Unix { path } => {
                let connect = tokio::net::UnixStream::connect(path);
                let stream = match timeout {
                    Some(t) => tokio::time::timeout(t, connect).await??,
                    None => connect.await?,
                };
                Ok(ChannelIo::from_stream(stream))
            }
            #[cfg(not(unix))]
            X11Display::Unix { path } => Err(Error::InvalidDisplay(path.display().to_string())),
        }
    }
}

#[derive(Debug)]
struct Mapping {
    owner: ChannelId,
    single: bool,
}

/// Cookies and forwarding grant of a connection.
#[derive(Debug)]
pub(crate) struct X11State {
    display: Option<X11Display>,
    real_cookie: Vec<u8>,
    fake_cookie: Vec<u8>,
    mapping: Option<Mapping>,
}

impl X11State {
    pub fn new() -> Self {
        let mut fake_cookie = vec![0; FAKE_COOKIE_LEN];
        rand::thread_rng().fill_bytes(&mut fake_cookie);
        X11State {
            display: None,
            real_cookie: Vec::new(),
            fake_cookie,
            mapping: None,
        }
    }

    pub fn set_display(&mut self, display: X11Display) {
        self.display = Some(display);
    }

    pub fn set_real_cookie(&mut self, cookie: Vec<u8>) {
        self.real_cookie = cookie;
    }

    pub fn display(&self) -> Option<&X11Display> {
        self.display.as_ref()
    }

    pub fn fake_cookie(&self) -> String {
        HEXLOWER.encode(&self.fake_cookie)
    }

    /// Allows X11 channels on behalf of session `owner`, returns the
    /// cookie to hand to the server.
    pub fn grant(&mut self, owner: ChannelId, single: bool) -> String {
        self.mapping = Some(Mapping { owner, single });
        self.fake_cookie()
    }

    pub fn release(&mut self, owner: ChannelId) {
        if self.mapping.as_ref().is_some_and(|m| m.owner == owner) {
            debug!("X11 forwarding of {} released", owner);
            self.mapping = None;
        }
    }

    /// Admits one inbound X11 channel. A single-use grant is consumed.
    pub fn take_mapping(&mut self) -> bool {
        match &self.mapping {
            None => false,
            Some(m) if m.single => {
                self.mapping = None;
                true
            }
            Some(_) => true,
        }
    }

    pub fn filter(&self) -> CookieFilter {
        CookieFilter::new(self.fake_cookie.clone(), self.real_cookie.clone())
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Checks the authentication data at the beginning of a forwarded
/// X11 connection, and replaces the fake cookie with the real one.
///
/// The connection setup starts with a 12-byte header: byte order,
/// padding, protocol major and minor versions, then the lengths of
/// the authorization protocol name and data, each padded to 4 bytes.
pub struct CookieFilter {
    fake: Vec<u8>,
    real: Vec<u8>,
    header: Vec<u8>,
    done: bool,
}

impl CookieFilter {
    pub fn new(fake: Vec<u8>, real: Vec<u8>) -> Self {
        CookieFilter {
            fake,
            real,
            header: Vec::new(),
            done: false,
        }
    }

    fn check(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let name = self.header.get(6..8).ok_or(Error::Inconsistent)?;
        let data = self.header.get(8..10).ok_or(Error::Inconsistent)?;
        let (name_len, data_len) = match self.header.first() {
            Some(b'B') => (BigEndian::read_u16(name), BigEndian::read_u16(data)),
            Some(b'l') => (LittleEndian::read_u16(name), LittleEndian::read_u16(data)),
            _ => return Err(Error::Filter("bad X11 byte order".into())),
        };
        let (name_len, data_len) = (name_len as usize, data_len as usize);
        let data_start = 12 + pad4(name_len);
        let total = data_start + pad4(data_len);
        if self.header.len() < total {
            return Ok(None);
        }
        if self.header.get(12..12 + name_len) != Some(MIT_MAGIC_COOKIE.as_bytes()) {
            return Err(Error::Filter("unsupported X11 authentication".into()));
        }
        let data = self
            .header
            .get_mut(data_start..data_start + data_len)
            .ok_or(Error::Inconsistent)?;
        if !bool::from(data.ct_eq(&self.fake)) {
            return Err(Error::Filter("X11 cookie mismatch".into()));
        }
        if self.real.len() != data_len {
            return Err(Error::Filter("X11 cookie length mismatch".into()));
        }
        data.copy_from_slice(&self.real);
        self.done = true;
        Ok(Some(std::mem::take(&mut self.header)))
    }
}

impl StreamFilter for CookieFilter {
    fn inbound(&mut self, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        if self.done {
            return Ok(data);
        }
        self.header.extend_from_slice(&data);
        if self.header.len() < 12 {
            return Ok(Vec::new());
        }
        Ok(self.check()?.unwrap_or_default())
    }
}
