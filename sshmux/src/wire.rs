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

//! Decoded SSH messages, as exchanged with the transport layer.

use std::fmt::{Debug, Formatter};

use ssh_encoding::{Decode, Encode};

use crate::Error;

/// A single connection-protocol message: a type byte followed by
/// its payload, without any of the transport framing.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u8) -> Self {
        Message { buf: vec![msg_type] }
    }

    /// Wraps an already encoded message. The first byte is the
    /// message type.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, Error> {
        if buf.is_empty() {
            return Err(Error::Inconsistent);
        }
        Ok(Message { buf })
    }

    pub fn msg_type(&self) -> u8 {
        self.buf.first().copied().unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Length of the message, type byte included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= 1
    }

    /// A reader positioned right after the type byte.
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(self.buf.get(1..).unwrap_or_default())
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(v as u8)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<&mut Self, Error> {
        v.encode(&mut self.buf)?;
        Ok(self)
    }

    pub fn write_string(&mut self, v: &str) -> Result<&mut Self, Error> {
        v.encode(&mut self.buf)?;
        Ok(self)
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<&mut Self, Error> {
        v.encode(&mut self.buf)?;
        Ok(self)
    }

    /// Appends raw bytes, without a length prefix.
    pub fn extend(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type())
            .field("len", &self.buf.len())
            .finish()
    }
}

impl From<Message> for Vec<u8> {
    fn from(m: Message) -> Vec<u8> {
        m.buf
    }
}

/// Cursor over the payload of a [`Message`].
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    rest: &'a [u8],
    len: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(rest: &'a [u8]) -> Self {
        MessageReader { rest, len: rest.len() }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.len - self.rest.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(u8::decode(&mut self.rest)?)
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::decode(&mut self.rest)?)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        let bytes = self.read_bytes()?;
        Ok(std::str::from_utf8(&bytes)?.to_string())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
        Ok(Vec::<u8>::decode(&mut self.rest)?)
    }

    /// Whatever has not been read yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    pub fn is_finished(&self) -> bool {
        self.rest.is_empty()
    }
}
