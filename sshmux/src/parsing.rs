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
use crate::wire::{Message, MessageReader};
use crate::{msg, ChannelId, ChannelOpenFailure, Error};

#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub typ: ChannelType,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl OpenChannelMessage {
    pub fn parse(r: &mut MessageReader) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc4254#section-5.1
        let typ = r.read_string()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        let typ = match typ.as_str() {
            "session" => ChannelType::Session,
            "x11" => {
                let originator_address = r.read_string()?;
                let originator_port = r.read_u32()?;
                ChannelType::X11 {
                    originator_address,
                    originator_port,
                }
            }
            "direct-tcpip" => ChannelType::DirectTcpip(TcpChannelInfo::parse(r)?),
            "forwarded-tcpip" => ChannelType::ForwardedTcpIp(TcpChannelInfo::parse(r)?),
            "auth-agent@openssh.com" => ChannelType::AgentForward,
            _ => ChannelType::Unknown { typ },
        };

        Ok(Self {
            typ,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }

    /// Confirmation that this channel was opened.
    pub fn confirm(
        &self,
        local: ChannelId,
        window_size: u32,
        packet_size: u32,
    ) -> Result<Message, Error> {
        let mut m = Message::new(msg::CHANNEL_OPEN_CONFIRMATION);
        m.write_u32(self.sender_channel)? // remote channel number.
            .write_u32(local.0)? // our channel number.
            .write_u32(window_size)?
            .write_u32(packet_size)?;
        Ok(m)
    }

    pub fn fail(&self, reason: ChannelOpenFailure, description: &str) -> Result<Message, Error> {
        let mut m = Message::new(msg::CHANNEL_OPEN_FAILURE);
        m.write_u32(self.sender_channel)?
            .write_u32(reason as u32)?
            .write_string(description)?
            .write_string("en")?;
        Ok(m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    Session,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    DirectTcpip(TcpChannelInfo),
    ForwardedTcpIp(TcpChannelInfo),
    AgentForward,
    Unknown {
        typ: String,
    },
}

impl ChannelType {
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::X11 { .. } => "x11",
            ChannelType::DirectTcpip(_) => "direct-tcpip",
            ChannelType::ForwardedTcpIp(_) => "forwarded-tcpip",
            ChannelType::AgentForward => "auth-agent@openssh.com",
            ChannelType::Unknown { typ } => typ.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpChannelInfo {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl TcpChannelInfo {
    fn parse(r: &mut MessageReader) -> Result<Self, Error> {
        let host_to_connect = r.read_string()?;
        let port_to_connect = r.read_u32()?;
        let originator_address = r.read_string()?;
        let originator_port = r.read_u32()?;

        Ok(Self {
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        })
    }

    pub(crate) fn write(&self, m: &mut Message) -> Result<(), Error> {
        m.write_string(&self.host_to_connect)?
            .write_u32(self.port_to_connect)?
            .write_string(&self.originator_address)?
            .write_u32(self.originator_port)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Parses what follows the recipient channel.
    pub fn parse(r: &mut MessageReader) -> Result<Self, Error> {
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        Ok(Self {
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

#[derive(Debug)]
pub(crate) struct ChannelOpenFailureMessage {
    pub reason: ChannelOpenFailure,
    pub description: String,
}

impl ChannelOpenFailureMessage {
    pub fn parse(r: &mut MessageReader) -> Result<Self, Error> {
        let reason =
            ChannelOpenFailure::from_u32(r.read_u32()?).unwrap_or(ChannelOpenFailure::Unknown);
        // Some implementations truncate the message after the reason code.
        let description = r.read_string().unwrap_or_default();
        Ok(Self {
            reason,
            description,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn open(typ: &str, extra: impl FnOnce(&mut Message)) -> Message {
        let mut m = Message::new(msg::CHANNEL_OPEN);
        m.write_string(typ)
            .unwrap()
            .write_u32(3)
            .unwrap()
            .write_u32(1000)
            .unwrap()
            .write_u32(500)
            .unwrap();
        extra(&mut m);
        m
    }

    #[test]
    fn parse_forwarded_tcpip() {
        let info = TcpChannelInfo {
            host_to_connect: "0.0.0.0".into(),
            port_to_connect: 8080,
            originator_address: "10.0.0.2".into(),
            originator_port: 51000,
        };
        let m = open("forwarded-tcpip", |m| info.write(m).unwrap());
        let open = OpenChannelMessage::parse(&mut m.reader()).unwrap();
        assert_eq!(open.sender_channel, 3);
        assert_eq!(open.initial_window_size, 1000);
        assert_eq!(open.maximum_packet_size, 500);
        assert_eq!(open.typ, ChannelType::ForwardedTcpIp(info));
    }

    #[test]
    fn unknown_type_keeps_name() {
        let m = open("tun@openssh.com", |_| {});
        let open = OpenChannelMessage::parse(&mut m.reader()).unwrap();
        assert_eq!(open.typ.name(), "tun@openssh.com");
    }

    #[test]
    fn failure_reply() {
        let m = open("session", |_| {});
        let open = OpenChannelMessage::parse(&mut m.reader()).unwrap();
        let reply = open
            .fail(ChannelOpenFailure::AdministrativelyProhibited, "no")
            .unwrap();
        let mut r = reply.reader();
        assert_eq!(reply.msg_type(), msg::CHANNEL_OPEN_FAILURE);
        assert_eq!(r.read_u32().unwrap(), 3);
        let failure = ChannelOpenFailureMessage::parse(&mut r).unwrap();
        assert_eq!(failure.reason, ChannelOpenFailure::AdministrativelyProhibited);
        assert_eq!(failure.description, "no");
    }
}
