// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SMP command set and its text encoding.
//!
//! A transmission is `(signature, (conn_id, command))`. The command keyword
//! and its parameters live on one line; byte parameters (keys, ids, bodies)
//! are base64 so the framing layer stays line-oriented.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

use crate::error::ErrorKind;

/// Opaque broker-generated identifier (queue or message id).
pub type EntityId = Bytes;

/// Party public key. Opaque to the broker; only the verification seam
/// interprets it.
pub type PublicKey = Bytes;

/// The three roles a command can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Recipient,
    Sender,
    Broker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // Client → broker, recipient party.
    Conn(PublicKey),
    Sub,
    Key(PublicKey),
    Ack,
    Off,
    Del,
    // Client → broker, sender party.
    Send(Bytes),
    // Broker → client.
    Ids { recipient_id: EntityId, sender_id: EntityId },
    Msg { msg_id: EntityId, ts: u64, body: Bytes },
    End,
    Ok,
    Err(ErrorKind),
}

impl Command {
    pub fn party(&self) -> Party {
        match self {
            Self::Conn(_) | Self::Sub | Self::Key(_) | Self::Ack | Self::Off | Self::Del => {
                Party::Recipient
            }
            Self::Send(_) => Party::Sender,
            Self::Ids { .. } | Self::Msg { .. } | Self::End | Self::Ok | Self::Err(_) => {
                Party::Broker
            }
        }
    }

    /// Render the command in wire form (keyword plus base64 parameters).
    pub fn encode(&self) -> String {
        match self {
            Self::Conn(key) => format!("CONN {}", b64(key)),
            Self::Sub => "SUB".into(),
            Self::Key(key) => format!("KEY {}", b64(key)),
            Self::Ack => "ACK".into(),
            Self::Off => "OFF".into(),
            Self::Del => "DEL".into(),
            Self::Send(body) => format!("SEND {}", b64(body)),
            Self::Ids { recipient_id, sender_id } => {
                format!("IDS {} {}", b64(recipient_id), b64(sender_id))
            }
            Self::Msg { msg_id, ts, body } => {
                format!("MSG {} {} {}", b64(msg_id), ts, b64(body))
            }
            Self::End => "END".into(),
            Self::Ok => "OK".into(),
            Self::Err(kind) => format!("ERR {}", kind.as_str()),
        }
    }

    /// Parse the wire form. Any malformation is a `BLOCK` error; the broker
    /// echoes it in the transmission's response slot.
    pub fn parse(input: &str) -> Result<Self, ErrorKind> {
        let mut parts = input.split(' ');
        let keyword = parts.next().unwrap_or("");
        let command = match keyword {
            "CONN" => Self::Conn(bytes_param(parts.next())?),
            "SUB" => Self::Sub,
            "KEY" => Self::Key(bytes_param(parts.next())?),
            "ACK" => Self::Ack,
            "OFF" => Self::Off,
            "DEL" => Self::Del,
            "SEND" => Self::Send(bytes_param(parts.next())?),
            "IDS" => Self::Ids {
                recipient_id: bytes_param(parts.next())?,
                sender_id: bytes_param(parts.next())?,
            },
            "MSG" => Self::Msg {
                msg_id: bytes_param(parts.next())?,
                ts: int_param(parts.next())?,
                body: bytes_param(parts.next())?,
            },
            "END" => Self::End,
            "OK" => Self::Ok,
            "ERR" => {
                let kind = parts.next().and_then(ErrorKind::parse).ok_or(ErrorKind::Block)?;
                Self::Err(kind)
            }
            _ => return Err(ErrorKind::Block),
        };
        if parts.next().is_some() {
            return Err(ErrorKind::Block);
        }
        Ok(command)
    }
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn bytes_param(token: Option<&str>) -> Result<Bytes, ErrorKind> {
    let token = token.ok_or(ErrorKind::Block)?;
    STANDARD.decode(token).map(Bytes::from).map_err(|_| ErrorKind::Block)
}

fn int_param(token: Option<&str>) -> Result<u64, ErrorKind> {
    token.ok_or(ErrorKind::Block)?.parse().map_err(|_| ErrorKind::Block)
}

/// Truncated base64 rendering of an opaque id for log fields.
pub fn short_id(id: &[u8]) -> String {
    let mut rendered = STANDARD.encode(id);
    rendered.truncate(8);
    rendered
}

#[cfg(test)]
#[path = "proto_tests.rs"]
mod tests;
