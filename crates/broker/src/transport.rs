// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire framing.
//!
//! One transmission per CRLF-terminated line: `<signature> <conn_id> <command>`,
//! the first two fields base64 (an empty field encodes as the empty string).
//! Framing problems never kill the connection — they surface as a `BLOCK`
//! error in the transmission's command slot so the session can answer in the
//! same wire position. Only transport loss (EOF, I/O error) ends the stream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ErrorKind;
use crate::proto::{Command, EntityId};

/// A decoded inbound transmission. `command` holds the framing verdict:
/// a parsed command, or the error to echo in its response slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub signature: Bytes,
    pub conn_id: EntityId,
    pub command: Result<Command, ErrorKind>,
}

/// Read one transmission. `None` on a cleanly closed stream.
pub async fn read_transmission<R>(reader: &mut R) -> std::io::Result<Option<Transmission>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let parsed = match std::str::from_utf8(&line) {
        Ok(text) => parse_line(text.trim_end_matches(['\r', '\n'])),
        Err(_) => malformed(),
    };
    Ok(Some(parsed))
}

/// Write one broker-origin transmission. The broker never signs; the
/// signature field goes out empty.
pub async fn write_transmission<W>(
    writer: &mut W,
    conn_id: &EntityId,
    command: &Command,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = format!(" {} {}\r\n", STANDARD.encode(conn_id), command.encode());
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn parse_line(line: &str) -> Transmission {
    let mut fields = line.splitn(3, ' ');
    let signature = fields.next().map(decode_field);
    let conn_id = fields.next().map(decode_field);
    let rest = fields.next();

    match (signature, conn_id) {
        (Some(Ok(signature)), Some(Ok(conn_id))) => {
            let command = match rest {
                Some(rest) => Command::parse(rest),
                None => Err(ErrorKind::Block),
            };
            Transmission { signature, conn_id, command }
        }
        // Keep a decodable conn id if we got one, so the error still lands
        // on the right response slot.
        (_, Some(Ok(conn_id))) => {
            Transmission { signature: Bytes::new(), conn_id, command: Err(ErrorKind::Block) }
        }
        _ => malformed(),
    }
}

fn malformed() -> Transmission {
    Transmission { signature: Bytes::new(), conn_id: Bytes::new(), command: Err(ErrorKind::Block) }
}

fn decode_field(token: &str) -> Result<Bytes, ErrorKind> {
    STANDARD.decode(token).map(Bytes::from).map_err(|_| ErrorKind::Block)
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
