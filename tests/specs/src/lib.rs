// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Support library for end-to-end broker specs: an in-process broker bound
//! to an ephemeral TCP port, and a minimal wire client speaking one
//! transmission per line.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use smpd::config::Config;
use smpd::proto::{Command, EntityId};
use smpd::run;
use smpd::state::Store;
use smpd::transport;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-process broker serving real TCP connections.
pub struct Broker {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Broker {
    pub async fn start() -> anyhow::Result<Self> {
        Self::with_config(Config::test()).await
    }

    pub async fn with_config(config: Config) -> anyhow::Result<Self> {
        run::init_tracing(&config);
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let (store, feed_rx) = Store::new(&config);
        tokio::spawn(run::serve(listener, store, feed_rx, shutdown.clone()));
        Ok(Self { addr, shutdown })
    }

    pub async fn client(&self) -> anyhow::Result<Client> {
        let stream = TcpStream::connect(self.addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Client { reader: BufReader::new(reader), writer })
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One wire connection to the broker.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Send one transmission: `(signature, (conn_id, command))`.
    pub async fn transmit(
        &mut self,
        signature: &[u8],
        conn_id: &[u8],
        command: &Command,
    ) -> anyhow::Result<()> {
        let line = format!(
            "{} {} {}\r\n",
            STANDARD.encode(signature),
            STANDARD.encode(conn_id),
            command.encode()
        );
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive one broker transmission.
    pub async fn receive(&mut self) -> anyhow::Result<(EntityId, Command)> {
        let t = tokio::time::timeout(RECV_TIMEOUT, transport::read_transmission(&mut self.reader))
            .await??
            .ok_or_else(|| anyhow::anyhow!("broker closed the connection"))?;
        let command = t.command.map_err(|e| anyhow::anyhow!("unparsable broker reply: {e}"))?;
        Ok((t.conn_id, command))
    }

    /// Receive and expect exactly the given reply.
    pub async fn expect(&mut self, conn_id: &EntityId, command: Command) -> anyhow::Result<()> {
        let (got_id, got) = self.receive().await?;
        anyhow::ensure!(
            got_id == *conn_id && got == command,
            "expected ({conn_id:?}, {command:?}), got ({got_id:?}, {got:?})"
        );
        Ok(())
    }

    /// CONN with the given recipient key; returns `(recipient_id, sender_id)`.
    pub async fn create_queue(
        &mut self,
        recipient_key: &[u8],
    ) -> anyhow::Result<(EntityId, EntityId)> {
        self.transmit(b"", b"", &Command::Conn(Bytes::copy_from_slice(recipient_key))).await?;
        match self.receive().await? {
            (conn_id, Command::Ids { recipient_id, sender_id }) => {
                anyhow::ensure!(conn_id == recipient_id, "IDS must carry the new recipient id");
                Ok((recipient_id, sender_id))
            }
            (_, other) => anyhow::bail!("expected IDS, got {other:?}"),
        }
    }
}

/// The body of a `MSG`, or an error for anything else.
pub fn msg_body(command: &Command) -> anyhow::Result<Bytes> {
    match command {
        Command::Msg { body, .. } => Ok(body.clone()),
        other => anyhow::bail!("expected MSG, got {other:?}"),
    }
}
