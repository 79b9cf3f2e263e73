// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection store: the registry of live message queues.
//!
//! Every record is reachable through both of its ids — recipient id as the
//! primary key, sender id as a secondary unique key routing `SEND`. Both
//! indexes live under one lock, so no reader ever observes a half-installed
//! or half-removed record. Failed lookups are `AUTH`, never "not found":
//! existence must not leak to unauthorized parties.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::proto::{EntityId, Party, PublicKey};

/// Whether a queue accepts new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Off,
}

/// One message queue record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub recipient_id: EntityId,
    pub sender_id: EntityId,
    pub recipient_key: PublicKey,
    /// Absent until `KEY` secures the queue; once set, never replaced.
    pub sender_key: Option<PublicKey>,
    pub status: QueueState,
}

#[derive(Default)]
struct Indexes {
    by_recipient: HashMap<EntityId, Connection>,
    /// sender id → recipient id of the owning record.
    by_sender: HashMap<EntityId, EntityId>,
}

pub struct ConnStore {
    inner: RwLock<Indexes>,
}

impl Default for ConnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Indexes::default()) }
    }

    /// Install a new record iff neither id appears anywhere among live
    /// records. Any collision is `DUPLICATE`; the caller retries with fresh
    /// ids.
    pub async fn add(
        &self,
        recipient_key: PublicKey,
        recipient_id: EntityId,
        sender_id: EntityId,
    ) -> Result<(), ErrorKind> {
        let mut ix = self.inner.write().await;
        for id in [&recipient_id, &sender_id] {
            if ix.by_recipient.contains_key(id) || ix.by_sender.contains_key(id) {
                return Err(ErrorKind::Duplicate);
            }
        }
        ix.by_sender.insert(sender_id.clone(), recipient_id.clone());
        ix.by_recipient.insert(
            recipient_id.clone(),
            Connection {
                recipient_id,
                sender_id,
                recipient_key,
                sender_key: None,
                status: QueueState::Active,
            },
        );
        Ok(())
    }

    /// Snapshot of the record addressed by `id` for the given party.
    pub async fn get(&self, party: Party, id: &EntityId) -> Result<Connection, ErrorKind> {
        let ix = self.inner.read().await;
        let conn = match party {
            Party::Recipient => ix.by_recipient.get(id),
            Party::Sender => ix.by_sender.get(id).and_then(|rid| ix.by_recipient.get(rid)),
            Party::Broker => None,
        };
        conn.cloned().ok_or(ErrorKind::Auth)
    }

    /// Install the sender key iff currently unset. Re-keying is `AUTH`, even
    /// with the same key.
    pub async fn secure(
        &self,
        recipient_id: &EntityId,
        sender_key: PublicKey,
    ) -> Result<(), ErrorKind> {
        let mut ix = self.inner.write().await;
        let conn = ix.by_recipient.get_mut(recipient_id).ok_or(ErrorKind::Auth)?;
        if conn.sender_key.is_some() {
            return Err(ErrorKind::Auth);
        }
        conn.sender_key = Some(sender_key);
        Ok(())
    }

    /// Turn the queue off; subsequent `SEND`s fail with `AUTH`.
    pub async fn suspend(&self, recipient_id: &EntityId) -> Result<(), ErrorKind> {
        let mut ix = self.inner.write().await;
        let conn = ix.by_recipient.get_mut(recipient_id).ok_or(ErrorKind::Auth)?;
        conn.status = QueueState::Off;
        Ok(())
    }

    /// Remove the record from both indexes. Returns it so the caller can
    /// tear down the message queue and subscriptions.
    pub async fn delete(&self, recipient_id: &EntityId) -> Result<Connection, ErrorKind> {
        let mut ix = self.inner.write().await;
        let conn = ix.by_recipient.remove(recipient_id).ok_or(ErrorKind::Auth)?;
        ix.by_sender.remove(&conn.sender_id);
        Ok(conn)
    }
}

#[cfg(test)]
#[path = "connstore_tests.rs"]
mod tests;
