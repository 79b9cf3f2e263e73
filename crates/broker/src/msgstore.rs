// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-queue message store.
//!
//! Each recipient id owns one bounded FIFO, created lazily on first
//! reference and independent of connection lifetime. Writers get an error
//! (never back-pressure) when the bound is hit, so a sender can never stall
//! another party's session. Delivery throttling is not the queue's job — the
//! session's `delivered` latch owns that.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::ErrorKind;
use crate::proto::EntityId;

/// An in-flight message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_id: EntityId,
    /// Unix epoch milliseconds at write time.
    pub ts: u64,
    pub body: Bytes,
}

/// Bounded FIFO of in-flight messages for one recipient id.
pub struct MessageQueue {
    bound: usize,
    inner: Mutex<VecDeque<Message>>,
    arrived: Notify,
}

impl MessageQueue {
    fn new(bound: usize) -> Self {
        Self { bound, inner: Mutex::new(VecDeque::new()), arrived: Notify::new() }
    }

    /// Append to the tail. `QUOTA` when the bound is reached.
    pub async fn write(&self, msg: Message) -> Result<(), ErrorKind> {
        {
            let mut queue = self.inner.lock().await;
            if queue.len() >= self.bound {
                return Err(ErrorKind::Quota);
            }
            queue.push_back(msg);
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    /// Non-removing read of the head.
    pub async fn try_peek(&self) -> Option<Message> {
        self.inner.lock().await.front().cloned()
    }

    /// Remove the head, then read the new head. One atomic step, so an ACK
    /// consumes and looks for the next message without a gap.
    pub async fn try_del_peek(&self) -> Option<Message> {
        let mut queue = self.inner.lock().await;
        queue.pop_front();
        queue.front().cloned()
    }

    /// Suspend until a message exists; return it without removing it.
    pub async fn peek_blocking(&self) -> Message {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            // Register for wakeups before the check so a write between the
            // check and the await cannot be missed.
            arrived.as_mut().enable();
            if let Some(msg) = self.try_peek().await {
                return msg;
            }
            arrived.await;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// All live message queues, keyed by recipient id.
pub struct MessageStore {
    bound: usize,
    queues: RwLock<HashMap<EntityId, Arc<MessageQueue>>>,
}

impl MessageStore {
    pub fn new(bound: usize) -> Self {
        Self { bound, queues: RwLock::new(HashMap::new()) }
    }

    /// The queue for `recipient_id`, created empty on first reference.
    pub async fn get_or_create(&self, recipient_id: &EntityId) -> Arc<MessageQueue> {
        if let Some(queue) = self.queues.read().await.get(recipient_id) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(recipient_id.clone())
            .or_insert_with(|| Arc::new(MessageQueue::new(self.bound)));
        Arc::clone(queue)
    }

    /// Drop the queue and every message in it (connection deletion).
    pub async fn remove(&self, recipient_id: &EntityId) {
        self.queues.write().await.remove(recipient_id);
    }
}

#[cfg(test)]
#[path = "msgstore_tests.rs"]
mod tests;
