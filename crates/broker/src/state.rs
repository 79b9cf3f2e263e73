// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide broker state.
//!
//! One [`Store`] exists per broker process, created at startup and shared by
//! every session via `Arc`. Nothing here is persisted; restart forgets all
//! queues and messages. Tests build a fresh store per case.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::{KeyMatchVerifier, SignatureVerifier};
use crate::config::Config;
use crate::connstore::ConnStore;
use crate::ident::IdGenerator;
use crate::msgstore::MessageStore;
use crate::registry::{Subscribed, SubscriberRegistry};

pub struct Store {
    /// Bound of every in-process queue (session in/out, subscription feed,
    /// per-queue message FIFO).
    pub queue_size: usize,
    pub queue_id_bytes: usize,
    pub msg_id_bytes: usize,
    pub ids: IdGenerator,
    pub conns: ConnStore,
    pub messages: MessageStore,
    pub registry: Arc<SubscriberRegistry>,
    /// Producer side of the subscription feed drained by [`crate::registry::run`].
    pub subscribed_tx: mpsc::Sender<Subscribed>,
    pub verifier: Box<dyn SignatureVerifier>,
    next_session_id: AtomicU64,
}

impl Store {
    /// Build the store and the subscription-feed receiver for the registry
    /// task, with the reference signature verifier.
    pub fn new(config: &Config) -> (Arc<Self>, mpsc::Receiver<Subscribed>) {
        Self::with_verifier(config, Box::new(KeyMatchVerifier))
    }

    pub fn with_verifier(
        config: &Config,
        verifier: Box<dyn SignatureVerifier>,
    ) -> (Arc<Self>, mpsc::Receiver<Subscribed>) {
        let (subscribed_tx, subscribed_rx) = mpsc::channel(config.queue_size);
        let store = Arc::new(Self {
            queue_size: config.queue_size,
            queue_id_bytes: config.queue_id_bytes,
            msg_id_bytes: config.msg_id_bytes,
            ids: IdGenerator::new(),
            conns: ConnStore::new(),
            messages: MessageStore::new(config.queue_size),
            registry: Arc::new(SubscriberRegistry::new()),
            subscribed_tx,
            verifier,
            next_session_id: AtomicU64::new(1),
        });
        (store, subscribed_rx)
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}
