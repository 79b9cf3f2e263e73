// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber registry.
//!
//! One binding per recipient id: the session currently entitled to message
//! pushes. Sessions publish a [`Subscribed`] claim onto a bounded feed; a
//! single broker task drains it, notifies a displaced holder with `END`
//! through that session's own inbound queue, installs the new binding, and
//! then signals the claimant. A fresh subscriber awaits that signal before
//! its first delivery, so the loser's `END` is in flight before the winner
//! can see any `MSG`. Routing the notification through the loser's inbound
//! queue keeps all subscription teardown inside the owning session's task —
//! no task ever mutates another session's subscription map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::proto::{short_id, Command, EntityId};

/// Push access to one session's inbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Process-unique session number; used to recognize re-subscription by
    /// the same session (which must not be notified of its own binding).
    pub session_id: u64,
    pub push_tx: mpsc::Sender<(EntityId, Command)>,
}

/// Feed element: a session claiming a recipient id.
#[derive(Debug)]
pub struct Subscribed {
    pub recipient_id: EntityId,
    pub client: ClientHandle,
    /// Fired once the binding is installed and any displaced holder has its
    /// `END` enqueued.
    pub done: oneshot::Sender<()>,
}

pub struct SubscriberRegistry {
    bindings: Mutex<HashMap<EntityId, ClientHandle>>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self { bindings: Mutex::new(HashMap::new()) }
    }

    /// Install a binding. Returns the displaced holder when the previous
    /// binding belongs to a different session.
    pub async fn bind(&self, recipient_id: EntityId, client: ClientHandle) -> Option<ClientHandle> {
        let session_id = client.session_id;
        let mut bindings = self.bindings.lock().await;
        let prev = bindings.insert(recipient_id, client);
        prev.filter(|p| p.session_id != session_id)
    }

    /// Drop the binding, but only while still owned by `session_id`. A stale
    /// binding left by a displaced or dead session heals on the next bind.
    pub async fn unbind(&self, recipient_id: &EntityId, session_id: u64) {
        let mut bindings = self.bindings.lock().await;
        if bindings.get(recipient_id).is_some_and(|h| h.session_id == session_id) {
            bindings.remove(recipient_id);
        }
    }
}

/// Drain the subscription feed until shutdown, pushing `END` at each
/// displaced holder before acknowledging the claim.
pub async fn run(
    registry: Arc<SubscriberRegistry>,
    mut feed: mpsc::Receiver<Subscribed>,
    shutdown: CancellationToken,
) {
    debug!("subscriber registry started");
    loop {
        let Subscribed { recipient_id, client, done } = tokio::select! {
            item = feed.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let session_id = client.session_id;
        if let Some(prev) = registry.bind(recipient_id.clone(), client).await {
            debug!(
                queue = %short_id(&recipient_id),
                from = prev.session_id,
                to = session_id,
                "subscriber displaced"
            );
            let _ = prev.push_tx.send((recipient_id, Command::End)).await;
        }
        let _ = done.send(());
    }
    debug!("subscriber registry stopped");
}
