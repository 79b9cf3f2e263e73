// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client session engine.
//!
//! Each connection runs three cooperating tasks wired by bounded queues:
//! receive (frame + verify → inbound), process (dispatch → outbound), and
//! send (outbound → frame). The first task to stop tears the whole session
//! down; shared stores are left untouched, so queues and their messages
//! survive the session.
//!
//! The inbound queue carries broker-origin commands too: the subscriber
//! registry pushes `END` at a displaced session through it, and the receive
//! task folds framing/authorization failures into it as `ERR`. Dispatch
//! therefore sees one uniform stream, and all subscription teardown happens
//! on the session's own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connstore::QueueState;
use crate::error::ErrorKind;
use crate::msgstore::{Message, MessageQueue};
use crate::proto::{short_id, Command, EntityId, Party, PublicKey};
use crate::registry::{ClientHandle, Subscribed};
use crate::state::Store;
use crate::transport::{self, Transmission};

/// Background waiter slot of one subscription. The `Starting` step closes
/// the window between deciding to spawn and recording the handle, so a
/// second waiter can never be spawned for the same queue.
enum Waiter {
    Idle,
    Starting,
    Running(JoinHandle<()>),
}

struct Subscription {
    /// Head message has been delivered and awaits ACK. While set, no second
    /// `MSG` may go out for this queue.
    delivered: bool,
    waiter: Waiter,
}

/// Which head operation feeds a delivery attempt.
enum HeadOp {
    /// Read the head (SUB path).
    Peek,
    /// Drop the head, then read the next (ACK path).
    DelPeek,
}

/// Shared handles of one session, cloned into its tasks and waiters.
#[derive(Clone)]
struct SessionCtx {
    store: Arc<Store>,
    session_id: u64,
    subs: Arc<Mutex<HashMap<EntityId, Subscription>>>,
    rcv_tx: mpsc::Sender<(EntityId, Command)>,
    snd_tx: mpsc::Sender<(EntityId, Command)>,
    shutdown: CancellationToken,
}

/// Run one client session to completion on any `AsyncRead + AsyncWrite`
/// stream (TCP in production, in-memory duplex in tests).
pub async fn run<S>(stream: S, store: Arc<Store>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session_id = store.next_session_id();
    let queue_size = store.queue_size;
    let (read_half, write_half) = tokio::io::split(stream);
    let (rcv_tx, rcv_rx) = mpsc::channel(queue_size);
    let (snd_tx, snd_rx) = mpsc::channel(queue_size);
    let shutdown = CancellationToken::new();

    let ctx = SessionCtx {
        store,
        session_id,
        subs: Arc::new(Mutex::new(HashMap::new())),
        rcv_tx,
        snd_tx,
        shutdown: shutdown.clone(),
    };

    debug!(session = session_id, "session started");

    let mut receive = tokio::spawn(receive_loop(BufReader::new(read_half), ctx.clone()));
    let mut send = tokio::spawn(send_loop(write_half, snd_rx, shutdown.clone()));
    let mut process = tokio::spawn(process_loop(ctx.clone(), rcv_rx));

    // Any task finishing (transport loss, channel closure) ends the session.
    tokio::select! {
        _ = &mut receive => {}
        _ = &mut send => {}
        _ = &mut process => {}
    }
    shutdown.cancel();
    receive.abort();
    send.abort();
    process.abort();

    // Forfeit all subscription state; running waiters die with it.
    let mut subs = ctx.subs.lock().await;
    for (_, sub) in subs.drain() {
        if let Waiter::Running(handle) = sub.waiter {
            handle.abort();
        }
    }
    debug!(session = session_id, "session closed");
}

// -- Transport-facing tasks ---------------------------------------------------

async fn receive_loop<R>(mut reader: R, ctx: SessionCtx)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let transmission = tokio::select! {
            read = transport::read_transmission(&mut reader) => match read {
                Ok(Some(t)) => t,
                Ok(None) => {
                    debug!(session = ctx.session_id, "transport closed");
                    return;
                }
                Err(e) => {
                    debug!(session = ctx.session_id, "transport read failed: {e}");
                    return;
                }
            },
            _ = ctx.shutdown.cancelled() => return,
        };
        let signed = verify_transmission(&ctx.store, transmission).await;
        if ctx.rcv_tx.send(signed).await.is_err() {
            return;
        }
    }
}

async fn send_loop<W>(
    mut writer: W,
    mut snd_rx: mpsc::Receiver<(EntityId, Command)>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let (conn_id, command) = tokio::select! {
            item = snd_rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
            _ = shutdown.cancelled() => return,
        };
        if let Err(e) = transport::write_transmission(&mut writer, &conn_id, &command).await {
            debug!("transport write failed: {e}");
            return;
        }
    }
}

/// Authenticate a raw transmission against the connection record of the
/// commanding party. Rejections happen here, before dispatch, so no store
/// mutation can precede an authorization failure — and an unknown id is
/// indistinguishable from a bad signature.
async fn verify_transmission(store: &Store, t: Transmission) -> (EntityId, Command) {
    let Transmission { signature, conn_id, command } = t;
    let command = match command {
        Err(kind) => Command::Err(kind),
        Ok(cmd) => match cmd.party() {
            // Broker commands never come from clients.
            Party::Broker => Command::Err(ErrorKind::Internal),
            Party::Recipient => match cmd {
                // Queue creation has no record to authenticate against.
                Command::Conn(_) => cmd,
                _ => match store.conns.get(Party::Recipient, &conn_id).await {
                    Ok(conn)
                        if store.verifier.verify(
                            &signature,
                            &conn_id,
                            cmd.encode().as_bytes(),
                            &conn.recipient_key,
                        ) =>
                    {
                        cmd
                    }
                    _ => Command::Err(ErrorKind::Auth),
                },
            },
            Party::Sender => match store.conns.get(Party::Sender, &conn_id).await {
                Ok(conn) => match conn.sender_key {
                    Some(key)
                        if store.verifier.verify(
                            &signature,
                            &conn_id,
                            cmd.encode().as_bytes(),
                            &key,
                        ) =>
                    {
                        cmd
                    }
                    // Unsecured queue: only unsigned sends pass.
                    None if signature.is_empty() => cmd,
                    _ => Command::Err(ErrorKind::Auth),
                },
                Err(_) => Command::Err(ErrorKind::Auth),
            },
        },
    };
    (conn_id, command)
}

// -- Dispatch -----------------------------------------------------------------

async fn process_loop(ctx: SessionCtx, mut rcv_rx: mpsc::Receiver<(EntityId, Command)>) {
    while let Some((conn_id, command)) = rcv_rx.recv().await {
        let (conn_id, reply) = dispatch(&ctx, conn_id, command).await;
        if ctx.snd_tx.send((conn_id, reply)).await.is_err() {
            return;
        }
    }
}

async fn dispatch(ctx: &SessionCtx, conn_id: EntityId, command: Command) -> (EntityId, Command) {
    match command {
        Command::Conn(recipient_key) => create_queue(ctx, recipient_key).await,
        Command::Sub => {
            let reply = subscribe(ctx, conn_id.clone()).await;
            (conn_id, reply)
        }
        Command::Ack => {
            let reply = acknowledge(ctx, conn_id.clone()).await;
            (conn_id, reply)
        }
        Command::Key(sender_key) => {
            let reply = reply_of(ctx.store.conns.secure(&conn_id, sender_key).await);
            (conn_id, reply)
        }
        Command::Off => {
            let reply = reply_of(ctx.store.conns.suspend(&conn_id).await);
            (conn_id, reply)
        }
        Command::Del => {
            let reply = delete_queue(ctx, &conn_id).await;
            (conn_id, reply)
        }
        Command::Send(body) => {
            let reply = send_message(ctx, &conn_id, body).await;
            (conn_id, reply)
        }
        // Displacement notice from the registry: tear down and pass through.
        Command::End => {
            drop_subscription(ctx, &conn_id).await;
            debug!(session = ctx.session_id, queue = %short_id(&conn_id), "subscription ended");
            (conn_id, Command::End)
        }
        // Receive-side verdicts (framing or authorization) echo unchanged.
        Command::Err(kind) => (conn_id, Command::Err(kind)),
        // Other broker commands never reach the inbound queue.
        Command::Ids { .. } | Command::Msg { .. } | Command::Ok => {
            (conn_id, Command::Err(ErrorKind::Internal))
        }
    }
}

fn reply_of(result: Result<(), ErrorKind>) -> Command {
    match result {
        Ok(()) => Command::Ok,
        Err(kind) => Command::Err(kind),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// `CONN`: install a record under fresh ids, retrying collisions, and
/// auto-subscribe the creating session.
async fn create_queue(ctx: &SessionCtx, recipient_key: PublicKey) -> (EntityId, Command) {
    const ATTEMPTS: usize = 3;
    for attempt in 1..=ATTEMPTS {
        let recipient_id = ctx.store.ids.fresh(ctx.store.queue_id_bytes).await;
        let sender_id = ctx.store.ids.fresh(ctx.store.queue_id_bytes).await;
        match ctx
            .store
            .conns
            .add(recipient_key.clone(), recipient_id.clone(), sender_id.clone())
            .await
        {
            Ok(()) => {
                info!(
                    session = ctx.session_id,
                    queue = %short_id(&recipient_id),
                    "queue created"
                );
                // The creator is its first subscriber; the queue is empty,
                // so the subscribe reply is discarded in favor of IDS.
                subscribe(ctx, recipient_id.clone()).await;
                let ids = Command::Ids { recipient_id: recipient_id.clone(), sender_id };
                return (recipient_id, ids);
            }
            Err(ErrorKind::Duplicate) => {
                warn!(session = ctx.session_id, attempt, "queue id collision, retrying");
            }
            Err(kind) => return (Bytes::new(), Command::Err(kind)),
        }
    }
    (Bytes::new(), Command::Err(ErrorKind::Internal))
}

/// `SUB`: first subscription claims the queue in the registry; repeat
/// subscription just re-syncs by freeing the delivery latch.
async fn subscribe(ctx: &SessionCtx, recipient_id: EntityId) -> Command {
    let already_subscribed = {
        let mut subs = ctx.subs.lock().await;
        match subs.get_mut(&recipient_id) {
            Some(sub) => {
                sub.delivered = false;
                true
            }
            None => {
                subs.insert(
                    recipient_id.clone(),
                    Subscription { delivered: false, waiter: Waiter::Idle },
                );
                false
            }
        }
    };
    if !already_subscribed {
        let client = ClientHandle { session_id: ctx.session_id, push_tx: ctx.rcv_tx.clone() };
        let (done, done_rx) = oneshot::channel();
        let claim = Subscribed { recipient_id: recipient_id.clone(), client, done };
        if ctx.store.subscribed_tx.send(claim).await.is_err() {
            return Command::Err(ErrorKind::Internal);
        }
        // Wait for the registry to install the binding and put any displaced
        // holder's END in flight; only then may this subscriber see a MSG.
        if done_rx.await.is_err() {
            return Command::Err(ErrorKind::Internal);
        }
    }
    deliver_message(ctx, recipient_id, HeadOp::Peek).await
}

/// Forget the subscription for `recipient_id` and kill its waiter. Besides
/// session teardown, this is the only way a `Running` waiter leaves the map
/// (END displacement and DEL).
async fn drop_subscription(ctx: &SessionCtx, recipient_id: &EntityId) {
    let mut subs = ctx.subs.lock().await;
    if let Some(sub) = subs.remove(recipient_id) {
        if let Waiter::Running(handle) = sub.waiter {
            handle.abort();
        }
    }
}

/// `ACK`: consume the outstanding delivery, then look for the next message.
async fn acknowledge(ctx: &SessionCtx, recipient_id: EntityId) -> Command {
    {
        let mut subs = ctx.subs.lock().await;
        match subs.get_mut(&recipient_id) {
            Some(sub) if sub.delivered => sub.delivered = false,
            _ => return Command::Err(ErrorKind::Prohibited),
        }
    }
    deliver_message(ctx, recipient_id, HeadOp::DelPeek).await
}

/// `DEL`: remove the record, then every trace this session holds of it.
async fn delete_queue(ctx: &SessionCtx, recipient_id: &EntityId) -> Command {
    match ctx.store.conns.delete(recipient_id).await {
        Err(kind) => Command::Err(kind),
        Ok(_) => {
            drop_subscription(ctx, recipient_id).await;
            ctx.store.registry.unbind(recipient_id, ctx.session_id).await;
            ctx.store.messages.remove(recipient_id).await;
            info!(session = ctx.session_id, queue = %short_id(recipient_id), "queue deleted");
            Command::Ok
        }
    }
}

/// `SEND`: append to the recipient's queue while it is active.
async fn send_message(ctx: &SessionCtx, sender_id: &EntityId, body: Bytes) -> Command {
    let conn = match ctx.store.conns.get(Party::Sender, sender_id).await {
        Ok(conn) => conn,
        Err(kind) => return Command::Err(kind),
    };
    if conn.status != QueueState::Active {
        return Command::Err(ErrorKind::Auth);
    }
    let queue = ctx.store.messages.get_or_create(&conn.recipient_id).await;
    let msg = Message {
        msg_id: ctx.store.ids.fresh(ctx.store.msg_id_bytes).await,
        ts: now_millis(),
        body,
    };
    match queue.write(msg).await {
        Ok(()) => Command::Ok,
        Err(kind) => Command::Err(kind),
    }
}

// -- Delivery -----------------------------------------------------------------

/// Try to hand the queue head to the client. A produced message locks the
/// delivery latch and goes out as the command's own reply; an empty queue
/// arms the background waiter instead and the reply is plain `OK`.
async fn deliver_message(ctx: &SessionCtx, recipient_id: EntityId, op: HeadOp) -> Command {
    let queue = ctx.store.messages.get_or_create(&recipient_id).await;
    let msg = match op {
        HeadOp::Peek => queue.try_peek().await,
        HeadOp::DelPeek => queue.try_del_peek().await,
    };
    match msg {
        Some(msg) => {
            let mut subs = ctx.subs.lock().await;
            if let Some(sub) = subs.get_mut(&recipient_id) {
                sub.delivered = true;
            }
            Command::Msg { msg_id: msg.msg_id, ts: msg.ts, body: msg.body }
        }
        None => {
            arm_waiter(ctx, recipient_id, queue).await;
            Command::Ok
        }
    }
}

/// Ensure exactly one background waiter exists for this subscription.
async fn arm_waiter(ctx: &SessionCtx, recipient_id: EntityId, queue: Arc<MessageQueue>) {
    {
        let mut subs = ctx.subs.lock().await;
        match subs.get_mut(&recipient_id) {
            Some(sub) if matches!(sub.waiter, Waiter::Idle) => sub.waiter = Waiter::Starting,
            // Already armed, or the subscription is gone.
            _ => return,
        }
    }
    let handle = tokio::spawn(wait_for_message(ctx.clone(), recipient_id.clone(), queue));
    let mut subs = ctx.subs.lock().await;
    match subs.get_mut(&recipient_id) {
        Some(sub) if matches!(sub.waiter, Waiter::Starting) => {
            sub.waiter = Waiter::Running(handle)
        }
        // The entry was cleared between the flip and here (END or DEL won
        // the race); the waiter must not outlive the subscription.
        _ => handle.abort(),
    }
}

/// One-shot waiter: block until the queue has a head, then deliver it
/// through the outbound queue and disarm.
async fn wait_for_message(ctx: SessionCtx, recipient_id: EntityId, queue: Arc<MessageQueue>) {
    let msg = tokio::select! {
        msg = queue.peek_blocking() => msg,
        _ = ctx.shutdown.cancelled() => return,
    };
    {
        let mut subs = ctx.subs.lock().await;
        match subs.get_mut(&recipient_id) {
            Some(sub) if !sub.delivered => {
                sub.delivered = true;
                sub.waiter = Waiter::Idle;
            }
            // Head already delivered on the dispatch path, or unsubscribed
            // while parked; either way this waiter has nothing to deliver.
            Some(sub) => {
                sub.waiter = Waiter::Idle;
                return;
            }
            None => return,
        }
    }
    let push = Command::Msg { msg_id: msg.msg_id, ts: msg.ts, body: msg.body };
    let _ = ctx.snd_tx.send((recipient_id, push)).await;
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
