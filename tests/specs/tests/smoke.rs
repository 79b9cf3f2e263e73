// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end broker scenarios over real TCP sockets.

use std::time::Duration;

use bytes::Bytes;

use smpd::config::Config;
use smpd::error::ErrorKind;
use smpd::proto::Command;
use smpd_specs::{msg_body, Broker};

const RK: &[u8] = b"rk";
const SK: &[u8] = b"sk";

fn send(body: &[u8]) -> Command {
    Command::Send(Bytes::copy_from_slice(body))
}

// -- Scenario 1: create-and-send ---------------------------------------------

#[tokio::test]
async fn create_and_send() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    sender.transmit(b"", &sid, &send(b"hello")).await?;
    sender.expect(&sid, Command::Ok).await?;

    // The creating session receives the push without ever sending SUB.
    let (push_id, push) = recipient.receive().await?;
    assert_eq!(push_id, rid);
    assert_eq!(msg_body(&push)?, Bytes::from_static(b"hello"));
    Ok(())
}

// -- Scenario 2: ack-then-next ------------------------------------------------

#[tokio::test]
async fn ack_then_next() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    for text in [b"first".as_slice(), b"second".as_slice()] {
        sender.transmit(b"", &sid, &send(text)).await?;
        sender.expect(&sid, Command::Ok).await?;
    }

    let (_, push) = recipient.receive().await?;
    assert_eq!(msg_body(&push)?, Bytes::from_static(b"first"));

    // ACK consumes "first" and the next message rides the ACK reply.
    recipient.transmit(RK, &rid, &Command::Ack).await?;
    let (_, next) = recipient.receive().await?;
    assert_eq!(msg_body(&next)?, Bytes::from_static(b"second"));

    // ACK again: the queue is empty, nothing more until the next SEND.
    recipient.transmit(RK, &rid, &Command::Ack).await?;
    recipient.expect(&rid, Command::Ok).await?;

    sender.transmit(b"", &sid, &send(b"third")).await?;
    sender.expect(&sid, Command::Ok).await?;
    let (_, later) = recipient.receive().await?;
    assert_eq!(msg_body(&later)?, Bytes::from_static(b"third"));
    Ok(())
}

// -- Scenario 3: secure rejects unsigned --------------------------------------

#[tokio::test]
async fn secure_rejects_unsigned() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    recipient.transmit(RK, &rid, &Command::Key(Bytes::copy_from_slice(SK))).await?;
    recipient.expect(&rid, Command::Ok).await?;

    sender.transmit(b"", &sid, &send(b"x")).await?;
    sender.expect(&sid, Command::Err(ErrorKind::Auth)).await?;

    sender.transmit(SK, &sid, &send(b"x")).await?;
    sender.expect(&sid, Command::Ok).await?;
    Ok(())
}

// -- Scenario 4: displacement -------------------------------------------------

#[tokio::test]
async fn displacement() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut first = broker.client().await?;
    let mut second = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = first.create_queue(RK).await?;

    // A pending message the second subscriber should pick up.
    sender.transmit(b"", &sid, &send(b"pending")).await?;
    sender.expect(&sid, Command::Ok).await?;
    let (_, push) = first.receive().await?;
    assert_eq!(msg_body(&push)?, Bytes::from_static(b"pending"));

    second.transmit(RK, &rid, &Command::Sub).await?;
    let (_, reply) = second.receive().await?;
    assert_eq!(msg_body(&reply)?, Bytes::from_static(b"pending"));

    // The first session observes exactly one END for that queue.
    first.expect(&rid, Command::End).await?;
    Ok(())
}

// -- Scenario 5: ACK without delivery -----------------------------------------

#[tokio::test]
async fn ack_without_delivery() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;

    let (rid, _sid) = recipient.create_queue(RK).await?;
    recipient.transmit(RK, &rid, &Command::Ack).await?;
    recipient.expect(&rid, Command::Err(ErrorKind::Prohibited)).await?;
    Ok(())
}

// -- Scenario 6: delete -------------------------------------------------------

#[tokio::test]
async fn delete_closes_both_sides() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    recipient.transmit(RK, &rid, &Command::Del).await?;
    recipient.expect(&rid, Command::Ok).await?;

    recipient.transmit(RK, &rid, &Command::Sub).await?;
    recipient.expect(&rid, Command::Err(ErrorKind::Auth)).await?;

    sender.transmit(b"", &sid, &send(b"late")).await?;
    sender.expect(&sid, Command::Err(ErrorKind::Auth)).await?;
    Ok(())
}

// -- Round-trip property ------------------------------------------------------

#[tokio::test]
async fn n_sends_deliver_n_bodies_in_order() -> anyhow::Result<()> {
    let broker = Broker::with_config(Config { queue_size: 32, ..Config::test() }).await?;
    let mut recipient = broker.client().await?;
    let mut sender = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    let bodies: Vec<String> = (0..10).map(|n| format!("msg-{n}")).collect();
    for text in &bodies {
        sender.transmit(b"", &sid, &send(text.as_bytes())).await?;
        sender.expect(&sid, Command::Ok).await?;
    }

    // First body is pushed; each ACK reply carries the next.
    let (_, push) = recipient.receive().await?;
    assert_eq!(msg_body(&push)?, Bytes::copy_from_slice(bodies[0].as_bytes()));

    for expected in &bodies[1..] {
        recipient.transmit(RK, &rid, &Command::Ack).await?;
        let (_, next) = recipient.receive().await?;
        assert_eq!(msg_body(&next)?, Bytes::copy_from_slice(expected.as_bytes()));
    }

    recipient.transmit(RK, &rid, &Command::Ack).await?;
    recipient.expect(&rid, Command::Ok).await?;
    Ok(())
}

// -- Transport resilience -----------------------------------------------------

#[tokio::test]
async fn broker_commands_are_rejected_and_session_survives() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut client = broker.client().await?;

    client.transmit(b"", b"", &Command::Ok).await?;
    let (_, reply) = client.receive().await?;
    assert_eq!(reply, Command::Err(ErrorKind::Internal));

    // And the connection still creates queues afterwards.
    client.create_queue(RK).await?;
    Ok(())
}

#[tokio::test]
async fn dropped_sender_does_not_disturb_recipient() -> anyhow::Result<()> {
    let broker = Broker::start().await?;
    let mut recipient = broker.client().await?;

    let (rid, sid) = recipient.create_queue(RK).await?;

    {
        let mut doomed = broker.client().await?;
        doomed.transmit(b"", &sid, &send(b"from the grave")).await?;
        doomed.expect(&sid, Command::Ok).await?;
        // Connection drops here; the queue and its message must survive.
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (push_id, push) = recipient.receive().await?;
    assert_eq!(push_id, rid);
    assert_eq!(msg_body(&push)?, Bytes::from_static(b"from the grave"));
    Ok(())
}
