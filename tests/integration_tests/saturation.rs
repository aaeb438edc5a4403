// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use cftp_rs::{
    client::transfer::{Client, SliceSource},
    models::{
        command::{Command, CommandCode},
        frame::{Frame, FrameFlags, FrameType},
    },
};
use tokio::{net::TcpStream, time::sleep};

use crate::integration_tests::common::{
    quick_config, read_to_eof, recv_frame_raw, send_frame_raw, start_service,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_saturated_service_refuses_extra_clients() -> Result<()> {
    let (service, addr, store) = start_service(2, Duration::from_secs(2)).await?;

    // Two connections soak up both client slots.
    let mut held_a = TcpStream::connect(addr).await?;
    let mut held_b = TcpStream::connect(addr).await?;
    sleep(Duration::from_millis(100)).await;

    // The third connection is accepted and immediately closed, so its
    // transfer cannot get a RESPONSE back.
    let mut refused = Client::connect(addr, TIMEOUT).await?;
    let err = refused
        .transmit(&quick_config(b"nope"), &mut SliceSource::new(b"data"))
        .await;
    assert!(err.is_err(), "saturated service must refuse the transfer");
    refused.close().await;

    // A held session is undisturbed: drive a full write on it.
    let command = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Command::encode(CommandCode::Write, b"held")?,
    );
    send_frame_raw(&mut held_a, &command).await?;
    let response = recv_frame_raw(&mut held_a).await?;
    assert_eq!(&response.payload[..], &[0x00]);

    let data = Frame::new(
        FrameType::Data,
        FrameFlags::FIRST_CHUNK | FrameFlags::LAST_CHUNK,
        1,
        Bytes::from_static(b"still here"),
    );
    send_frame_raw(&mut held_a, &data).await?;
    let ack = recv_frame_raw(&mut held_a).await?;
    assert_eq!(ack.known_kind(), Some(FrameType::Ack));
    assert!(read_to_eof(&mut held_a).await);
    assert_eq!(store.contents(b"held"), Some(b"still here".to_vec()));

    // Freeing the slots lets new clients in again.
    drop(held_a);
    drop(held_b);
    sleep(Duration::from_millis(200)).await;

    let mut client = Client::connect(addr, TIMEOUT).await?;
    let sent = client
        .transmit(&quick_config(b"after"), &mut SliceSource::new(b"ok"))
        .await?;
    assert_eq!(sent, 2);
    client.close().await;
    assert_eq!(store.contents(b"after"), Some(b"ok".to_vec()));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_abort_command_closes_without_reply() -> Result<()> {
    let (service, addr, _store) = start_service(4, Duration::from_secs(2)).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let abort = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Command::encode(CommandCode::Abort, b"")?,
    );
    send_frame_raw(&mut stream, &abort).await?;

    // The abort contract is no-reply: the next event is the close itself.
    assert!(read_to_eof(&mut stream).await);

    // Same thing through the client API.
    let mut client = Client::connect(addr, TIMEOUT).await?;
    client.abort(&quick_config(b"")).await?;
    client.close().await;

    service.shutdown().await;
    Ok(())
}
