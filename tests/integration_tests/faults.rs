// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use cftp_rs::{
    client::transfer::{Client, SliceSource, TransferError, VecSink},
    models::{
        command::{Command, CommandCode},
        frame::{Frame, FrameFlags, FrameType, HEADER_LEN},
    },
};
use tokio::net::TcpListener;
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::integration_tests::common::{
    quick_config, read_to_eof, recv_frame_raw, send_frame_raw, start_service,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_file_not_found_surfaces() -> Result<()> {
    let (service, addr, _store) = start_service(4, TIMEOUT).await?;

    let mut client = Client::connect(addr, TIMEOUT).await?;
    let err = client
        .receive(&quick_config(b"missing"), &mut VecSink::new())
        .await
        .expect_err("read of a missing file must fail");
    assert!(matches!(err, TransferError::FileNotFound), "got {err:?}");
    client.close().await;

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_crc_corruption_draws_nack_then_retransmit_succeeds() -> Result<()> {
    let (service, addr, store) = start_service(4, TIMEOUT).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let command = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Command::encode(CommandCode::Write, b"c")?,
    );
    send_frame_raw(&mut stream, &command).await?;
    let response = recv_frame_raw(&mut stream).await?;
    assert_eq!(&response.payload[..], &[0x00]);

    let data = Frame::new(
        FrameType::Data,
        FrameFlags::FIRST_CHUNK | FrameFlags::LAST_CHUNK,
        1,
        Bytes::from_static(&[1, 2, 3, 4]),
    );

    // First attempt goes out with a flipped payload byte; the declared CRC
    // no longer matches, so the service must answer NACK and stay put.
    let mut corrupted = data.encode()?.to_vec();
    corrupted[HEADER_LEN] ^= 0xFF;
    stream.write_all(&corrupted).await?;

    let nack = recv_frame_raw(&mut stream).await?;
    assert_eq!(nack.known_kind(), Some(FrameType::Nack));

    // Same frame, same sequence number, intact this time.
    send_frame_raw(&mut stream, &data).await?;
    let ack = recv_frame_raw(&mut stream).await?;
    assert_eq!(ack.known_kind(), Some(FrameType::Ack));
    assert_eq!(ack.sequence_number, 1);

    assert!(read_to_eof(&mut stream).await);
    assert_eq!(store.contents(b"c"), Some(vec![1, 2, 3, 4]));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_write_sequence_mismatch_draws_nack() -> Result<()> {
    let (service, addr, store) = start_service(4, TIMEOUT).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let command = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Command::encode(CommandCode::Write, b"s")?,
    );
    send_frame_raw(&mut stream, &command).await?;
    let response = recv_frame_raw(&mut stream).await?;
    assert_eq!(&response.payload[..], &[0x00]);

    let stray = Frame::new(
        FrameType::Data,
        FrameFlags::FIRST_CHUNK | FrameFlags::LAST_CHUNK,
        5,
        Bytes::from_static(b"zz"),
    );
    send_frame_raw(&mut stream, &stray).await?;
    let nack = recv_frame_raw(&mut stream).await?;
    assert_eq!(nack.known_kind(), Some(FrameType::Nack));

    let data = Frame::new(
        FrameType::Data,
        FrameFlags::FIRST_CHUNK | FrameFlags::LAST_CHUNK,
        1,
        Bytes::from_static(b"ok"),
    );
    send_frame_raw(&mut stream, &data).await?;
    let ack = recv_frame_raw(&mut stream).await?;
    assert_eq!(ack.known_kind(), Some(FrameType::Ack));
    assert_eq!(ack.sequence_number, 1);

    assert!(read_to_eof(&mut stream).await);
    assert_eq!(store.contents(b"s"), Some(b"ok".to_vec()));

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_non_command_opening_terminates_silently() -> Result<()> {
    let (service, addr, _store) = start_service(4, Duration::from_secs(2)).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let stray = Frame::new(FrameType::Ack, FrameFlags::empty(), 0, Bytes::new());
    send_frame_raw(&mut stream, &stray).await?;

    // No RESPONSE comes back; the handler just hangs up.
    assert!(read_to_eof(&mut stream).await);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_command_draws_error_response() -> Result<()> {
    let (service, addr, _store) = start_service(4, TIMEOUT).await?;

    // One-byte command payload fails the `payload_length >= 2` validation.
    let mut stream = TcpStream::connect(addr).await?;
    let short = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Bytes::from_static(&[0x01]),
    );
    send_frame_raw(&mut stream, &short).await?;
    let response = recv_frame_raw(&mut stream).await?;
    assert_eq!(response.known_kind(), Some(FrameType::Response));
    assert_eq!(&response.payload[..], &[0x01]);
    assert!(read_to_eof(&mut stream).await);

    // Unknown command codes are answered the same way.
    let mut stream = TcpStream::connect(addr).await?;
    let unknown = Frame::new(
        FrameType::Command,
        FrameFlags::empty(),
        0,
        Bytes::from_static(&[0x7F, 0x00]),
    );
    send_frame_raw(&mut stream, &unknown).await?;
    let response = recv_frame_raw(&mut stream).await?;
    assert_eq!(&response.payload[..], &[0x01]);
    assert!(read_to_eof(&mut stream).await);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_initiator_retries_then_gives_up() -> Result<()> {
    // A fake service that acknowledges the command but never ACKs data, so
    // every DATA frame times out and is retransmitted with the same
    // sequence number.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        let command = recv_frame_raw(&mut stream).await?;
        assert_eq!(command.known_kind(), Some(FrameType::Command));

        let ok = Frame::new(
            FrameType::Response,
            FrameFlags::empty(),
            0,
            Bytes::from_static(&[0x00]),
        );
        send_frame_raw(&mut stream, &ok).await?;

        let mut data_frames = 0u32;
        let mut sequences = Vec::new();
        while let Ok(frame) = recv_frame_raw(&mut stream).await {
            if frame.known_kind() == Some(FrameType::Data) {
                data_frames += 1;
                sequences.push(frame.sequence_number);
            }
        }
        anyhow::Ok((data_frames, sequences))
    });

    let mut config = quick_config(b"t");
    config.timeout = Duration::from_millis(200);
    config.max_retries = 2;

    let mut client = Client::connect(addr, TIMEOUT).await?;
    let err = client
        .transmit(&config, &mut SliceSource::new(b"payload"))
        .await
        .expect_err("transfer without ACKs must fail");
    assert!(matches!(err, TransferError::TransferFailed(_)), "got {err:?}");
    client.close().await;

    let (data_frames, sequences) = server.await??;
    assert_eq!(data_frames, 1 + config.max_retries as u32);
    assert!(sequences.iter().all(|&s| s == 1), "got {sequences:?}");
    Ok(())
}

#[tokio::test]
async fn test_store_write_failure_rejects_session() -> Result<()> {
    use cftp_rs::cfg::config::ServiceSettings;
    use cftp_rs::fs::{FileHandle, FileStore, FsError, OpenMode};
    use cftp_rs::service::acceptor::FtpService;
    use std::sync::Arc;

    // A store whose open always fails generically: the service must answer
    // the opening command with RESPONSE{ERROR}.
    struct BrokenStore;

    impl FileStore for BrokenStore {
        fn open(&self, _id: &[u8], _mode: OpenMode) -> Result<FileHandle, FsError> {
            Err(FsError::Io(std::io::Error::other("disk on fire")))
        }

        fn close(&self, _handle: FileHandle) {}

        fn read(&self, _h: FileHandle, _o: u64, _b: &mut [u8]) -> Result<usize, FsError> {
            Err(FsError::BadHandle)
        }

        fn write(&self, _h: FileHandle, _o: u64, _d: &[u8]) -> Result<usize, FsError> {
            Err(FsError::BadHandle)
        }
    }

    let settings = ServiceSettings::default();
    let service = FtpService::start(settings, Arc::new(BrokenStore)).await?;
    let addr = service.local_addr();

    let mut client = Client::connect(addr, TIMEOUT).await?;
    let err = client
        .transmit(&quick_config(b"f"), &mut SliceSource::new(b"data"))
        .await
        .expect_err("write into a broken store must fail");
    assert!(matches!(err, TransferError::Rejected(_)), "got {err:?}");
    client.close().await;

    service.shutdown().await;
    Ok(())
}
