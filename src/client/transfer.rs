// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Initiator side of the protocol: open a connection to a remote service
//! and drive a transmit (peer → service) or receive (service → peer)
//! session against it.
//!
//! The initiator is the only side that ever retransmits. A DATA frame that
//! draws no matching ACK within the timeout, or draws a NACK, is resent
//! with the same sequence number, up to `max_retries` times, after which
//! the transfer fails. The remote merely signals ACK/NACK.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::TransferSettings,
    models::{
        command::{Command, CommandCode, MAX_FILE_ID_LEN, ResponseCode},
        frame::{Frame, FrameFlags, FrameType, MAX_PAYLOAD},
    },
    transport::{FrameConnection, TransportError},
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("file not found on remote")]
    FileNotFound,
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("remote rejected transfer: {0:?}")]
    Rejected(ResponseCode),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Producer of outgoing chunk data. `fill` writes up to `buf.len()` bytes
/// for the given offset and reports whether more data follows.
pub trait ChunkSource: Send {
    fn fill(&mut self, offset: u64, buf: &mut [u8]) -> Result<(usize, bool), TransferError>;
}

/// Consumer of incoming chunk data. `more` is false on the final chunk.
pub trait ChunkSink: Send {
    fn consume(&mut self, offset: u64, data: &[u8], more: bool) -> Result<(), TransferError>;
}

/// Source over a byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl ChunkSource for SliceSource<'_> {
    fn fill(&mut self, offset: u64, buf: &mut [u8]) -> Result<(usize, bool), TransferError> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok((0, false));
        }
        let n = (self.data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok((n, offset + n < self.data.len()))
    }
}

/// Sink that accumulates contiguous chunks into a vector.
#[derive(Debug, Default)]
pub struct VecSink {
    data: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ChunkSink for VecSink {
    fn consume(&mut self, offset: u64, data: &[u8], _more: bool) -> Result<(), TransferError> {
        if offset != self.data.len() as u64 {
            return Err(TransferError::TransferFailed(format!(
                "non-contiguous chunk at offset {offset}"
            )));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }
}

/// Per-transfer parameters.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub file_id: Bytes,
    pub chunk_size: u16,
    pub timeout: Duration,
    pub max_retries: u8,
}

impl TransferConfig {
    pub fn new(file_id: impl Into<Bytes>) -> Self {
        Self {
            file_id: file_id.into(),
            chunk_size: 64,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn from_settings(settings: &TransferSettings, file_id: impl Into<Bytes>) -> Self {
        Self {
            file_id: file_id.into(),
            chunk_size: settings.chunk_size,
            timeout: settings.timeout,
            max_retries: settings.max_retries,
        }
    }
}

/// One client connection to a remote service. Each transfer occupies the
/// whole connection; run transfers sequentially or open more clients.
pub struct Client {
    conn: FrameConnection,
}

impl Client {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransferError> {
        let conn = FrameConnection::connect(addr, timeout, CancellationToken::new()).await?;
        Ok(Self { conn })
    }

    /// Send a file to the remote service. Returns the number of bytes the
    /// source produced and the service acknowledged.
    pub async fn transmit(
        &mut self,
        cfg: &TransferConfig,
        source: &mut dyn ChunkSource,
    ) -> Result<u64, TransferError> {
        validate(cfg)?;
        self.open_session(cfg, CommandCode::Write).await?;
        info!(chunk_size = cfg.chunk_size, "transmit session opened");

        let mut seq: u16 = 1;
        let mut offset: u64 = 0;
        let mut buf = vec![0u8; cfg.chunk_size as usize];

        loop {
            let (n, more) = source.fill(offset, &mut buf)?;

            let mut flags = FrameFlags::empty();
            if offset == 0 {
                flags |= FrameFlags::FIRST_CHUNK;
            }
            if !more {
                flags |= FrameFlags::LAST_CHUNK;
            }

            let frame = Frame::new(
                FrameType::Data,
                flags,
                seq,
                Bytes::copy_from_slice(&buf[..n]),
            );
            self.send_until_acked(&frame, cfg).await?;

            offset += n as u64;
            seq = seq.wrapping_add(1);
            if !more {
                break;
            }
        }

        info!(bytes = offset, "transmit complete");
        Ok(offset)
    }

    /// Fetch a file from the remote service into `sink`. Returns the number
    /// of bytes received.
    pub async fn receive(
        &mut self,
        cfg: &TransferConfig,
        sink: &mut dyn ChunkSink,
    ) -> Result<u64, TransferError> {
        validate(cfg)?;
        self.open_session(cfg, CommandCode::Read).await?;
        info!("receive session opened");

        let mut expected: u16 = 1;
        let mut offset: u64 = 0;
        let mut strikes = 0u32;

        loop {
            let frame = match self.conn.recv_frame(cfg.timeout).await {
                Ok(f) => f,
                Err(TransportError::Framing(e)) => {
                    warn!(error = %e, "bad DATA frame, requesting retransmit");
                    self.send_nack(expected, cfg).await?;
                    strikes += 1;
                    if strikes > cfg.max_retries as u32 {
                        return Err(TransferError::TransferFailed(
                            "too many corrupt frames".into(),
                        ));
                    }
                    continue;
                },
                Err(TransportError::Timeout(_)) => return Err(TransferError::Timeout),
                Err(e) => return Err(e.into()),
            };

            let ok = frame.known_kind() == Some(FrameType::Data)
                && frame.sequence_number == expected;
            if !ok {
                warn!(
                    kind = ?frame.kind,
                    seq = frame.sequence_number,
                    expected,
                    "unexpected frame while receiving"
                );
                self.send_nack(expected, cfg).await?;
                strikes += 1;
                if strikes > cfg.max_retries as u32 {
                    return Err(TransferError::TransferFailed(
                        "too many protocol errors".into(),
                    ));
                }
                continue;
            }

            let more = !frame.is_last_chunk();
            sink.consume(offset, &frame.payload, more)?;
            self.send_ack(frame.sequence_number, cfg).await?;

            offset += frame.payload.len() as u64;
            expected = expected.wrapping_add(1);
            strikes = 0;

            if !more {
                break;
            }
        }

        info!(bytes = offset, "receive complete");
        Ok(offset)
    }

    /// Tell the service to drop the session. The protocol defines no reply
    /// to an abort; the connection is simply closed afterwards.
    pub async fn abort(&mut self, cfg: &TransferConfig) -> Result<(), TransferError> {
        let payload = Command::encode(CommandCode::Abort, b"")
            .map_err(|_| TransferError::InvalidParam("abort command"))?;
        let frame = Frame::new(FrameType::Command, FrameFlags::empty(), 0, payload);
        self.conn.send_frame(&frame, cfg.timeout).await?;
        Ok(())
    }

    /// Close the connection. Consuming `self` makes a double close
    /// unrepresentable.
    pub async fn close(mut self) {
        self.conn.shutdown().await;
    }

    async fn open_session(
        &mut self,
        cfg: &TransferConfig,
        code: CommandCode,
    ) -> Result<(), TransferError> {
        let payload = Command::encode(code, &cfg.file_id)
            .map_err(|_| TransferError::InvalidParam("file id too long"))?;
        let frame = Frame::new(FrameType::Command, FrameFlags::empty(), 0, payload);
        self.conn.send_frame(&frame, cfg.timeout).await?;

        let reply = match self.conn.recv_frame(cfg.timeout).await {
            Ok(f) => f,
            Err(TransportError::Timeout(_)) => return Err(TransferError::Timeout),
            Err(e) => return Err(e.into()),
        };

        if reply.known_kind() != Some(FrameType::Response) {
            return Err(TransferError::TransferFailed(format!(
                "expected RESPONSE, got {:?}",
                reply.kind
            )));
        }

        match ResponseCode::parse(&reply.payload)
            .map_err(|e| TransferError::TransferFailed(e.to_string()))?
        {
            ResponseCode::Ok => Ok(()),
            ResponseCode::FileNotFound => Err(TransferError::FileNotFound),
            code => Err(TransferError::Rejected(code)),
        }
    }

    /// Send one DATA frame and wait for its ACK, retransmitting the same
    /// frame with the same sequence number on NACK, mismatch, or timeout.
    async fn send_until_acked(
        &mut self,
        frame: &Frame,
        cfg: &TransferConfig,
    ) -> Result<(), TransferError> {
        let mut attempts = 0u32;
        loop {
            self.conn.send_frame(frame, cfg.timeout).await?;

            match self.conn.recv_frame(cfg.timeout).await {
                Ok(reply) => match reply.known_kind() {
                    Some(FrameType::Ack) if reply.sequence_number == frame.sequence_number => {
                        debug!(seq = frame.sequence_number, "chunk acknowledged");
                        return Ok(());
                    },
                    Some(FrameType::Ack) => warn!(
                        expected = frame.sequence_number,
                        got = reply.sequence_number,
                        "ACK sequence mismatch, retrying"
                    ),
                    Some(FrameType::Nack) => {
                        warn!(seq = frame.sequence_number, "peer requested retransmit");
                    },
                    other => warn!(kind = ?other, "unexpected frame while waiting for ACK"),
                },
                Err(TransportError::Timeout(_)) => {
                    warn!(seq = frame.sequence_number, "ACK timed out");
                },
                Err(e) => return Err(e.into()),
            }

            attempts += 1;
            if attempts > cfg.max_retries as u32 {
                return Err(TransferError::TransferFailed(format!(
                    "no ACK for sequence {} after {} attempts",
                    frame.sequence_number,
                    attempts
                )));
            }
        }
    }

    async fn send_ack(&mut self, seq: u16, cfg: &TransferConfig) -> Result<(), TransferError> {
        let frame = Frame::new(FrameType::Ack, FrameFlags::empty(), seq, Bytes::new());
        Ok(self.conn.send_frame(&frame, cfg.timeout).await?)
    }

    async fn send_nack(&mut self, seq: u16, cfg: &TransferConfig) -> Result<(), TransferError> {
        let frame = Frame::new(FrameType::Nack, FrameFlags::empty(), seq, Bytes::new());
        Ok(self.conn.send_frame(&frame, cfg.timeout).await?)
    }
}

fn validate(cfg: &TransferConfig) -> Result<(), TransferError> {
    if cfg.chunk_size == 0 || cfg.chunk_size as usize > MAX_PAYLOAD {
        return Err(TransferError::InvalidParam(
            "chunk size must be between 1 and the frame payload cap",
        ));
    }
    if cfg.file_id.len() > MAX_FILE_ID_LEN {
        return Err(TransferError::InvalidParam("file id too long"));
    }
    Ok(())
}
