// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framed connection over a TCP stream.
//!
//! The transport is a plain ordered byte stream, so frames self-delimit via
//! the header's `payload_length` field: read the fixed header, validate the
//! declared length, read exactly that many payload bytes, then hand the
//! whole buffer to the codec. Every blocking operation carries an explicit
//! timeout and observes the cancellation token, so a shutdown signal
//! unblocks in-flight I/O without waiting for the timeout to fire.

use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zerocopy::FromBytes;

use crate::models::frame::{Frame, FrameHeader, FramingError, HEADER_LEN, MAX_FRAME, MAX_PAYLOAD};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{0} cancelled")]
    Cancelled(&'static str),
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, TransportError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled(label)),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(TransportError::Closed)
                },
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TransportError::Timeout(label)),
            }
        }
    }
}

/// One protocol endpoint of a TCP connection. Owned exclusively by the
/// session driving it; dropping it closes the stream.
#[derive(Debug)]
pub struct FrameConnection {
    stream: TcpStream,
    scratch: BytesMut,
    cancel: CancellationToken,
}

impl FrameConnection {
    pub async fn connect(
        addr: SocketAddr,
        io_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let stream = io_with_timeout("connect", TcpStream::connect(addr), io_timeout, &cancel).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, cancel))
    }

    pub fn from_stream(stream: TcpStream, cancel: CancellationToken) -> Self {
        Self {
            stream,
            scratch: BytesMut::with_capacity(MAX_FRAME),
            cancel,
        }
    }

    pub async fn send_frame(
        &mut self,
        frame: &Frame,
        io_timeout: Duration,
    ) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        io_with_timeout(
            "send frame",
            self.stream.write_all(&bytes),
            io_timeout,
            &self.cancel,
        )
        .await?;
        debug!(
            kind = ?frame.kind,
            flags = ?frame.flags,
            seq = frame.sequence_number,
            len = frame.payload.len(),
            "TX"
        );
        Ok(())
    }

    /// Receive one whole frame. A frame that decodes but fails its CRC
    /// surfaces as `Framing(CrcMismatch)` with the stream still aligned on
    /// a frame boundary, so the session layer may keep the connection.
    pub async fn recv_frame(&mut self, io_timeout: Duration) -> Result<Frame, TransportError> {
        self.scratch.clear();
        self.scratch.resize(HEADER_LEN, 0);
        io_with_timeout(
            "read header",
            self.stream.read_exact(&mut self.scratch[..HEADER_LEN]),
            io_timeout,
            &self.cancel,
        )
        .await?;

        let header = FrameHeader::read_from_bytes(&self.scratch[..HEADER_LEN])
            .map_err(|_| FramingError::TooShort { got: self.scratch.len() })?;
        let declared = header.payload_length.get() as usize;
        if declared > MAX_PAYLOAD {
            return Err(FramingError::Oversize(declared).into());
        }

        if declared > 0 {
            self.scratch.resize(HEADER_LEN + declared, 0);
            io_with_timeout(
                "read payload",
                self.stream.read_exact(&mut self.scratch[HEADER_LEN..]),
                io_timeout,
                &self.cancel,
            )
            .await?;
        }

        let frame = Frame::decode(&self.scratch)?;
        debug!(
            kind = ?frame.kind,
            flags = ?frame.flags,
            seq = frame.sequence_number,
            len = frame.payload.len(),
            "RX"
        );
        Ok(frame)
    }

    /// Half-close the write side. Safe to call more than once; errors from
    /// an already-closed stream are discarded.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
