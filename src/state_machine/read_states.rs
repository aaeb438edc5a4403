// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Service half of a read session: stream file contents to the peer one
//! DATA frame at a time, lock-step against the peer's ACKs.

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    fs::{FileStore, FsError, OpenMode, ScopedFile},
    models::{
        command::ResponseCode,
        frame::{Frame, FrameFlags, FrameType, MAX_PAYLOAD},
    },
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
    transport::{FrameConnection, TransportError},
};

/// Runtime state of one read session.
///
/// `seq` counts frames this side emits: the opening RESPONSE rides sequence
/// 0, the first DATA frame sequence 1, and each peer ACK must echo the
/// sequence of the DATA frame it answers.
pub struct ReadCtx<'a> {
    conn: &'a mut FrameConnection,
    store: Arc<dyn FileStore>,
    file_id: Bytes,
    timeout: Duration,

    seq: u16,
    offset: u64,
    file: Option<ScopedFile>,
    chunk: Vec<u8>,
    chunk_len: usize,
    last_chunk: bool,
    state: Option<ReadStates>,
}

impl<'a> ReadCtx<'a> {
    pub fn new(
        conn: &'a mut FrameConnection,
        store: Arc<dyn FileStore>,
        file_id: Bytes,
        timeout: Duration,
    ) -> Self {
        Self {
            conn,
            store,
            file_id,
            timeout,
            seq: 0,
            offset: 0,
            file: None,
            chunk: vec![0u8; MAX_PAYLOAD],
            chunk_len: 0,
            last_chunk: false,
            state: Some(ReadStates::Open(Open)),
        }
    }

    async fn respond(&mut self, code: ResponseCode) -> Result<(), TransportError> {
        let frame = Frame::new(
            FrameType::Response,
            FrameFlags::empty(),
            self.seq,
            Bytes::copy_from_slice(&code.to_payload()),
        );
        self.conn.send_frame(&frame, self.timeout).await
    }

    fn open_file(&mut self) -> Result<(), FsError> {
        let file = ScopedFile::open(Arc::clone(&self.store), &self.file_id, OpenMode::Read)?;
        self.file = Some(file);
        Ok(())
    }

    /// Read the next chunk and decide its flags. A one-byte look-ahead into
    /// a separate probe buffer tells whether more data follows, so the last
    /// chunk is flagged without a trailing empty frame. An empty file still
    /// produces exactly one empty FIRST|LAST frame.
    fn fill_chunk(&mut self) -> Result<(), FsError> {
        let file = self.file.as_ref().ok_or(FsError::BadHandle)?;
        let n = file.read(self.offset, &mut self.chunk[..MAX_PAYLOAD])?;

        let mut probe = [0u8; 1];
        let more = n > 0 && file.read(self.offset + n as u64, &mut probe)? > 0;

        self.chunk_len = n;
        self.last_chunk = !more;
        Ok(())
    }

    async fn send_chunk(&mut self) -> Result<(), TransportError> {
        let mut flags = FrameFlags::empty();
        if self.offset == 0 {
            flags |= FrameFlags::FIRST_CHUNK;
        }
        if self.last_chunk {
            flags |= FrameFlags::LAST_CHUNK;
        }

        let frame = Frame::new(
            FrameType::Data,
            flags,
            self.seq,
            Bytes::copy_from_slice(&self.chunk[..self.chunk_len]),
        );
        self.conn.send_frame(&frame, self.timeout).await
    }
}

pub struct Open;
pub struct SendChunk;
pub struct WaitAck;

pub enum ReadStates {
    Open(Open),
    SendChunk(SendChunk),
    WaitAck(WaitAck),
}

type ReadStepOut = Transition<ReadStates, Result<()>>;

impl<'ctx> StateMachine<ReadCtx<'ctx>, ReadStepOut> for Open {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ReadStepOut> + Send + 'a>>
    where
        Self: 'a,
        ReadCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ReadCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if let Err(e) = ctx.open_file() {
                let code = match e {
                    FsError::NotFound => ResponseCode::FileNotFound,
                    _ => ResponseCode::Error,
                };
                warn!(error = %e, "file open failed");
                let _ = ctx.respond(code).await;
                return Transition::Done(Err(anyhow!("open failed: {e}")));
            }

            if let Err(e) = ctx.respond(ResponseCode::Ok).await {
                return Transition::Done(Err(e.into()));
            }
            ctx.seq = ctx.seq.wrapping_add(1);
            Transition::Next(ReadStates::SendChunk(SendChunk), Ok(()))
        })
    }
}

impl<'ctx> StateMachine<ReadCtx<'ctx>, ReadStepOut> for SendChunk {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ReadStepOut> + Send + 'a>>
    where
        Self: 'a,
        ReadCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ReadCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if let Err(e) = ctx.fill_chunk() {
                error!(error = %e, "file read failed");
                return Transition::Done(Err(anyhow!("file read failed: {e}")));
            }
            if let Err(e) = ctx.send_chunk().await {
                return Transition::Done(Err(e.into()));
            }
            Transition::Next(ReadStates::WaitAck(WaitAck), Ok(()))
        })
    }
}

impl<'ctx> StateMachine<ReadCtx<'ctx>, ReadStepOut> for WaitAck {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ReadStepOut> + Send + 'a>>
    where
        Self: 'a,
        ReadCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ReadCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let frame = match ctx.conn.recv_frame(ctx.timeout).await {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, "ACK receive failed");
                    return Transition::Done(Err(anyhow!("waiting for ACK: {e}")));
                },
            };

            match frame.known_kind() {
                Some(FrameType::Ack) if frame.sequence_number == ctx.seq => {
                    ctx.offset += ctx.chunk_len as u64;
                    ctx.seq = ctx.seq.wrapping_add(1);
                    if ctx.last_chunk {
                        Transition::Done(Ok(()))
                    } else {
                        Transition::Next(ReadStates::SendChunk(SendChunk), Ok(()))
                    }
                },
                Some(FrameType::Ack) => {
                    warn!(
                        expected = ctx.seq,
                        got = frame.sequence_number,
                        "ACK sequence mismatch"
                    );
                    Transition::Done(Err(anyhow!("ACK sequence mismatch")))
                },
                Some(FrameType::Nack) => {
                    warn!(seq = ctx.seq, "peer rejected chunk");
                    Transition::Done(Err(anyhow!("peer sent NACK")))
                },
                other => {
                    warn!(kind = ?other, "unexpected frame while waiting for ACK");
                    Transition::Done(Err(anyhow!("unexpected frame while waiting for ACK")))
                },
            }
        })
    }
}

impl<'ctx> StateMachineCtx<ReadCtx<'ctx>, u64> for ReadCtx<'ctx> {
    async fn execute(&mut self, _cancel: &CancellationToken) -> Result<u64> {
        info!(file_id_len = self.file_id.len(), "read session started");

        loop {
            let state = self.state.take().context("read session state must be set")?;
            let tr = match state {
                ReadStates::Open(s) => s.step(self).await,
                ReadStates::SendChunk(s) => s.step(self).await,
                ReadStates::WaitAck(s) => s.step(self).await,
            };

            match tr {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(())) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => {
                    if let Some(file) = self.file.take() {
                        file.close();
                    }
                    r?;
                    info!(bytes = self.offset, "read session complete");
                    return Ok(self.offset);
                },
            }
        }
    }
}
