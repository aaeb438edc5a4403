// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Service half of a write session: receive DATA frames in lock-step,
//! acknowledging each one, and persist them through the backing store.

use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    fs::{FileStore, FsError, OpenMode, ScopedFile},
    models::{
        command::ResponseCode,
        frame::{Frame, FrameFlags, FrameType, FramingError},
    },
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
    transport::{FrameConnection, TransportError},
};

/// Runtime state of one write session.
///
/// `peer_seq` is the sequence number the next DATA frame must carry. A
/// frame that fails its CRC, carries the wrong type, or the wrong sequence
/// is answered with an empty NACK and the session stays put. The peer owns
/// retransmission, and the receive timeout bounds how long we wait for it.
pub struct WriteCtx<'a> {
    conn: &'a mut FrameConnection,
    store: Arc<dyn FileStore>,
    file_id: Bytes,
    timeout: Duration,

    seq: u16,
    peer_seq: u16,
    offset: u64,
    file: Option<ScopedFile>,
    state: Option<WriteStates>,
}

impl<'a> WriteCtx<'a> {
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
            peer_seq: 0,
            offset: 0,
            file: None,
            state: Some(WriteStates::Open(Open)),
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

    async fn send_ack(&mut self, seq: u16) -> Result<(), TransportError> {
        let frame = Frame::new(FrameType::Ack, FrameFlags::empty(), seq, Bytes::new());
        self.conn.send_frame(&frame, self.timeout).await
    }

    async fn send_nack(&mut self) -> Result<(), TransportError> {
        let frame = Frame::new(FrameType::Nack, FrameFlags::empty(), self.peer_seq, Bytes::new());
        self.conn.send_frame(&frame, self.timeout).await
    }

    fn open_file(&mut self) -> Result<(), FsError> {
        let file = ScopedFile::open(Arc::clone(&self.store), &self.file_id, OpenMode::Write)?;
        self.file = Some(file);
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), FsError> {
        let file = self.file.as_ref().ok_or(FsError::BadHandle)?;
        file.write(self.offset, data)?;
        Ok(())
    }
}

pub struct Open;
pub struct Recv;

pub enum WriteStates {
    Open(Open),
    Recv(Recv),
}

type WriteStepOut = Transition<WriteStates, Result<()>>;

impl<'ctx> StateMachine<WriteCtx<'ctx>, WriteStepOut> for Open {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = WriteStepOut> + Send + 'a>>
    where
        Self: 'a,
        WriteCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut WriteCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if let Err(e) = ctx.open_file() {
                warn!(error = %e, "file open failed");
                let _ = ctx.respond(ResponseCode::Error).await;
                return Transition::Done(Err(anyhow!("open failed: {e}")));
            }

            if let Err(e) = ctx.respond(ResponseCode::Ok).await {
                return Transition::Done(Err(e.into()));
            }
            ctx.seq = ctx.seq.wrapping_add(1);
            ctx.peer_seq = 1;
            Transition::Next(WriteStates::Recv(Recv), Ok(()))
        })
    }
}

impl<'ctx> StateMachine<WriteCtx<'ctx>, WriteStepOut> for Recv {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = WriteStepOut> + Send + 'a>>
    where
        Self: 'a,
        WriteCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut WriteCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let frame = match ctx.conn.recv_frame(ctx.timeout).await {
                Ok(f) => f,
                Err(TransportError::Framing(FramingError::CrcMismatch { expected, computed })) => {
                    warn!(expected, computed, "payload CRC mismatch, requesting retransmit");
                    return match ctx.send_nack().await {
                        Ok(()) => Transition::Stay(Ok(())),
                        Err(e) => Transition::Done(Err(e.into())),
                    };
                },
                Err(e) => {
                    error!(error = %e, "DATA receive failed");
                    return Transition::Done(Err(anyhow!("waiting for DATA: {e}")));
                },
            };

            match frame.known_kind() {
                Some(FrameType::Data) if frame.sequence_number == ctx.peer_seq => {},
                Some(FrameType::Data) => {
                    warn!(
                        expected = ctx.peer_seq,
                        got = frame.sequence_number,
                        "DATA sequence mismatch"
                    );
                    return match ctx.send_nack().await {
                        Ok(()) => Transition::Stay(Ok(())),
                        Err(e) => Transition::Done(Err(e.into())),
                    };
                },
                other => {
                    warn!(kind = ?other, "expected DATA frame");
                    return match ctx.send_nack().await {
                        Ok(()) => Transition::Stay(Ok(())),
                        Err(e) => Transition::Done(Err(e.into())),
                    };
                },
            }

            if let Err(e) = ctx.append(&frame.payload) {
                error!(error = %e, "file write failed");
                let _ = ctx.send_nack().await;
                return Transition::Done(Err(anyhow!("file write failed: {e}")));
            }

            if let Err(e) = ctx.send_ack(frame.sequence_number).await {
                return Transition::Done(Err(e.into()));
            }

            ctx.offset += frame.payload.len() as u64;
            ctx.peer_seq = ctx.peer_seq.wrapping_add(1);

            if frame.is_last_chunk() {
                Transition::Done(Ok(()))
            } else {
                Transition::Stay(Ok(()))
            }
        })
    }
}

impl<'ctx> StateMachineCtx<WriteCtx<'ctx>, u64> for WriteCtx<'ctx> {
    async fn execute(&mut self, _cancel: &CancellationToken) -> Result<u64> {
        info!(file_id_len = self.file_id.len(), "write session started");

        loop {
            let state = self.state.take().context("write session state must be set")?;
            let tr = match state {
                WriteStates::Open(s) => s.step(self).await,
                WriteStates::Recv(s) => s.step(self).await,
            };

            match tr {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(())) => {
                    self.state = Some(WriteStates::Recv(Recv));
                },
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => {
                    if let Some(file) = self.file.take() {
                        file.close();
                    }
                    r?;
                    info!(bytes = self.offset, "write session complete");
                    return Ok(self.offset);
                },
            }
        }
    }
}
