// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection dispatch: one opening command, one session, teardown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::ServiceSettings,
    fs::FileStore,
    models::{
        command::{Command, CommandCode, ResponseCode},
        frame::{Frame, FrameFlags, FrameType},
    },
    state_machine::{common::StateMachineCtx, read_states::ReadCtx, write_states::WriteCtx},
    transport::FrameConnection,
};

/// Drive one accepted connection to completion. The connection is closed
/// exactly once, when the `FrameConnection` goes out of scope here,
/// regardless of how the session ends.
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<dyn FileStore>,
    settings: &ServiceSettings,
    cancel: CancellationToken,
) {
    let mut conn = FrameConnection::from_stream(stream, cancel.clone());
    let timeout = settings.session_timeout;
    info!(%peer, "client handler started");

    let frame = match conn.recv_frame(timeout).await {
        Ok(f) => f,
        Err(e) => {
            warn!(%peer, error = %e, "command receive failed");
            return;
        },
    };

    if frame.known_kind() != Some(FrameType::Command) {
        warn!(%peer, kind = ?frame.kind, "expected opening COMMAND frame");
        return;
    }

    let command = match Command::parse(&frame.payload) {
        Ok(c) => c,
        Err(e) => {
            warn!(%peer, error = %e, "malformed command");
            respond_error(&mut conn, timeout).await;
            return;
        },
    };

    match command.code {
        CommandCode::Read => {
            let outcome = ReadCtx::new(&mut conn, store, command.file_id, timeout)
                .execute(&cancel)
                .await;
            log_outcome(peer, "read", outcome);
        },
        CommandCode::Write => {
            let outcome = WriteCtx::new(&mut conn, store, command.file_id, timeout)
                .execute(&cancel)
                .await;
            log_outcome(peer, "write", outcome);
        },
        // Abort carries no reply; the peer closes without confirmation.
        CommandCode::Abort => info!(%peer, "abort requested"),
    }

    info!(%peer, "client handler terminated");
}

fn log_outcome(peer: SocketAddr, role: &str, outcome: anyhow::Result<u64>) {
    match outcome {
        Ok(bytes) => info!(%peer, role, bytes, "session complete"),
        Err(e) => warn!(%peer, role, error = %e, "session failed"),
    }
}

async fn respond_error(conn: &mut FrameConnection, timeout: Duration) {
    let frame = Frame::new(
        FrameType::Response,
        FrameFlags::empty(),
        0,
        Bytes::copy_from_slice(&ResponseCode::Error.to_payload()),
    );
    if let Err(e) = conn.send_frame(&frame, timeout).await {
        warn!(error = %e, "failed to send error response");
    }
}
