// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Listening endpoint and per-client supervision.
//!
//! One long-lived acceptor task; one detached task per accepted connection.
//! Handler tasks are never joined: each one owns its connection and client
//! state outright and tears both down on exit. Concurrency is bounded by a
//! semaphore: a connection arriving with no free permit is accepted and
//! closed on the spot, leaving running sessions undisturbed.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket},
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{cfg::config::ServiceSettings, fs::FileStore, service::handler};

/// A running service instance. Dropping it leaks the acceptor task; call
/// [`FtpService::shutdown`] for an orderly stop.
pub struct FtpService {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    acceptor: JoinHandle<()>,
}

impl FtpService {
    /// Bind the configured endpoint and start accepting transfer sessions.
    pub async fn start(settings: ServiceSettings, store: Arc<dyn FileStore>) -> Result<Self> {
        let ip = settings
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {:?}", settings.bind_address))?;
        let addr = SocketAddr::new(ip, settings.port);

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket.listen(settings.backlog)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let slots = Arc::new(Semaphore::new(settings.max_clients));

        info!(
            %local_addr,
            max_clients = settings.max_clients,
            "file transfer service listening"
        );

        let acceptor = tokio::spawn(accept_loop(
            listener,
            settings,
            store,
            slots,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            acceptor,
        })
    }

    /// Address the service actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and wait for the acceptor to stop. Outstanding
    /// handlers observe the same token at their next I/O point.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.acceptor.await {
            error!(error = %e, "acceptor task panicked");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: ServiceSettings,
    store: Arc<dyn FileStore>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                },
            },
        };

        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            warn!(%peer, "client limit reached, refusing connection");
            drop(stream);
            continue;
        };

        info!(%peer, "accepted connection");
        let store = Arc::clone(&store);
        let settings = settings.clone();
        let child = cancel.child_token();
        tokio::spawn(async move {
            handler::handle_client(stream, peer, store, &settings, child).await;
            drop(permit);
        });
    }

    info!("acceptor stopped");
}
