// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use cftp_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    fs::{FileStore, local::DirStore},
    service::acceptor::FtpService,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());
    let root = args.next().unwrap_or_else(|| "./files".to_string());

    let _logger = init_logger("config_logger.yaml")?;

    let cfg = resolve_config_path(&config_path)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let store: Arc<dyn FileStore> = Arc::new(DirStore::new(&root)?);
    let service = FtpService::start(cfg.service.clone(), store).await?;
    info!(addr = %service.local_addr(), root = %root, "service running, Ctrl-C stops");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    service.shutdown().await;

    Ok(())
}
