// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolve a config path to an absolute, canonical location.
///
/// A `CFTP_CONFIG` environment variable overrides the given path; relative
/// paths are taken from the current working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let chosen = std::env::var("CFTP_CONFIG").unwrap_or_else(|_| rel.to_string());
    let p = Path::new(&chosen);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
