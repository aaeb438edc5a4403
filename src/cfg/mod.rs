// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Configuration loading, path resolution, and logging setup.

/// Config path resolution.
pub mod cli;
/// Configuration file parsing and validation.
pub mod config;
/// Logger initialization.
pub mod logger;
