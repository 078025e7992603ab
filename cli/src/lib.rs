// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Baton CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Daemon HTTP API, daemon client and the `baton` subcommands

pub mod commands;
pub mod daemon;
pub mod embedded;
