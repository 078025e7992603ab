// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Baton CLI

pub mod config;
pub mod daemon;
pub mod handoff;
pub mod job;
pub mod run;

pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
pub use self::handoff::HandoffCommand;
pub use self::job::JobCommand;
pub use self::run::RunArgs;
