// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod deployment;
pub mod event_bus;
pub mod handoff_store;
pub mod metrics;
pub mod process;
pub mod shell_executor;
pub mod workspace;

pub use deployment::CommandDeploymentPlatform;
pub use handoff_store::{FileHandoffRepository, InMemoryHandoffRepository};
pub use shell_executor::ShellExecutor;
pub use workspace::CommandWorkspaceInspector;
