// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod handoff_persister;

// Re-export the coordinator API for convenience
pub use coordinator::{Coordinator, CoordinatorDeps, CoordinatorHandle, JobStatus};
