// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure scheduling types and policies: jobs, locks, the priority queue, retry and
//! timeout policy, handoffs and the capabilities the coordinator depends on.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Owns the job state machine and every scheduling rule

pub mod config;
pub mod deployment;
pub mod error;
pub mod events;
pub mod executor;
pub mod handoff;
pub mod job;
pub mod lock;
pub mod precondition;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod supervisor;
pub mod timeout;
