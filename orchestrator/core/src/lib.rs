// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Baton Core
//!
//! Deterministic coordination of competing jobs over shared resources: exclusive
//! resource locks, a priority queue with per-kind ceilings, soft/hard deadlines, a
//! class-based retry policy and resumable handoffs.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library behind the `baton` CLI and daemon

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
