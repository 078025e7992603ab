// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Handoff Persister Application Service
//!
//! Writes handoffs produced by the coordinator (soft-deadline checkpoints and finalized
//! handoffs) to the [`HandoffRepository`] on a background task.
//!
//! - Saves are applied strictly in submission order, so a provisional checkpoint can never
//!   overwrite the finalized handoff of the same job
//! - Never crashes the coordinator: failures are logged and counted
//! - Drains and exits once every [`HandoffSink`] has been dropped

use crate::domain::handoff::HandoffContext;
use crate::domain::repository::HandoffRepository;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sending half handed to the coordinator.
#[derive(Clone)]
pub struct HandoffSink {
    tx: mpsc::UnboundedSender<HandoffContext>,
}

impl HandoffSink {
    pub fn persist(&self, handoff: HandoffContext) {
        if self.tx.send(handoff).is_err() {
            warn!("Handoff persister has stopped; handoff not saved");
        }
    }
}

pub struct HandoffPersister {
    repository: Arc<dyn HandoffRepository>,
}

impl HandoffPersister {
    pub fn new(repository: Arc<dyn HandoffRepository>) -> Self {
        Self { repository }
    }

    /// Spawns the background task. Await the handle after dropping the sink to make sure
    /// everything queued has been written.
    pub fn start(self) -> (HandoffSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HandoffContext>();
        info!("Starting handoff persister background task");

        let handle = tokio::spawn(async move {
            let mut saved = 0u64;
            let mut errors = 0u64;

            while let Some(handoff) = rx.recv().await {
                match self.repository.save(&handoff).await {
                    Ok(()) => {
                        saved += 1;
                        debug!(
                            job_id = %handoff.job_id(),
                            is_final = handoff.is_final(),
                            "Handoff persisted"
                        );
                    }
                    Err(e) => {
                        errors += 1;
                        error!(job_id = %handoff.job_id(), error = %e, "Failed to persist handoff");
                        if errors % 10 == 0 {
                            warn!("Handoff persistence has failed {} times", errors);
                        }
                    }
                }
            }

            info!(
                "Handoff persister shut down gracefully (saved {} handoffs, {} errors)",
                saved, errors
            );
        });

        (HandoffSink { tx }, handle)
    }
}
