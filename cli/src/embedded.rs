// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedded coordinator
//!
//! Wires the configured executor, workspace inspector, deployment platform and handoff
//! store into an in-process coordinator. Used by the daemon and by `baton run`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use baton_core::{
    application::{Coordinator, CoordinatorDeps, CoordinatorHandle},
    domain::{config::SchedulerConfigManifest, repository::HandoffRepository},
    infrastructure::{
        CommandDeploymentPlatform, CommandWorkspaceInspector, FileHandoffRepository,
        InMemoryHandoffRepository, ShellExecutor,
    },
};

pub struct EmbeddedCoordinator {
    handle: CoordinatorHandle,
    handoffs: Arc<dyn HandoffRepository>,
    config: SchedulerConfigManifest,
}

impl EmbeddedCoordinator {
    /// Loads, validates and starts.
    pub async fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = SchedulerConfigManifest::load_or_default(config_path)
            .context("Failed to load configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: SchedulerConfigManifest) -> Result<Self> {
        let spec = &config.spec;
        let settings = spec.scheduler_settings()?;
        let shell = spec.executors.shell.as_str();
        let workdir = spec.workspace.root.clone();

        let handoffs: Arc<dyn HandoffRepository> = match &spec.handoff_dir {
            Some(dir) => {
                info!("Persisting handoffs to {:?}", dir);
                Arc::new(
                    FileHandoffRepository::open(dir)
                        .await
                        .with_context(|| format!("Failed to open handoff directory {:?}", dir))?,
                )
            }
            None => Arc::new(InMemoryHandoffRepository::new()),
        };

        let executor = Arc::new(ShellExecutor::new(&spec.executors, workdir.clone()));
        let mut deps = CoordinatorDeps::new(executor).with_handoffs(handoffs.clone());
        match CommandWorkspaceInspector::from_config(&spec.workspace, shell) {
            Some(inspector) => deps = deps.with_inspector(Arc::new(inspector)),
            None => info!("No workspace root configured, preconditions are skipped"),
        }
        if let Some(deployment) = &spec.deployment {
            deps = deps.with_platform(Arc::new(CommandDeploymentPlatform::new(
                deployment,
                shell,
                workdir,
            )));
        }

        let handle = Coordinator::start(settings, deps);
        Ok(Self {
            handle,
            handoffs,
            config,
        })
    }

    pub fn handle(&self) -> &CoordinatorHandle {
        &self.handle
    }

    pub fn handoffs(&self) -> Arc<dyn HandoffRepository> {
        self.handoffs.clone()
    }

    pub fn config(&self) -> &SchedulerConfigManifest {
        &self.config
    }

    /// Cancels pending jobs and waits for running ones to wind down.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}
