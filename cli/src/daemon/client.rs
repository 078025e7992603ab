// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with daemon API

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use baton_core::{
    application::JobStatus,
    domain::{
        events::JobEvent,
        handoff::HandoffContext,
        job::{JobId, JobRequest},
    },
};

use super::base_url;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            // no global timeout: `wait` and `events` hold long-lived streams
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    pub async fn submit(&self, request: &JobRequest) -> Result<JobId> {
        let response = self
            .client
            .post(format!("{}/api/jobs", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to submit job")?;

        #[derive(Deserialize)]
        struct SubmitResponse {
            job_id: JobId,
        }

        let submitted: SubmitResponse = parse(response, "submit job").await?;
        Ok(submitted.job_id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await
            .context("Failed to get job status")?;
        parse(response, "get job status").await
    }

    pub async fn list(&self) -> Result<Vec<JobStatus>> {
        let response = self
            .client
            .get(format!("{}/api/jobs", self.base_url))
            .send()
            .await
            .context("Failed to list jobs")?;
        parse(response, "list jobs").await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/jobs/{}/cancel", self.base_url, job_id))
            .send()
            .await
            .context("Failed to cancel job")?;
        let _: serde_json::Value = parse(response, "cancel job").await?;
        Ok(())
    }

    pub async fn handoff(&self, job_id: JobId) -> Result<HandoffContext> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}/handoff", self.base_url, job_id))
            .send()
            .await
            .context("Failed to get handoff")?;
        parse(response, "get handoff").await
    }

    /// Streams job events, optionally for one job, calling `on_event` until it returns
    /// `false` or the daemon closes the stream.
    pub async fn events(&self, job_id: Option<JobId>, mut on_event: impl FnMut(JobEvent) -> bool) -> Result<()> {
        let mut url = format!("{}/api/events", self.base_url);
        if let Some(id) = job_id {
            url.push_str(&format!("?job_id={}", id));
        }

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to stream events: {}", error_text);
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read event stream chunk")?
        {
            buffer.extend_from_slice(&chunk);
            for line in drain_lines(&mut buffer) {
                let Some(data) = line.trim_end().strip_prefix("data:") else {
                    continue;
                };
                if let Ok(event) = serde_json::from_str::<JobEvent>(data.trim_start()) {
                    if !on_event(event) {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolves once the job is terminal. Follows the event stream and polls status as a
    /// fallback for a finish that lands before the stream is connected.
    pub async fn wait(&self, job_id: JobId, mut on_event: impl FnMut(&JobEvent)) -> Result<JobStatus> {
        let follow = self.events(Some(job_id), |event| {
            on_event(&event);
            !event.is_terminal()
        });
        let poll = async {
            loop {
                let status = self.status(job_id).await?;
                if status.state.is_terminal() {
                    return Ok::<_, anyhow::Error>(status);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            followed = follow => {
                followed?;
                self.status(job_id).await
            }
            status = poll => status,
        }
    }
}

/// Removes every complete line from `buffer`. Bytes after the last newline stay
/// buffered, so a multi-byte character split across chunks decodes intact.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last) = buffer.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = buffer.drain(..=last).collect();
    complete
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

async fn parse<T: DeserializeOwned>(response: Response, action: &str) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(body);
        anyhow::bail!("Failed to {} ({}): {}", action, status, message);
    }
    response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", action))
}
