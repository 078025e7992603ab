// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shell Executor
//!
//! Runs the configured command for a job kind as `<shell> -c <command>` and reads a
//! line protocol from its stdout:
//!
//! | Line | Effect |
//! |------|--------|
//! | `::step::<text>` | completed step appended to the handoff |
//! | `::modified::<path>` / `::created::<path>` | touched file |
//! | `::build::passing` / `::build::failing` | build status |
//! | `::next::<text>` | remaining step |
//! | `::verify::` | post-deploy verification started (Ship) |
//! | `::error::<text>` | failure message used for classification |
//! | `::class::<class>` | explicit error class (`transient`, `build`, ...) |
//!
//! Everything else is logged at debug level. Job metadata is passed as `BATON_*`
//! environment variables. At the soft deadline the executor writes `wind-down` to
//! the child's stdin; the process is killed if the supervisor drops it.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::domain::config::ExecutorsConfig;
use crate::domain::executor::{ExecutionContext, ExecutionSummary, Executor, ExecutorError};
use crate::domain::handoff::{BuildStatus, FileChange};
use crate::domain::job::{Job, JobKind};
use crate::domain::retry::ErrorClass;
use crate::infrastructure::process::{shell_command, tail, ProcessGroup, DIAGNOSTIC_TAIL_LINES};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Step(String),
    Modified(String),
    Created(String),
    Build(BuildStatus),
    Next(String),
    Verify,
    Error(String),
    Class(ErrorClass),
}

fn parse_directive(line: &str) -> Option<Directive> {
    let rest = line.trim_end().strip_prefix("::")?;
    let (name, value) = rest.split_once("::")?;
    let value = value.trim();
    let directive = match name {
        "step" => Directive::Step(value.to_string()),
        "modified" => Directive::Modified(value.to_string()),
        "created" => Directive::Created(value.to_string()),
        "build" => Directive::Build(match value {
            "passing" | "pass" | "ok" => BuildStatus::Passing,
            "failing" | "fail" => BuildStatus::Failing,
            _ => BuildStatus::Unknown,
        }),
        "next" => Directive::Next(value.to_string()),
        "verify" => Directive::Verify,
        "error" => Directive::Error(value.to_string()),
        "class" => Directive::Class(value.parse().ok()?),
        _ => return None,
    };
    Some(directive)
}

pub struct ShellExecutor {
    shell: String,
    commands: BTreeMap<JobKind, String>,
    env: HashMap<String, String>,
    workdir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(config: &ExecutorsConfig, workdir: Option<PathBuf>) -> Self {
        Self {
            shell: config.shell.clone(),
            commands: config.commands.clone(),
            env: config.env.clone(),
            workdir,
        }
    }

    fn job_env(&self, ctx: &ExecutionContext, job: &Job) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.insert("BATON_JOB_ID".into(), job.id.to_string());
        env.insert("BATON_JOB_KIND".into(), job.kind.to_string());
        env.insert("BATON_ATTEMPT".into(), ctx.attempt.to_string());
        env.insert(
            "BATON_RESOURCES".into(),
            job.resources().iter().cloned().collect::<Vec<_>>().join("\n"),
        );
        if let Some(feature) = &job.feature {
            env.insert("BATON_FEATURE".into(), feature.clone());
        }
        if let Some(error) = &ctx.previous_error {
            env.insert("BATON_PREVIOUS_ERROR".into(), error.clone());
        }
        if let Some(predecessor) = &ctx.predecessor {
            match predecessor.to_json_pretty() {
                Ok(json) => {
                    env.insert("BATON_PREDECESSOR_HANDOFF".into(), json);
                }
                Err(e) => warn!(job_id = %job.id, "Could not serialize predecessor handoff: {}", e),
            }
        }
        env
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, ctx: ExecutionContext, job: Job) -> Result<ExecutionSummary, ExecutorError> {
        let command = self.commands.get(&job.kind).ok_or_else(|| {
            ExecutorError::new(format!("no executor command configured for {} jobs", job.kind))
        })?;

        let env = self.job_env(&ctx, &job);
        let mut cmd = shell_command(&self.shell, command, self.workdir.as_deref(), &env);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorError::new(format!("failed to spawn executor: {}", e)))?;
        let _group = ProcessGroup::of(&child);
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecutorError::new("executor stdio was not captured"));
        };
        let mut stdin = child.stdin.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut summary = ExecutionSummary::default();
        let mut reported_error: Option<String> = None;
        let mut class_hint: Option<ErrorClass> = None;
        let mut wind_down_sent = false;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(job_id = %job.id, "Failed reading executor output: {}", e);
                            break;
                        }
                    };
                    match parse_directive(&line) {
                        Some(Directive::Step(step)) => ctx.record_step(step),
                        Some(Directive::Modified(path)) => ctx.record_file(path, FileChange::Modified),
                        Some(Directive::Created(path)) => ctx.record_file(path, FileChange::Created),
                        Some(Directive::Build(status)) => {
                            summary.build_status = Some(status);
                            ctx.set_build_status(status);
                        }
                        Some(Directive::Next(step)) => {
                            summary.next_steps.push(step);
                            ctx.set_next_steps(summary.next_steps.clone());
                        }
                        Some(Directive::Verify) => ctx.enter_verification(),
                        Some(Directive::Error(message)) => reported_error = Some(message),
                        Some(Directive::Class(class)) => class_hint = Some(class),
                        None => debug!(job_id = %job.id, "executor: {}", line),
                    }
                }
                _ = ctx.wind_down_requested(), if !wind_down_sent => {
                    wind_down_sent = true;
                    if let Some(pipe) = stdin.as_mut() {
                        if let Err(e) = pipe.write_all(b"wind-down\n").await {
                            debug!(job_id = %job.id, "Executor stdin closed before wind-down: {}", e);
                        }
                        let _ = pipe.flush().await;
                    }
                }
            }
        }
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutorError::new(format!("failed waiting for executor: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(summary);
        }

        let diagnostic = tail(&stderr, DIAGNOSTIC_TAIL_LINES);
        let message = reported_error
            .or_else(|| diagnostic.lines().last().map(str::to_string))
            .unwrap_or_else(|| format!("executor exited with {}", status));
        let mut error = ExecutorError::new(message);
        error.class_hint = class_hint;
        if let Some(code) = status.code() {
            error = error.with_exit_code(code);
        }
        if !diagnostic.is_empty() {
            error = error.with_diagnostic(diagnostic);
        }
        Err(error)
    }
}
