// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordinator metrics, recorded through the `metrics` facade. Nothing is exported
//! unless the binary installs a recorder (the daemon installs the Prometheus exporter).

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Duration;

use crate::domain::job::{JobKind, JobState};
use crate::domain::retry::ErrorClass;

pub fn describe_metrics() {
    describe_counter!("baton_jobs_submitted_total", "Jobs accepted by the coordinator");
    describe_counter!("baton_jobs_finished_total", "Jobs that reached a terminal state");
    describe_gauge!("baton_jobs_running", "Jobs currently running");
    describe_counter!("baton_retries_total", "Retries scheduled, by error class");
    describe_counter!("baton_preemptions_total", "Waiting Style jobs re-queued for a Fix job");
    describe_histogram!(
        "baton_job_duration_seconds",
        Unit::Seconds,
        "Wall time of a single run attempt"
    );
}

pub fn record_submitted(kind: JobKind) {
    counter!("baton_jobs_submitted_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_finished(kind: JobKind, state: JobState) {
    counter!(
        "baton_jobs_finished_total",
        "kind" => kind.as_str(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_started(kind: JobKind) {
    gauge!("baton_jobs_running", "kind" => kind.as_str()).increment(1.0);
}

pub fn record_stopped(kind: JobKind, ran_for: Duration) {
    gauge!("baton_jobs_running", "kind" => kind.as_str()).decrement(1.0);
    histogram!("baton_job_duration_seconds", "kind" => kind.as_str()).record(ran_for.as_secs_f64());
}

pub fn record_retry(class: ErrorClass) {
    counter!("baton_retries_total", "class" => class.as_str()).increment(1);
}

pub fn record_preemption() {
    counter!("baton_preemptions_total").increment(1);
}
