// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Job Events
//
// In-memory event streaming using tokio broadcast channels. Feeds the SSE endpoint,
// the CLI `wait` helpers and tests. Events are lost on restart; finalized handoffs
// are what survives (see handoff_store).

use crate::domain::events::JobEvent;
use crate::domain::job::JobId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to job events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: JobEvent) {
        debug!(job_id = %event.job_id(), "Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all job events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single job
    pub fn subscribe_job(&self, job_id: JobId) -> JobEventReceiver {
        JobEventReceiver {
            receiver: self.sender.subscribe(),
            job_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all job events
pub struct EventReceiver {
    receiver: broadcast::Receiver<JobEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<JobEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<JobEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one job
pub struct JobEventReceiver {
    receiver: broadcast::Receiver<JobEvent>,
    job_id: JobId,
}

impl JobEventReceiver {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Receive the next event for this job, skipping everything else
    pub async fn recv(&mut self) -> Result<JobEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.job_id() == self.job_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobKind;
    use chrono::Utc;

    fn started(job_id: JobId) -> JobEvent {
        JobEvent::JobStarted {
            job_id,
            kind: JobKind::Fix,
            attempt: 1,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();
        let job_id = JobId::new();

        event_bus.publish(started(job_id));

        match receiver.recv().await.unwrap() {
            JobEvent::JobStarted { job_id: id, .. } => assert_eq!(id, job_id),
            _ => panic!("Wrong event type received"),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_job_event_filtering() {
        let event_bus = EventBus::new(10);
        let job_id = JobId::new();
        let mut receiver = event_bus.subscribe_job(job_id);

        // different job, filtered out
        event_bus.publish(started(JobId::new()));
        event_bus.publish(started(job_id));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.job_id(), job_id);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish(started(JobId::new()));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_dropped_events() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();
        for _ in 0..5 {
            event_bus.publish(started(JobId::new()));
        }
        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(3))));
    }
}
