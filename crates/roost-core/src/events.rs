use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::job::Priority;
use crate::models::Source;

/// Progress notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
        priority: Priority,
    },
    Started {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
        attempt: u32,
    },
    Completed {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
        properties_found: u32,
        properties_processed: u32,
    },
    Retrying {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
        kind: ErrorKind,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
        kind: ErrorKind,
        attempts: u32,
    },
    Cancelled {
        job_id: Uuid,
        batch_id: Option<Uuid>,
        source: Source,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::DeadLettered { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Queued { batch_id, .. }
            | JobEvent::Started { batch_id, .. }
            | JobEvent::Completed { batch_id, .. }
            | JobEvent::Retrying { batch_id, .. }
            | JobEvent::DeadLettered { batch_id, .. }
            | JobEvent::Cancelled { batch_id, .. } => *batch_id,
        }
    }

    /// Whether this is the last event a job will ever produce.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::DeadLettered { .. } | JobEvent::Cancelled { .. }
        )
    }

    /// Emit the event through `tracing`.
    pub fn log(&self) {
        match self {
            JobEvent::Queued {
                job_id,
                source,
                priority,
                ..
            } => {
                tracing::debug!(%job_id, %source, %priority, "Job queued");
            }
            JobEvent::Started {
                job_id,
                source,
                attempt,
                ..
            } => {
                tracing::info!(%job_id, %source, %attempt, "Processing job");
            }
            JobEvent::Completed {
                job_id,
                source,
                properties_found,
                properties_processed,
                ..
            } => {
                tracing::info!(
                    %job_id,
                    %source,
                    %properties_found,
                    %properties_processed,
                    "Job completed"
                );
            }
            JobEvent::Retrying {
                job_id,
                source,
                kind,
                attempt,
                retry_at,
                ..
            } => {
                tracing::warn!(%job_id, %source, %kind, %attempt, %retry_at, "Job failed, will retry");
            }
            JobEvent::DeadLettered {
                job_id,
                source,
                kind,
                attempts,
                ..
            } => {
                tracing::error!(%job_id, %source, %kind, %attempts, "Job dead-lettered");
            }
            JobEvent::Cancelled { job_id, source, .. } => {
                tracing::info!(%job_id, %source, "Job cancelled");
            }
        }
    }
}
