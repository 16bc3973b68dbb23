//! Trace Sink
//!
//! Job traces are append-only JSON arrays in blob storage. Runners may resend
//! chunks, so every append keeps only entries newer than the stored tail.

use std::sync::Arc;

use conveyor_core::domain::job::Job;
use conveyor_core::domain::trace::TraceEntry;
use conveyor_core::dto::trace::JobTracePage;

use super::{DispatchError, Result};
use crate::storage::{BlobStore, StorageError, trace_key};

/// Merge a new chunk onto the stored trace.
///
/// With a non-empty `previous`, only entries whose timestamp is strictly
/// greater than the last stored timestamp are appended.
pub fn merge_trace(previous: Vec<TraceEntry>, chunk: Vec<TraceEntry>) -> Vec<TraceEntry> {
    let Some(last_ts) = previous.last().map(|entry| entry.timestamp) else {
        return chunk;
    };

    let mut merged = previous;
    merged.extend(chunk.into_iter().filter(|entry| entry.timestamp > last_ts));
    merged
}

#[derive(Clone)]
pub struct TraceSink {
    blobs: Arc<dyn BlobStore>,
}

impl TraceSink {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Append a chunk to the job's trace.
    ///
    /// Returns the last timestamp of the merged trace, or `None` when the
    /// chunk was empty and nothing was written.
    pub async fn append_trace(&self, job: &Job, chunk: Vec<TraceEntry>) -> Result<Option<i64>> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let key = trace_key(job.project_id, job.job_type, job.id);
        // An unreadable previous trace is treated like a missing one
        let previous = match self.read(&key).await {
            Ok(entries) => entries,
            Err(DispatchError::TraceExpired) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read trace of job {}: {}", job.id, e);
                Vec::new()
            }
        };

        let merged = merge_trace(previous, chunk);
        let last_ts = merged.last().map(|entry| entry.timestamp);

        let bytes = serde_json::to_vec(&merged)
            .map_err(|e| DispatchError::BadRequest(format!("unserializable trace: {e}")))?;
        self.blobs.upload(&key, bytes).await?;

        tracing::debug!("Trace of job {} now has {} entries", job.id, merged.len());

        Ok(last_ts)
    }

    /// Read a page of the job's trace.
    ///
    /// `after` is a position: with a positive value only entries at a greater
    /// index are returned.
    pub async fn get_trace(&self, job: &Job, after: Option<i64>) -> Result<JobTracePage> {
        let entries = self
            .read(&trace_key(job.project_id, job.job_type, job.id))
            .await?;
        let end_cursor = entries.len() as i64 - 1;

        let entries = match after {
            Some(after) if after > 0 => {
                let skip = usize::try_from(after)
                    .ok()
                    .and_then(|after| after.checked_add(1))
                    .unwrap_or(usize::MAX);
                entries.into_iter().skip(skip).collect()
            }
            _ => entries,
        };

        Ok(JobTracePage {
            entries,
            end_cursor,
            has_more: job.ended_at.is_none(),
        })
    }

    async fn read(&self, key: &str) -> Result<Vec<TraceEntry>> {
        let bytes = match self.blobs.get(key).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Err(DispatchError::TraceExpired),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!("Corrupt trace blob {}: {}", key, e);
            DispatchError::TraceExpired
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use chrono::Utc;
    use conveyor_core::domain::job::{JobStatus, JobType};
    use conveyor_core::domain::trace::TraceLevel;

    fn entry(ts: i64, message: &str) -> TraceEntry {
        TraceEntry::new(TraceLevel::Info, ts, message)
    }

    fn job() -> Job {
        Job {
            id: 5,
            iid: 1,
            project_id: 2,
            job_type: JobType::LabAnalyze,
            entity_id: 9,
            zone: "eu".to_string(),
            status: JobStatus::Running,
            runner_id: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            duration: None,
            extra: None,
        }
    }

    #[test]
    fn test_merge_keeps_only_newer_entries() {
        let merged = merge_trace(
            vec![entry(1, "a"), entry(5, "b")],
            vec![entry(4, "stale"), entry(5, "dup"), entry(6, "c")],
        );
        let messages: Vec<&str> = merged.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_onto_empty_keeps_chunk_as_is() {
        let chunk = vec![entry(3, "x"), entry(2, "y")];
        assert_eq!(merge_trace(Vec::new(), chunk.clone()), chunk);
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let sink = TraceSink::new(blobs.clone());
        let job = job();
        let chunk = vec![entry(10, "start"), entry(20, "step")];

        assert_eq!(sink.append_trace(&job, chunk.clone()).await.unwrap(), Some(20));
        assert_eq!(sink.append_trace(&job, chunk).await.unwrap(), Some(20));

        let page = sink.get_trace(&job, None).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.end_cursor, 1);
        assert!(page.has_more);
        assert!(blobs.contains("logs/2/LabAnalyze/5.json"));
    }

    #[tokio::test]
    async fn test_empty_chunk_writes_nothing() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let sink = TraceSink::new(blobs.clone());

        assert_eq!(sink.append_trace(&job(), Vec::new()).await.unwrap(), None);
        assert!(!blobs.contains("logs/2/LabAnalyze/5.json"));
    }

    #[tokio::test]
    async fn test_get_trace_pages_by_position() {
        let sink = TraceSink::new(Arc::new(MemoryBlobStore::new()));
        let mut job = job();
        sink.append_trace(
            &job,
            vec![entry(1, "a"), entry(2, "b"), entry(3, "c"), entry(4, "d")],
        )
        .await
        .unwrap();

        job.ended_at = Some(Utc::now());
        let page = sink.get_trace(&job, Some(1)).await.unwrap();
        let messages: Vec<&str> = page.entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["c", "d"]);
        assert_eq!(page.end_cursor, 3);
        assert!(!page.has_more);

        // Zero is not a cursor
        assert_eq!(sink.get_trace(&job, Some(0)).await.unwrap().entries.len(), 4);

        let past_end = sink.get_trace(&job, Some(i64::MAX)).await.unwrap();
        assert!(past_end.entries.is_empty());
        assert_eq!(past_end.end_cursor, 3);
    }

    #[tokio::test]
    async fn test_missing_trace_has_expired() {
        let sink = TraceSink::new(Arc::new(MemoryBlobStore::new()));
        assert!(matches!(
            sink.get_trace(&job(), None).await,
            Err(DispatchError::TraceExpired)
        ));
    }
}
