//! Job store implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use pagesnap_core::{
    ClaimOutcome, Error, Job, JobCounts, JobStatus, JobStore, Result, TransitionOutcome,
};

const JOB_COLUMNS: &str =
    "id, source_uri, status::text AS status, artifact_uri, failure_reason, created_at, updated_at";

/// PostgreSQL implementation of [`JobStore`].
///
/// Every status change is a single `UPDATE … WHERE status = <expected>`, so
/// concurrent workers racing on the same job see exactly one winner.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.try_get("status").map_err(Error::Database)?;
        Ok(Job {
            id: row.try_get("id").map_err(Error::Database)?,
            source_uri: row.try_get("source_uri").map_err(Error::Database)?,
            status: status.parse()?,
            artifact_uri: row.try_get("artifact_uri").map_err(Error::Database)?,
            failure_reason: row.try_get("failure_reason").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            updated_at: row.try_get("updated_at").map_err(Error::Database)?,
        })
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    /// Move a `started` job to `target`, setting exactly one outcome column.
    async fn finish(
        &self,
        id: Uuid,
        target: JobStatus,
        artifact_uri: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = $2::job_status, artifact_uri = $3, failure_reason = $4, updated_at = $5
             WHERE id = $1 AND status = 'started'::job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(target.as_str())
        .bind(artifact_uri)
        .bind(failure_reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(Self::parse_job_row(row)?));
        }

        let current = self.fetch(id).await?.ok_or(Error::JobNotFound(id))?;
        warn!(
            subsystem = "db",
            component = "jobs",
            op = "finish",
            job_id = %id,
            current = %current.status,
            target = %target,
            "Terminal write rejected, job not in started state"
        );
        Ok(TransitionOutcome::Rejected(current))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, source_uri, status, created_at, updated_at)
             VALUES ($1, $2, $3::job_status, $4, $5)",
        )
        .bind(job.id)
        .bind(&job.source_uri)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(subsystem = "db", component = "jobs", op = "insert", job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.fetch(id).await
    }

    async fn claim(&self, id: Uuid) -> Result<ClaimOutcome> {
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = 'started'::job_status, updated_at = $2
             WHERE id = $1 AND status = 'submitted'::job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = row {
            return Ok(ClaimOutcome::Claimed(Self::parse_job_row(row)?));
        }

        // Lost the conditional write: classify what is there now.
        Ok(match self.fetch(id).await? {
            None => ClaimOutcome::Missing,
            Some(job) if job.status.is_terminal() => ClaimOutcome::Terminal(job),
            Some(job) => ClaimOutcome::InProgress(job),
        })
    }

    async fn complete(&self, id: Uuid, artifact_uri: &str) -> Result<TransitionOutcome> {
        self.finish(id, JobStatus::Done, Some(artifact_uri), None)
            .await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome> {
        self.finish(id, JobStatus::Failed, None, Some(reason)).await
    }

    async fn status_counts(&self) -> Result<JobCounts> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'submitted') AS submitted,
                COUNT(*) FILTER (WHERE status = 'started') AS started,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(JobCounts {
            submitted: row.try_get("submitted").map_err(Error::Database)?,
            started: row.try_get("started").map_err(Error::Database)?,
            done: row.try_get("done").map_err(Error::Database)?,
            failed: row.try_get("failed").map_err(Error::Database)?,
        })
    }
}
