//! SQLite implementation of ResultStore.

use async_trait::async_trait;
use kiln_core::build::{BuildOutcome, BuildReason, BuildResult, CompletedBuild, StepReport};
use kiln_core::ids::{BuilderName, RequestId};
use kiln_core::ports::ResultStore;
use kiln_core::{Error, Result};
use sqlx::{Row, SqlitePool};

const BUILD_COLUMNS: &str = "builder, number, request_id, reason, outcome, worker, steps, \
                             logs_ref, started_at, completed_at";

/// SQLite implementation of ResultStore.
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    /// Create a new SqliteResultStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn str_to_outcome(s: &str) -> BuildOutcome {
        match s {
            "succeeded" => BuildOutcome::Succeeded,
            "failed" => BuildOutcome::Failed,
            "cancelled" => BuildOutcome::Cancelled,
            _ => BuildOutcome::Exception,
        }
    }

    fn row_to_result(&self, r: &sqlx::sqlite::SqliteRow) -> Result<BuildResult> {
        let reason: BuildReason = serde_json::from_str(&r.get::<String, _>("reason"))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let steps: Vec<StepReport> = serde_json::from_str(&r.get::<String, _>("steps"))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let request_id: RequestId = r
            .get::<String, _>("request_id")
            .parse()
            .map_err(|e: uuid::Error| Error::Serialization(e.to_string()))?;
        let outcome_str: String = r.get("outcome");

        Ok(BuildResult {
            builder: BuilderName::new(r.get::<String, _>("builder")),
            number: r.get::<i64, _>("number") as u32,
            request_id,
            reason,
            outcome: Self::str_to_outcome(&outcome_str),
            worker: r.get("worker"),
            steps,
            logs_ref: r.get("logs_ref"),
            started_at: r.get("started_at"),
            completed_at: r.get("completed_at"),
        })
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn append(&self, build: &CompletedBuild) -> Result<BuildResult> {
        let reason_json =
            serde_json::to_string(&build.reason).map_err(|e| Error::Serialization(e.to_string()))?;
        let steps_json =
            serde_json::to_string(&build.steps).map_err(|e| Error::Serialization(e.to_string()))?;

        // The scalar subquery and the insert run as one statement, so the
        // next number per builder is assigned without a gap or a race.
        let row = sqlx::query(
            r#"INSERT INTO builds (builder, number, request_id, reason, outcome, worker, steps, logs_ref, started_at, completed_at)
               VALUES (?1, (SELECT COALESCE(MAX(number), 0) + 1 FROM builds WHERE builder = ?1), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               RETURNING number"#,
        )
        .bind(build.builder.as_str())
        .bind(build.request_id.to_string())
        .bind(&reason_json)
        .bind(build.outcome.as_str())
        .bind(&build.worker)
        .bind(&steps_json)
        .bind(&build.logs_ref)
        .bind(build.started_at)
        .bind(build.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                Error::DuplicateAppend(build.request_id.to_string())
            }
            _ => Error::Database(e.to_string()),
        })?;

        let number = row.get::<i64, _>("number") as u32;
        Ok(BuildResult {
            builder: build.builder.clone(),
            number,
            request_id: build.request_id,
            reason: build.reason.clone(),
            outcome: build.outcome,
            worker: build.worker.clone(),
            steps: build.steps.clone(),
            logs_ref: build.logs_ref.clone(),
            started_at: build.started_at,
            completed_at: build.completed_at,
        })
    }

    async fn get(&self, builder: &BuilderName, number: u32) -> Result<Option<BuildResult>> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE builder = ?1 AND number = ?2"
        ))
        .bind(builder.as_str())
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_result(&r)?)),
            None => Ok(None),
        }
    }

    async fn latest(&self, builder: &BuilderName) -> Result<Option<BuildResult>> {
        let row = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE builder = ?1 ORDER BY number DESC LIMIT 1"
        ))
        .bind(builder.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(self.row_to_result(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_recent(
        &self,
        builder: &BuilderName,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<BuildResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE builder = ?1 ORDER BY number DESC LIMIT ?2 OFFSET ?3"
        ))
        .bind(builder.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(|r| self.row_to_result(r)).collect()
    }
}
