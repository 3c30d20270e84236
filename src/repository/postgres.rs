use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{ensure_owned, ExecutionRepository};
use crate::error::{Error, Result};
use crate::types::{Execution, ExecutionStatus};

/// Repository over the `executions` table; the stage graph is stored as JSONB
#[derive(Clone)]
pub struct PgExecutionRepository {
    pool: PgPool,
    partition: Option<String>,
}

impl PgExecutionRepository {
    pub fn new(pool: PgPool, partition: Option<String>) -> Self {
        Self { pool, partition }
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    async fn load(&self, execution_id: &str) -> Result<Execution> {
        let row = sqlx::query("SELECT body FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;

        let body: serde_json::Value = row.get("body");
        Ok(serde_json::from_value(body)?)
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        ensure_owned(self, execution)?;
        let body = serde_json::to_value(execution)?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, type, application, partition, status, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                body = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(&execution.id)
        .bind(execution.execution_type)
        .bind(&execution.application)
        .bind(&execution.partition)
        .bind(execution.status)
        .bind(body)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, execution_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM executions WHERE id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }

    async fn running_executions(&self) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM executions
            WHERE status = $1
              AND ($2::text IS NULL OR partition = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(ExecutionStatus::Running)
        .bind(self.partition.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let body: serde_json::Value = row.get("body");
                serde_json::from_value(body).map_err(Error::from)
            })
            .collect()
    }
}
