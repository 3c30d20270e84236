use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::event::InterlinkEvent;
use super::transport::InterlinkTransport;
use crate::error::Result;

const NOTIFY_CHANNEL: &str = "tempo_interlink";
const FETCH_BATCH: i64 = 256;
const SUBSCRIBER_BUFFER: usize = 1024;

/// Store-and-forward bus over the `interlink_events` table
///
/// Publishing inserts a row and sends a `pg_notify` wake-up. Subscribers
/// follow the table with an id cursor, woken by notifications and by a poll
/// timer so a missed notification only delays delivery. A subscriber starts
/// at the newest row present when it subscribes.
#[derive(Clone)]
pub struct PgInterlink {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgInterlink {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    /// Delete events older than `retention`
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM interlink_events WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_after(pool: &PgPool, cursor: i64) -> Result<Vec<(i64, serde_json::Value)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload FROM interlink_events
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(FETCH_BATCH)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("payload")))
            .collect())
    }

    /// Forward everything after `cursor`; returns the new cursor, or `None`
    /// when the subscriber has gone away
    async fn drain(pool: &PgPool, mut cursor: i64, tx: &mpsc::Sender<InterlinkEvent>) -> Result<Option<i64>> {
        loop {
            let batch = Self::fetch_after(pool, cursor).await?;
            let full = batch.len() as i64 == FETCH_BATCH;

            for (id, payload) in batch {
                cursor = id;
                match InterlinkEvent::from_json(payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return Ok(None);
                        }
                    }
                    Err(e) => warn!(event_id = id, error = %e, "Skipping malformed interlink row"),
                }
            }

            if !full {
                return Ok(Some(cursor));
            }
        }
    }
}

#[async_trait]
impl InterlinkTransport for PgInterlink {
    async fn publish(&self, event: &InterlinkEvent) -> Result<()> {
        let payload = event.to_json()?;

        sqlx::query(
            r#"
            WITH inserted AS (
                INSERT INTO interlink_events (partition, fingerprint, payload)
                VALUES ($1, $2, $3)
                RETURNING id
            )
            SELECT pg_notify($4, id::text) FROM inserted
            "#,
        )
        .bind(event.partition.as_deref())
        .bind(&event.fingerprint)
        .bind(payload)
        .bind(NOTIFY_CHANNEL)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<InterlinkEvent>> {
        let start: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM interlink_events")
            .fetch_one(&self.pool)
            .await?;

        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                Ok(()) => Some(listener),
                Err(e) => {
                    warn!(error = %e, "LISTEN failed; interlink falls back to polling");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Notification listener unavailable; interlink falls back to polling");
                None
            }
        };

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;
        let mut cursor = start.unwrap_or(0);
        info!(cursor, "Interlink subscription started");

        tokio::spawn(async move {
            loop {
                let mut listener_failed = false;
                match listener.as_mut() {
                    Some(active) => {
                        tokio::select! {
                            notification = active.recv() => {
                                if let Err(e) = notification {
                                    warn!(error = %e, "Notification listener failed; falling back to polling");
                                    listener_failed = true;
                                }
                            }
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    None => tokio::time::sleep(poll_interval).await,
                }
                if listener_failed {
                    listener = None;
                }

                if tx.is_closed() {
                    break;
                }
                match Self::drain(&pool, cursor, &tx).await {
                    Ok(Some(next)) => cursor = next,
                    Ok(None) => break,
                    Err(e) => warn!(error = %e, "Interlink fetch failed"),
                }
            }
            debug!("Interlink subscription ended");
        });

        Ok(rx)
    }
}
