use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{topic_for_aggregate, EventEnvelope};

use crate::error::AppError;
use crate::models::{NewDeadLetter, NewOutboxEvent, OutboxEvent};
use crate::schema::{outbox_dead_letters, outbox_events};

type DbPool = Pool<AsyncPgConnection>;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PUBLISHED: &str = "published";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub aggregate_type: &'static str,
    pub aggregate_id: Uuid,
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

/// Appends the event inside the caller's open transaction. Commit persists
/// the business mutation and the event together or not at all; no network
/// call happens here.
pub async fn append(conn: &mut AsyncPgConnection, event: DomainEvent) -> Result<(), AppError> {
    let record = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_type: event.aggregate_type.to_string(),
        aggregate_id: event.aggregate_id,
        event_type: event.event_type.to_string(),
        payload: event.payload,
        status: STATUS_PENDING.to_string(),
        retry_count: 0,
    };
    diesel::insert_into(outbox_events::table)
        .values(&record)
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    DeadLetter,
}

/// One publish failure increments the attempt count; the record stays
/// pending until the count exceeds `max_retries`, then it is dead-lettered.
pub fn on_publish_failure(retry_count: i32, max_retries: i32) -> FailureAction {
    if retry_count + 1 > max_retries {
        FailureAction::DeadLetter
    } else {
        FailureAction::Retry
    }
}

pub struct OutboxRelay {
    pool: DbPool,
    producer: FutureProducer,
    interval: Duration,
    batch_size: i64,
    max_retries: i32,
}

impl OutboxRelay {
    pub fn new(
        pool: DbPool,
        producer: FutureProducer,
        interval: Duration,
        batch_size: i64,
        max_retries: i32,
    ) -> Self {
        Self {
            pool,
            producer,
            interval,
            batch_size,
            max_retries,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.drain().await {
                Ok(published) if published > 0 => {
                    info!("outbox drain published {} events", published);
                }
                Ok(_) => {}
                Err(e) => error!("outbox drain failed: {:#}", e),
            }
        }
    }

    /// Publishes up to `batch_size` pending records, oldest first so events
    /// for the same aggregate leave in commit order. At-least-once: a crash
    /// between bus ack and the published mark redelivers on the next cycle.
    pub async fn drain(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        let pending: Vec<OutboxEvent> = outbox_events::table
            .filter(outbox_events::status.eq(STATUS_PENDING))
            .order(outbox_events::created_at.asc())
            .limit(self.batch_size)
            .load(&mut conn)
            .await?;

        let mut published = 0;
        for event in pending {
            match self.publish(&event).await {
                Ok(()) => {
                    diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                        .set((
                            outbox_events::status.eq(STATUS_PUBLISHED),
                            outbox_events::processed_at.eq(Utc::now()),
                        ))
                        .execute(&mut conn)
                        .await?;
                    published += 1;
                }
                Err(e) => {
                    self.record_failure(&mut conn, &event, &e).await?;
                }
            }
        }

        Ok(published)
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let envelope = EventEnvelope {
            event_id: event.id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            payload: event.payload.clone(),
            occurred_at: event.created_at,
        };
        let topic = topic_for_aggregate(&event.aggregate_type);
        let json = serde_json::to_string(&envelope)?;
        // Key by aggregate id: one partition per aggregate keeps event order.
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish event: {}", e))?;

        Ok(())
    }

    async fn record_failure(
        &self,
        conn: &mut AsyncPgConnection,
        event: &OutboxEvent,
        cause: &anyhow::Error,
    ) -> Result<()> {
        let attempts = event.retry_count + 1;
        match on_publish_failure(event.retry_count, self.max_retries) {
            FailureAction::Retry => {
                warn!(
                    "publish attempt {} failed for event {}: {:#}",
                    attempts, event.id, cause
                );
                diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                    .set(outbox_events::retry_count.eq(attempts))
                    .execute(conn)
                    .await?;
            }
            FailureAction::DeadLetter => {
                error!(
                    "event {} exhausted {} attempts, dead-lettering: {:#}",
                    event.id, attempts, cause
                );
                let dead_letter = NewDeadLetter {
                    id: Uuid::new_v4(),
                    event_id: event.id,
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id,
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                    attempts,
                    last_error: format!("{:#}", cause),
                };
                let event_id = event.id;
                conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    Box::pin(async move {
                        diesel::insert_into(outbox_dead_letters::table)
                            .values(&dead_letter)
                            .execute(conn)
                            .await?;
                        diesel::update(
                            outbox_events::table.filter(outbox_events::id.eq(event_id)),
                        )
                        .set((
                            outbox_events::status.eq(STATUS_FAILED),
                            outbox_events::retry_count.eq(attempts),
                        ))
                        .execute(conn)
                        .await?;
                        Ok(())
                    })
                })
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_retry_until_the_limit() {
        assert_eq!(on_publish_failure(0, 5), FailureAction::Retry);
        assert_eq!(on_publish_failure(3, 5), FailureAction::Retry);
        assert_eq!(on_publish_failure(4, 5), FailureAction::Retry);
    }

    #[test]
    fn exceeding_the_limit_dead_letters() {
        assert_eq!(on_publish_failure(5, 5), FailureAction::DeadLetter);
        assert_eq!(on_publish_failure(9, 5), FailureAction::DeadLetter);
    }

    #[test]
    fn zero_max_retries_dead_letters_immediately() {
        assert_eq!(on_publish_failure(0, 0), FailureAction::DeadLetter);
    }
}
