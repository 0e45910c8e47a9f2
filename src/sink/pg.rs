use super::ResultSink;
use crate::error::SinkError;
use crate::model::{Aggregate, Anomaly, Severity};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;

const AGGREGATE_COLUMNS: &str = r#"
    metric_name,
    bucket_start,
    bucket_width_seconds,
    count,
    sum,
    sum_sq,
    min,
    max,
    mean,
    m2,
    applied,
    version
"#;

/// Postgres-backed sink.
#[derive(Clone, Debug)]
pub struct PgSink {
    pool: PgPool,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Ok(Self::new(build_pool(database_url, max_connections).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trend_aggregates (
                metric_name text not null,
                bucket_start timestamptz not null,
                bucket_width_seconds bigint not null,
                count bigint not null,
                sum double precision not null,
                sum_sq double precision not null,
                min double precision not null,
                max double precision not null,
                mean double precision not null,
                m2 double precision not null,
                applied jsonb not null default '[]'::jsonb,
                version bigint not null,
                updated_at timestamptz not null default now(),
                primary key (metric_name, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trend_anomalies (
                metric_name text not null,
                bucket_start timestamptz not null,
                observed_value double precision not null,
                expected_value double precision not null,
                deviation_score double precision not null,
                severity text not null,
                detected_at timestamptz not null,
                primary key (metric_name, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS trend_anomalies_bucket_idx ON trend_anomalies (bucket_start)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SinkError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, admin_shutdown, cannot_connect_now
                Some("40001") | Some("40P01") | Some("57P01") | Some("57P03") => {
                    SinkError::Unavailable(err.to_string())
                }
                _ => SinkError::Backend(err.to_string()),
            },
            _ => SinkError::Backend(err.to_string()),
        }
    }
}

fn aggregate_from_row(row: &PgRow) -> Result<Aggregate, sqlx::Error> {
    let applied: SqlJson<BTreeSet<String>> = row.try_get("applied")?;
    Ok(Aggregate {
        metric_name: row.try_get("metric_name")?,
        bucket_start: row.try_get("bucket_start")?,
        bucket_width: ChronoDuration::seconds(row.try_get::<i64, _>("bucket_width_seconds")?),
        count: row.try_get::<i64, _>("count")?.max(0) as u64,
        sum: row.try_get("sum")?,
        sum_sq: row.try_get("sum_sq")?,
        min: row.try_get("min")?,
        max: row.try_get("max")?,
        mean: row.try_get("mean")?,
        m2: row.try_get("m2")?,
        applied: applied.0,
        version: row.try_get::<i64, _>("version")?.max(0) as u64,
    })
}

fn anomaly_from_row(row: &PgRow) -> Result<Anomaly, SinkError> {
    let severity: String = row.try_get("severity")?;
    let severity = severity
        .parse::<Severity>()
        .map_err(SinkError::Backend)?;
    Ok(Anomaly {
        metric_name: row.try_get("metric_name")?,
        bucket_start: row.try_get("bucket_start")?,
        observed_value: row.try_get("observed_value")?,
        expected_value: row.try_get("expected_value")?,
        deviation_score: row.try_get("deviation_score")?,
        severity,
        detected_at: row.try_get("detected_at")?,
    })
}

#[async_trait]
impl ResultSink for PgSink {
    async fn get_aggregate(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, SinkError> {
        let row = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM trend_aggregates WHERE metric_name = $1 AND bucket_start = $2"
        ))
        .bind(metric_name)
        .bind(bucket_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(aggregate_from_row).transpose()?)
    }

    async fn put_aggregate(&self, aggregate: &Aggregate) -> Result<(), SinkError> {
        let applied = SqlJson(&aggregate.applied);
        let expected = aggregate.version as i64;
        let result = if aggregate.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO trend_aggregates (
                    metric_name, bucket_start, bucket_width_seconds, count, sum, sum_sq,
                    min, max, mean, m2, applied, version, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1, NOW())
                ON CONFLICT (metric_name, bucket_start) DO NOTHING
                "#,
            )
            .bind(&aggregate.metric_name)
            .bind(aggregate.bucket_start)
            .bind(aggregate.bucket_width.num_seconds())
            .bind(aggregate.count as i64)
            .bind(aggregate.sum)
            .bind(aggregate.sum_sq)
            .bind(aggregate.min)
            .bind(aggregate.max)
            .bind(aggregate.mean)
            .bind(aggregate.m2)
            .bind(applied)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE trend_aggregates
                SET count = $3,
                    sum = $4,
                    sum_sq = $5,
                    min = $6,
                    max = $7,
                    mean = $8,
                    m2 = $9,
                    applied = $10,
                    version = version + 1,
                    updated_at = NOW()
                WHERE metric_name = $1
                  AND bucket_start = $2
                  AND version = $11
                "#,
            )
            .bind(&aggregate.metric_name)
            .bind(aggregate.bucket_start)
            .bind(aggregate.count as i64)
            .bind(aggregate.sum)
            .bind(aggregate.sum_sq)
            .bind(aggregate.min)
            .bind(aggregate.max)
            .bind(aggregate.mean)
            .bind(aggregate.m2)
            .bind(applied)
            .bind(expected)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(SinkError::Conflict {
                metric_name: aggregate.metric_name.clone(),
                bucket_start: aggregate.bucket_start,
                expected: aggregate.version,
            });
        }
        Ok(())
    }

    async fn put_anomaly(&self, anomaly: &Anomaly) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO trend_anomalies (
                metric_name, bucket_start, observed_value, expected_value,
                deviation_score, severity, detected_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (metric_name, bucket_start) DO UPDATE
            SET observed_value = EXCLUDED.observed_value,
                expected_value = EXCLUDED.expected_value,
                deviation_score = EXCLUDED.deviation_score,
                severity = EXCLUDED.severity,
                detected_at = EXCLUDED.detected_at
            "#,
        )
        .bind(&anomaly.metric_name)
        .bind(anomaly.bucket_start)
        .bind(anomaly.observed_value)
        .bind(anomaly.expected_value)
        .bind(anomaly.deviation_score)
        .bind(anomaly.severity.as_str())
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_anomaly(
        &self,
        metric_name: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool, SinkError> {
        let result =
            sqlx::query("DELETE FROM trend_anomalies WHERE metric_name = $1 AND bucket_start = $2")
                .bind(metric_name)
                .bind(bucket_start)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_series(
        &self,
        metric_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Aggregate>, SinkError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM trend_aggregates WHERE metric_name = $1 AND bucket_start >= $2 ORDER BY bucket_start ASC"
        ))
        .bind(metric_name)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| aggregate_from_row(row).map_err(SinkError::from))
            .collect()
    }

    async fn list_anomalies(&self, since: DateTime<Utc>) -> Result<Vec<Anomaly>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT metric_name, bucket_start, observed_value, expected_value,
                   deviation_score, severity, detected_at
            FROM trend_anomalies
            WHERE bucket_start >= $1
            ORDER BY bucket_start ASC, metric_name ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(anomaly_from_row).collect()
    }

    async fn list_metric_names(&self) -> Result<Vec<String>, SinkError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT metric_name FROM trend_aggregates ORDER BY metric_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::env;

    async fn setup_test_sink(database_url: &str, schema: &str) -> Result<PgSink> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        let sink = PgSink::new(pool);
        sink.migrate().await?;
        Ok(sink)
    }

    async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
        Ok(())
    }

    fn integration_database_url() -> Option<String> {
        if env::var("TREND_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return None;
        }
        env::var("TREND_TEST_DATABASE_URL").ok()
    }

    #[tokio::test]
    async fn test_pg_sink_aggregate_compare_and_set() -> Result<()> {
        let Some(database_url) = integration_database_url() else {
            return Ok(());
        };
        let schema = format!("trend_test_cas_{}", std::process::id());
        let sink = setup_test_sink(&database_url, &schema).await?;

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let mut agg = Aggregate::empty("heart_rate", start, ChronoDuration::hours(1));
        agg.count = 2;
        agg.sum = 142.0;
        agg.sum_sq = 70.0 * 70.0 + 72.0 * 72.0;
        agg.min = 70.0;
        agg.max = 72.0;
        agg.mean = 71.0;
        agg.m2 = 2.0;
        agg.applied = ["a".to_string(), "b".to_string()].into_iter().collect();
        sink.put_aggregate(&agg).await?;

        let stored = sink
            .get_aggregate("heart_rate", start)
            .await?
            .expect("aggregate stored");
        assert_eq!(stored.version, 1);
        assert_eq!(stored.count, 2);
        assert_eq!(stored.applied.len(), 2);
        assert_eq!(stored.bucket_width, ChronoDuration::hours(1));

        let conflict = sink.put_aggregate(&agg).await;
        assert!(matches!(conflict, Err(SinkError::Conflict { .. })));

        sink.put_aggregate(&stored).await?;
        let series = sink.list_series("heart_rate", start).await?;
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].version, 2);
        assert_eq!(sink.list_metric_names().await?, vec!["heart_rate".to_string()]);

        drop_schema(&database_url, &schema).await
    }

    #[tokio::test]
    async fn test_pg_sink_anomaly_upsert_and_clear() -> Result<()> {
        let Some(database_url) = integration_database_url() else {
            return Ok(());
        };
        let schema = format!("trend_test_anomaly_{}", std::process::id());
        let sink = setup_test_sink(&database_url, &schema).await?;

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let mut anomaly = Anomaly {
            metric_name: "heart_rate".into(),
            bucket_start: start,
            observed_value: 130.0,
            expected_value: 100.0,
            deviation_score: 6.0,
            severity: Severity::High,
            detected_at: start + ChronoDuration::hours(1),
        };
        sink.put_anomaly(&anomaly).await?;
        anomaly.severity = Severity::Medium;
        anomaly.deviation_score = 3.5;
        sink.put_anomaly(&anomaly).await?;

        let stored = sink.list_anomalies(start).await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].severity, Severity::Medium);

        assert!(sink.clear_anomaly("heart_rate", start).await?);
        assert!(sink.list_anomalies(start).await?.is_empty());

        drop_schema(&database_url, &schema).await
    }
}
