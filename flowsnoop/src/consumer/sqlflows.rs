//! SQL writer consumer: persists each flow's bytes-per-second rate,
//! computed from the interval between the previous and current snapshot.
//!
//! The first `Push` only records the tick — there is no prior interval to
//! compute a rate over — and emits no rows, matching the original writer.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::error::ConsumerError;
use crate::flow::{Consumer, FlowSample, Snapshot};

/// Julian date of the Unix epoch reference `2006-01-02T22:04:05Z`, per
/// <http://www.onlineconversion.com/julian_date.htm>.
const JULIAN_REFERENCE: f64 = 2453738.4195;

fn julian(t: DateTime<Utc>) -> f64 {
    let reference = Utc.timestamp_opt(1_136_239_445, 0).unwrap();
    let delta_secs = (t - reference).num_milliseconds() as f64 / 1000.0;
    JULIAN_REFERENCE + delta_secs / 86_400.0
}

pub struct SqlFlowsConsumer {
    db_path: String,
    pool: Option<SqlitePool>,
    prev_tick: Option<DateTime<Utc>>,
}

impl SqlFlowsConsumer {
    pub fn new(db_path: &str) -> Self {
        Self {
            db_path: db_path.to_string(),
            pool: None,
            prev_tick: None,
        }
    }
}

#[async_trait]
impl Consumer for SqlFlowsConsumer {
    async fn init(&mut self) -> Result<(), ConsumerError> {
        let options = SqliteConnectOptions::from_str(&self.db_path)
            .map_err(|e| ConsumerError::Init(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ConsumerError::Init(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flows (\
             jd FLOAT, \
             proto INTEGER, \
             src_ip TEXT, \
             src_port INTEGER, \
             dst_ip TEXT, \
             dst_port INTEGER, \
             bytes_sec FLOAT)",
        )
        .execute(&pool)
        .await
        .map_err(|e| ConsumerError::Init(e.to_string()))?;

        info!(path = %self.db_path, "sql flows consumer initialized");
        self.pool = Some(pool);
        Ok(())
    }

    async fn push(&mut self, snapshot: &Snapshot) -> Result<(), ConsumerError> {
        let Some(prev_tick) = self.prev_tick else {
            self.prev_tick = Some(snapshot.timestamp);
            return Ok(());
        };

        let delta = (snapshot.timestamp - prev_tick).num_milliseconds() as f64 / 1000.0;
        self.prev_tick = Some(snapshot.timestamp);
        if delta <= 0.0 {
            return Ok(());
        }
        let jd = julian(snapshot.timestamp);

        let pool = self.pool.as_ref().expect("push called before init");
        let mut tx = pool.begin().await?;
        for sample in &snapshot.samples {
            let (proto, src_ip, src_port, dst_ip, dst_port, tot) = match sample {
                FlowSample::V4(s, tot) => (
                    s.proto as i64,
                    s.src_ip.to_string(),
                    s.src_port as i64,
                    s.dst_ip.to_string(),
                    s.dst_port as i64,
                    *tot,
                ),
                FlowSample::V6(s, tot) => (
                    s.proto as i64 + 256,
                    s.src_ip.to_string(),
                    s.src_port as i64,
                    s.dst_ip.to_string(),
                    s.dst_port as i64,
                    *tot,
                ),
            };
            let bytes_sec = tot as f64 / delta;
            sqlx::query(
                "INSERT INTO flows (jd, proto, src_ip, src_port, dst_ip, dst_port, bytes_sec) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(jd)
            .bind(proto)
            .bind(src_ip)
            .bind(src_port)
            .bind(dst_ip)
            .bind(dst_port)
            .bind(bytes_sec)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn finalize(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Sample4, SampleSource};
    use chrono::Duration;

    #[test]
    fn julian_reference_point_matches_constant() {
        let reference = Utc.timestamp_opt(1_136_239_445, 0).unwrap();
        assert!((julian(reference) - JULIAN_REFERENCE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_push_records_tick_and_writes_no_rows() {
        let mut consumer = SqlFlowsConsumer::new("sqlite::memory:");
        consumer.init().await.unwrap();
        let snapshot = Snapshot::new(Utc::now(), Vec::new(), SampleSource::List);
        consumer.push(&snapshot).await.unwrap();

        let pool = consumer.pool.as_ref().unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn second_push_computes_bytes_per_second() {
        let mut consumer = SqlFlowsConsumer::new("sqlite::memory:");
        consumer.init().await.unwrap();

        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        let sample = FlowSample::V4(
            Sample4 {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "10.0.0.2".parse().unwrap(),
                src_port: 1234,
                dst_port: 80,
                proto: 6,
            },
            8192,
        );

        consumer
            .push(&Snapshot::new(t0, vec![sample], SampleSource::List))
            .await
            .unwrap();
        consumer
            .push(&Snapshot::new(t1, vec![sample], SampleSource::List))
            .await
            .unwrap();

        let pool = consumer.pool.as_ref().unwrap();
        let bytes_sec: f64 = sqlx::query_scalar("SELECT bytes_sec FROM flows LIMIT 1")
            .fetch_one(pool)
            .await
            .unwrap();
        assert!((bytes_sec - 1638.4).abs() < 1e-6);
    }
}
