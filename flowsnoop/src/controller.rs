//! Wires a selected producer to a selected consumer and drives the flush
//! rendezvous between them.
//!
//! The flush rendezvous is a synchronous handoff: the controller sends one
//! reply channel per tick and waits for exactly one status on it before
//! scheduling the next, so a snapshot is always acknowledged by the
//! consumer before the next drain begins.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ProducerError;
use crate::flow::{Consumer, Producer};

/// One flush request: the producer drains its table, pushes exactly one
/// snapshot to the consumer, then answers on `reply`.
pub struct FlushRequest {
    pub reply: oneshot::Sender<Result<(), ProducerError>>,
}

pub struct Controller {
    producer: Box<dyn Producer>,
    consumer: Arc<Mutex<Box<dyn Consumer>>>,
    every: std::time::Duration,
}

impl Controller {
    pub fn new(
        producer: Box<dyn Producer>,
        consumer: Box<dyn Consumer>,
        every: std::time::Duration,
    ) -> Self {
        Self {
            producer,
            consumer: Arc::new(Mutex::new(consumer)),
            every,
        }
    }

    /// Initializes consumer then producer, launches the producer's capture
    /// task, and enters the tick loop until an interrupt signal or a flush
    /// error. Always finalizes both sides on the way out, logging (but not
    /// propagating) finalize failures.
    pub async fn run(mut self) -> anyhow::Result<()> {
        {
            let mut consumer = self.consumer.lock().await;
            consumer
                .init()
                .await
                .map_err(|e| anyhow::anyhow!("consumer init: {e}"))?;
        }
        self.producer
            .init()
            .await
            .map_err(|e| anyhow::anyhow!("producer init: {e}"))?;

        let cancel = CancellationToken::new();
        let (flush_tx, flush_rx) = mpsc::channel(1);
        self.producer
            .run(Arc::clone(&self.consumer), cancel.clone(), flush_rx)
            .await;

        let mut interval = tokio::time::interval(self.every);
        interval.tick().await; // skip the immediate first tick

        let outcome = loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if flush_tx.send(FlushRequest { reply: reply_tx }).await.is_err() {
                        warn!("producer capture task exited before flush request could be sent");
                        break Ok(());
                    }
                    match reply_rx.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "flush failed, shutting down");
                            break Err(anyhow::anyhow!("flush failed: {e}"));
                        }
                        Err(_) => {
                            warn!("producer dropped the flush reply channel");
                            break Ok(());
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    break Ok(());
                }
            }
        };

        cancel.cancel();
        self.producer.finalize().await;
        self.consumer.lock().await.finalize().await;

        outcome
    }
}
