//! Stateless pub-sub for engine events
//!
//! A hook receives a copy of each event and nothing else. Hooks are async; each event is handled on its own task so a
//! slow merchant callback never holds up the engine. Publishing waits only for room in the channel.
use std::{future::Future, pin::Pin, sync::Arc};

use log::*;
use tokio::{sync::mpsc, task::JoinSet};

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventHandler<E: Send + Sync + 'static> {
    rx: mpsc::Receiver<E>,
    tx: mpsc::Sender<E>,
    handler: Handler<E>,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(buffer_size: usize, handler: Handler<E>) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self { rx, tx, handler }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer::new(self.tx.clone())
    }

    /// Handles events until the last producer is dropped. Returns once every spawned job has finished.
    pub async fn start_handler(self) {
        let Self { mut rx, tx, handler } = self;
        // Only producers may keep the channel open
        drop(tx);
        debug!("📬️ Event handler started");
        let mut jobs = JoinSet::new();
        while let Some(event) = rx.recv().await {
            let handler = Arc::clone(&handler);
            jobs.spawn(async move { (handler)(event).await });
            // Reap whatever has already finished, so the set does not grow with the event count
            while let Some(done) = jobs.try_join_next() {
                log_job_result(done);
            }
        }
        if !jobs.is_empty() {
            debug!("📬️ All producers are gone. Waiting for {} event jobs", jobs.len());
        }
        while let Some(done) = jobs.join_next().await {
            log_job_result(done);
        }
        debug!("📬️ Event handler has shut down");
    }
}

fn log_job_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        warn!("📬️ An event hook did not complete. {e}");
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self { sender }
    }

    pub async fn publish_event(&self, event: E) {
        if self.sender.send(event).await.is_err() {
            warn!("📬️ Event dropped. Its handler is no longer running.");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn summing_handler(total: Arc<AtomicU64>) -> Handler<u64> {
        Arc::new(move |v: u64| {
            let total = Arc::clone(&total);
            Box::pin(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(v)).await;
                total.fetch_add(v, Ordering::SeqCst);
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }

    #[tokio::test]
    async fn slow_jobs_finish_before_shutdown() {
        let _ = env_logger::try_init();
        let total = Arc::new(AtomicU64::new(0));
        let handler = EventHandler::new(2, summing_handler(Arc::clone(&total)));
        let producers = [handler.subscribe(), handler.subscribe(), handler.subscribe()];
        for (n, producer) in producers.into_iter().enumerate() {
            tokio::spawn(async move {
                for v in [10, 20, 30] {
                    producer.publish_event(v + n as u64).await;
                }
            });
        }
        handler.start_handler().await;
        assert_eq!(total.load(Ordering::SeqCst), 3 * 60 + 3 * 3);
    }

    #[tokio::test]
    async fn publishing_after_shutdown_is_harmless() {
        let total = Arc::new(AtomicU64::new(0));
        let handler = EventHandler::new(1, summing_handler(Arc::clone(&total)));
        let producer = handler.subscribe();
        let task = tokio::spawn(handler.start_handler());
        task.abort();
        let _ = task.await;
        producer.publish_event(5).await;
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }
}
