use crate::{Result, carrier::Argument, error::TracehookError};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};

/// A message handler invoked once per delivery with the delivery's declared
/// arguments.
pub type MessageHandler = Arc<
    dyn Fn(Vec<Argument>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// One inbound message as handed to a consumer.
pub type Delivery = Vec<Argument>;

#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ConsumerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Dispatches deliveries from a channel to a handler, one at a time.
pub struct Consumer {
    name: String,
    deliveries: mpsc::Receiver<Delivery>,
    handler: MessageHandler,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(name: impl Into<String>, deliveries: mpsc::Receiver<Delivery>, handler: MessageHandler) -> Self {
        Self {
            name: name.into(),
            deliveries,
            handler,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Consume until shutdown is signalled or every sender is gone.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("Consumer started: {}", self.name);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Consumer shutting down: {}", self.name);
                    break;
                }
                delivery = self.deliveries.recv() => {
                    match delivery {
                        Some(args) => self.dispatch(args).await,
                        None => {
                            info!("Delivery channel closed for consumer: {}", self.name);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(&self, args: Delivery) {
        debug!("Dispatching delivery to consumer {}", self.name);

        match (self.handler)(args).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Redelivery and dead-lettering belong to the broker client.
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("Consumer {} failed to handle delivery: {}", self.name, e);
            }
        }
    }
}

/// Runs a set of consumers concurrently, one task each.
///
/// [`start`](Self::start) spawns the consumers and returns immediately.
/// Wait for them with [`join`](Self::join), or stop them with
/// [`shutdown`](Self::shutdown).
pub struct ConsumerPool {
    consumers: Vec<Consumer>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
            shutdown_tx: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn add_consumer(&mut self, consumer: Consumer) {
        self.consumers.push(consumer);
    }

    /// Number of consumers waiting to be started.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Number of started consumer tasks that have not been joined yet.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Spawn every added consumer on the current tokio runtime.
    pub fn start(&mut self) {
        info!("Starting consumer pool with {} consumers", self.consumers.len());

        for consumer in self.consumers.drain(..) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);

            self.handles.push(tokio::spawn(async move {
                let name = consumer.name().to_string();
                if let Err(e) = consumer.run(shutdown_rx).await {
                    error!("Consumer {} error: {}", name, e);
                }
            }));
        }
    }

    /// Wait for every started consumer to stop.
    pub async fn join(&mut self) -> Result<()> {
        let mut first_failure = None;

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Consumer task failed: {}", e);
                first_failure.get_or_insert(e);
            }
        }
        self.shutdown_tx.clear();

        match first_failure {
            Some(e) => Err(TracehookError::Consumer {
                message: format!("Consumer task failed: {}", e),
            }),
            None => Ok(()),
        }
    }

    /// Signal every started consumer to stop, then wait for them.
    ///
    /// A delivery already being handled runs to completion first.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down consumer pool");

        for tx in &self.shutdown_tx {
            if tx.send(()).await.is_err() {
                debug!("Consumer already stopped before shutdown signal");
            }
        }

        self.join().await
    }
}

impl Default for ConsumerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::ConsumerRecord;
    use std::time::Duration;

    #[test]
    fn test_message_handler_type() {
        let _handler: MessageHandler = Arc::new(|_args| Box::pin(async { Ok(()) }));
    }

    #[tokio::test]
    async fn test_consumer_counts_outcomes() {
        let (tx, rx) = mpsc::channel(8);
        let handler: MessageHandler = Arc::new(|args: Vec<Argument>| {
            Box::pin(async move {
                match args.first() {
                    Some(Argument::Record(record)) if record.offset % 2 == 1 => Err(
                        TracehookError::Processing(format!("odd offset {}", record.offset)),
                    ),
                    _ => Ok(()),
                }
            })
        });

        let consumer = Consumer::new("payment.approved-0", rx, handler);
        let stats = consumer.stats();
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        for offset in 0..4 {
            tx.send(vec![ConsumerRecord::new("payment.approved", 0, offset).into()])
                .await
                .unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), consumer.run(shutdown_rx))
            .await
            .expect("consumer should stop when the channel closes")
            .unwrap();

        assert_eq!(stats.processed(), 2);
        assert_eq!(stats.failed(), 2);
    }

    #[tokio::test]
    async fn test_consumer_stops_on_shutdown() {
        let (_tx, rx) = mpsc::channel::<Delivery>(1);
        let handler: MessageHandler = Arc::new(|_args| Box::pin(async { Ok(()) }));
        let consumer = Consumer::new("idle", rx, handler);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(consumer.run(shutdown_rx));
        shutdown_tx.send(()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("consumer should observe shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_pool_accepts_consumers() {
        let mut pool = ConsumerPool::default();
        assert!(pool.is_empty());

        let (_tx, rx) = mpsc::channel::<Delivery>(1);
        let handler: MessageHandler = Arc::new(|_args| Box::pin(async { Ok(()) }));
        pool.add_consumer(Consumer::new("ticket", rx, handler));

        assert_eq!(pool.len(), 1);
    }

    fn counting_handler(seen: Arc<AtomicU64>) -> MessageHandler {
        Arc::new(move |_args| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_pool_shutdown_with_open_channels() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut pool = ConsumerPool::new();
        let mut senders = Vec::new();

        for partition in 0..2 {
            let (tx, rx) = mpsc::channel(8);
            pool.add_consumer(Consumer::new(
                format!("reservation.created-{}", partition),
                rx,
                counting_handler(Arc::clone(&seen)),
            ));
            senders.push(tx);
        }

        pool.start();
        assert!(pool.is_empty());
        assert_eq!(pool.running(), 2);

        for (offset, tx) in senders.iter().enumerate() {
            tx.send(vec![ConsumerRecord::new("reservation.created", 0, offset as i64).into()])
                .await
                .unwrap();
        }
        while seen.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown should stop consumers whose senders are still alive")
            .unwrap();

        assert_eq!(pool.running(), 0);
        assert!(senders.iter().all(|tx| tx.is_closed()));
    }

    #[tokio::test]
    async fn test_pool_join_returns_when_channels_close() {
        let seen = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(8);
        let mut pool = ConsumerPool::new();
        pool.add_consumer(Consumer::new("ticket.issued-0", rx, counting_handler(Arc::clone(&seen))));

        pool.start();
        for offset in 0..3 {
            tx.send(vec![ConsumerRecord::new("ticket.issued", 0, offset).into()])
                .await
                .unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool should stop once its delivery channel closes")
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let mut pool = ConsumerPool::new();
        assert!(pool.shutdown().await.is_ok());
    }

    #[test]
    fn test_error_handling() {
        let error = TracehookError::Consumer {
            message: "Test error".to_string(),
        };

        assert_eq!(error.to_string(), "Consumer error: Test error");
    }
}
