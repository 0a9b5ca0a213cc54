//! Tests for the producer and consumer providers.

use super::*;
use crate::providers::InMemoryBroker;
use crate::transaction::TransactionOptions;
use bytes::Bytes;

fn destination(name: &str) -> Destination {
    format!("{}@QM/LOCALHOST/1414/CHAN", name).parse().unwrap()
}

fn message(body: &'static str) -> crate::message::QueueMessage {
    crate::message::QueueMessage::new(Bytes::from_static(body.as_bytes()))
}

fn settings(size: usize) -> PoolSettings {
    PoolSettings {
        size,
        ..PoolSettings::default()
    }
}

fn producers(broker: &InMemoryBroker, transactional: bool) -> ProducerProvider {
    ProducerProvider::new(Arc::new(broker.clone()), transactional, settings(4))
}

fn consumers(broker: &InMemoryBroker, transactional: bool) -> ConsumerProvider {
    ConsumerProvider::new(Arc::new(broker.clone()), transactional, settings(4))
}

/// Connector that takes a while to open each session
struct SlowConnector {
    broker: InMemoryBroker,
    delay: Duration,
}

#[async_trait::async_trait]
impl QueueConnector for SlowConnector {
    async fn connect(
        &self,
        destination: &Destination,
        mode: SessionMode,
    ) -> Result<Box<dyn crate::client::QueueSession>, QueueError> {
        tokio::time::sleep(self.delay).await;
        self.broker.connect(destination, mode).await
    }

    async fn queue_depth(&self, destination: &Destination) -> Result<usize, QueueError> {
        self.broker.queue_depth(destination).await
    }
}

// ============================================================================
// Settings
// ============================================================================

mod pool_settings {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.size, 10);
        assert_eq!(settings.time_to_live(), Duration::from_secs(60));
        assert_eq!(settings.cleanup_interval(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_size_is_invalid() {
        assert!(settings(0).validate().is_err());
    }
}

// ============================================================================
// Producer provider
// ============================================================================

mod producer_provider {
    use super::*;

    /// Verify that one pool is created per distinct destination.
    #[tokio::test]
    async fn test_one_pool_per_destination() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, false);

        drop(provider.get_producer(&destination("A"), None).await.unwrap());
        drop(provider.get_producer(&destination("A"), None).await.unwrap());
        drop(provider.get_producer(&destination("B"), None).await.unwrap());

        assert!(provider.pool(&destination("A")).is_some());
        assert!(provider.pool(&destination("B")).is_some());
        assert!(provider.pool(&destination("C")).is_none());
        assert_eq!(broker.connections_opened(), 2);
    }

    /// Verify that a non-transactional producer's send is visible at once.
    #[tokio::test]
    async fn test_plain_producer_auto_commits() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, false);

        let producer = provider.get_producer(&destination("A"), None).await.unwrap();
        producer.send(message("one")).await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 1);
    }

    /// Verify that without a transaction every send commits on its own.
    #[tokio::test]
    async fn test_per_call_producer_commits_each_send() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);

        let producer = provider.get_producer(&destination("A"), None).await.unwrap();
        producer.send(message("one")).await.unwrap();
        assert_eq!(broker.depth(&destination("A")), 1);
        producer.send(message("two")).await.unwrap();
        assert_eq!(broker.depth(&destination("A")), 2);
        assert_eq!(provider.scoped_producer_count(), 0);
    }

    /// Verify that a failed send discards the session and releases its capacity.
    #[tokio::test]
    async fn test_failed_send_faults_session() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);

        {
            let producer = provider.get_producer(&destination("A"), None).await.unwrap();
            broker.fail_next_sends(1);
            assert!(producer.send(message("one")).await.is_err());
        }

        let pool = provider.pool(&destination("A")).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_permits(), 4);
        assert_eq!(broker.open_connections(), 0);
    }

    /// Verify that sends in one transaction share a producer until it completes.
    #[tokio::test]
    async fn test_same_transaction_reuses_producer() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);
        let transaction = Transaction::begin(TransactionOptions::default());

        let first = provider
            .get_producer(&destination("A"), Some(&transaction))
            .await
            .unwrap();
        first.send(message("one")).await.unwrap();
        drop(first);
        let second = provider
            .get_producer(&destination("A"), Some(&transaction))
            .await
            .unwrap();
        second.send(message("two")).await.unwrap();

        assert_eq!(provider.scoped_producer_count(), 1);
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(transaction.participant_count(), 1);
        assert_eq!(broker.depth(&destination("A")), 0);

        transaction.commit().await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 2);
        assert_eq!(provider.scoped_producer_count(), 0);
        let pool = provider.pool(&destination("A")).unwrap();
        assert_eq!(pool.available_permits(), 4);
        assert_eq!(pool.idle_count(), 1);
    }

    /// Verify that two transactions never share a producer.
    #[tokio::test]
    async fn test_different_transactions_use_different_producers() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);
        let first = Transaction::begin(TransactionOptions::default());
        let second = Transaction::begin(TransactionOptions::default());

        let a = provider
            .get_producer(&destination("A"), Some(&first))
            .await
            .unwrap();
        let b = provider
            .get_producer(&destination("A"), Some(&second))
            .await
            .unwrap();
        a.send(message("first")).await.unwrap();
        b.send(message("second")).await.unwrap();

        assert_eq!(provider.scoped_producer_count(), 2);
        assert_eq!(broker.connections_opened(), 2);

        first.commit().await.unwrap();
        second.rollback().await.unwrap();

        let stored = broker.messages(&destination("A"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, Bytes::from_static(b"first"));
        assert_eq!(provider.scoped_producer_count(), 0);
    }

    /// Verify that one transaction gets separate producers per destination.
    #[tokio::test]
    async fn test_same_transaction_different_destinations() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);
        let transaction = Transaction::begin(TransactionOptions::default());

        for name in ["A", "B"] {
            provider
                .get_producer(&destination(name), Some(&transaction))
                .await
                .unwrap()
                .send(message(if name == "A" { "a" } else { "b" }))
                .await
                .unwrap();
        }

        assert_eq!(provider.scoped_producer_count(), 2);
        transaction.commit().await.unwrap();
        assert_eq!(broker.depth(&destination("A")), 1);
        assert_eq!(broker.depth(&destination("B")), 1);
    }

    /// Verify that concurrent first sends of one transaction end with one producer.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_scoped_producer() {
        let broker = InMemoryBroker::new();
        let provider = Arc::new(producers(&broker, true));
        let transaction = Transaction::begin(TransactionOptions::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            let transaction = transaction.clone();
            handles.push(tokio::spawn(async move {
                let producer = provider
                    .get_producer(&destination("A"), Some(&transaction))
                    .await
                    .unwrap();
                producer.send(message("x")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.scoped_producer_count(), 1);
        assert_eq!(transaction.participant_count(), 1);

        transaction.commit().await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 8);
        let pool = provider.pool(&destination("A")).unwrap();
        assert_eq!(pool.available_permits(), 4);
    }

    /// Verify that concurrent first sends share one session even when the pool has one.
    #[tokio::test]
    async fn test_concurrent_first_use_on_single_session_pool() {
        let broker = InMemoryBroker::new();
        let connector = SlowConnector {
            broker: broker.clone(),
            delay: Duration::from_millis(50),
        };
        let provider = ProducerProvider::new(Arc::new(connector), true, settings(1));
        let transaction = Transaction::begin(TransactionOptions::default());

        let (provider, transaction) = (&provider, &transaction);
        let send = || async move {
            let producer = provider
                .get_producer(&destination("A"), Some(transaction))
                .await?;
            producer.send(message("x")).await
        };
        let sent = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(send(), send())
        })
        .await
        .expect("sends of one transaction must not wait on each other");

        assert!(sent.0.is_ok());
        assert!(sent.1.is_ok());
        assert_eq!(provider.scoped_producer_count(), 1);
        assert_eq!(broker.connections_opened(), 1);

        transaction.commit().await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 2);
        assert_eq!(provider.pool(&destination("A")).unwrap().available_permits(), 1);
    }

    /// Verify that a failed first acquire leaves no slot behind for the transaction.
    #[tokio::test]
    async fn test_failed_first_use_clears_slot() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, true);
        let transaction = Transaction::begin(TransactionOptions::default());

        broker.fail_next_connects(1);
        let first = provider
            .get_producer(&destination("A"), Some(&transaction))
            .await;
        assert!(first.is_err());
        assert_eq!(provider.scoped_producer_count(), 0);

        provider
            .get_producer(&destination("A"), Some(&transaction))
            .await
            .unwrap()
            .send(message("one"))
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 1);
    }

    /// Verify that a non-transactional provider ignores the transaction.
    #[tokio::test]
    async fn test_non_transactional_provider_ignores_transaction() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, false);
        let transaction = Transaction::begin(TransactionOptions::default());

        provider
            .get_producer(&destination("A"), Some(&transaction))
            .await
            .unwrap()
            .send(message("one"))
            .await
            .unwrap();
        transaction.rollback().await.unwrap();

        assert_eq!(broker.depth(&destination("A")), 1);
        assert_eq!(provider.scoped_producer_count(), 0);
    }

    /// Verify that disposing closes idle sessions and refuses further use.
    #[tokio::test]
    async fn test_dispose_closes_pools() {
        let broker = InMemoryBroker::new();
        let provider = producers(&broker, false);
        drop(provider.get_producer(&destination("A"), None).await.unwrap());
        let pool = provider.pool(&destination("A")).unwrap();

        provider.dispose();

        assert!(pool.is_disposed());
        assert_eq!(broker.open_connections(), 0);
        assert!(provider.pool(&destination("A")).is_none());
    }
}

// ============================================================================
// Consumer provider
// ============================================================================

mod consumer_provider {
    use super::*;

    async fn fill(broker: &InMemoryBroker, name: &str, count: usize) {
        let provider = producers(broker, false);
        let producer = provider.get_producer(&destination(name), None).await.unwrap();
        for _ in 0..count {
            producer.send(message("m")).await.unwrap();
        }
    }

    /// Verify that a receive in a rolled-back transaction leaves the message on the queue.
    #[tokio::test]
    async fn test_transacted_consumer_rollback_keeps_message() {
        let broker = InMemoryBroker::new();
        fill(&broker, "IN", 1).await;
        let provider = consumers(&broker, true);
        let transaction = Transaction::begin(TransactionOptions::default());

        let consumer = provider
            .get_consumer(&destination("IN"), Some(&transaction))
            .await
            .unwrap();
        assert!(consumer.receive_no_wait().await.unwrap().is_some());
        drop(consumer);
        assert_eq!(broker.depth(&destination("IN")), 0);

        transaction.rollback().await.unwrap();

        assert_eq!(broker.depth(&destination("IN")), 1);
        let pool = provider.pool(&destination("IN")).unwrap();
        assert_eq!(pool.available_permits(), 4);
    }

    /// Verify that a committed transaction consumes the message.
    #[tokio::test]
    async fn test_transacted_consumer_commit_consumes_message() {
        let broker = InMemoryBroker::new();
        fill(&broker, "IN", 1).await;
        let provider = consumers(&broker, true);
        let transaction = Transaction::begin(TransactionOptions::default());

        let consumer = provider
            .get_consumer(&destination("IN"), Some(&transaction))
            .await
            .unwrap();
        consumer.receive_no_wait().await.unwrap();
        transaction.commit().await.unwrap();

        assert!(matches!(
            consumer.receive_no_wait().await,
            Err(QueueError::Transaction(_))
        ));
        assert_eq!(broker.depth(&destination("IN")), 0);
    }

    /// Verify that without a transaction a transactional consumer acknowledges each receive.
    #[tokio::test]
    async fn test_per_call_consumer_acknowledges() {
        let broker = InMemoryBroker::new();
        fill(&broker, "IN", 1).await;
        let provider = consumers(&broker, true);

        {
            let consumer = provider.get_consumer(&destination("IN"), None).await.unwrap();
            assert!(consumer.receive_no_wait().await.unwrap().is_some());
        }

        assert_eq!(broker.depth(&destination("IN")), 0);
        assert_eq!(provider.pool(&destination("IN")).unwrap().idle_count(), 1);
    }

    /// Verify that a plain consumer returns its session to the pool when dropped.
    #[tokio::test]
    async fn test_plain_consumer_is_reused() {
        let broker = InMemoryBroker::new();
        fill(&broker, "IN", 2).await;
        let provider = consumers(&broker, false);

        for _ in 0..2 {
            let consumer = provider.get_consumer(&destination("IN"), None).await.unwrap();
            assert!(consumer.receive_no_wait().await.unwrap().is_some());
        }

        assert_eq!(broker.depth(&destination("IN")), 0);
        // One for filling, one shared by both receives.
        assert_eq!(broker.connections_opened(), 2);
    }
}
