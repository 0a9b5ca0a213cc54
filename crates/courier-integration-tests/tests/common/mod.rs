//! Common test utilities for Queue-Courier integration tests
//!
//! This module provides:
//! - Tracing initialisation shared by every test binary
//! - A scriptable message handler recording what it saw
//! - Helpers for destinations, transports and polling

use async_trait::async_trait;
use courier_runtime::{Destination, InMemoryBroker, TransportMessage};
use courier_transport::{
    JsonMessageSerializer, ProcessingContext, Transport, TransportConfig, TransportObserver,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::time::{sleep, Duration, Instant};

pub const INPUT: &str = "ORDERS@QM1/LOCALHOST/1414/SVRCONN";
pub const ERRORS: &str = "ORDERS.ERRORS@QM1/LOCALHOST/1414/SVRCONN";
pub const AUDIT: &str = "ORDERS.AUDIT@QM1/LOCALHOST/1414/SVRCONN";

static TRACING: Once = Once::new();

/// Route test logs through `tracing-subscriber`, honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn destination(value: &str) -> Destination {
    value.parse().expect("test destination must parse")
}

// ============================================================================
// Scriptable handler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Reaction {
    Succeed,
    Fail,
    Abort,
}

/// Handler that reacts to each message as scripted and records what it saw
#[derive(Default)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Reaction>>,
    fallback: Option<Reaction>,
    received: Mutex<Vec<TransportMessage>>,
    failed: AtomicU32,
}

#[allow(dead_code)]
impl ScriptedHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// React with `reactions` in order, then succeed
    pub fn scripted(reactions: impl IntoIterator<Item = Reaction>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(reactions.into_iter().collect()),
            ..Self::default()
        })
    }

    /// React with `reaction` to every message
    pub fn always(reaction: Reaction) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(reaction),
            ..Self::default()
        })
    }

    pub fn received(&self) -> Vec<TransportMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn failed_count(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportObserver for ScriptedHandler {
    async fn message_received(
        &self,
        message: &TransportMessage,
        context: &ProcessingContext,
    ) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(message.clone());

        let reaction = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or(self.fallback)
            .unwrap_or(Reaction::Succeed);
        match reaction {
            Reaction::Succeed => Ok(()),
            Reaction::Fail => anyhow::bail!("order could not be handled"),
            Reaction::Abort => {
                context.abort_handling_current_message();
                Ok(())
            }
        }
    }

    async fn failed_processing(&self) -> anyhow::Result<()> {
        self.failed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Transport helpers
// ============================================================================

/// Transactional configuration with short receive waits and no workers
#[allow(dead_code)]
pub fn transport_config() -> TransportConfig {
    let mut config = TransportConfig::new(INPUT, ERRORS);
    config.is_transactional = true;
    config.number_of_worker_threads = 0;
    config.max_retries = 2;
    config.milliseconds_to_wait_for_message = 25;
    config
}

#[allow(dead_code)]
pub fn create_transport(
    broker: &InMemoryBroker,
    config: TransportConfig,
    handler: &Arc<ScriptedHandler>,
) -> Transport {
    Transport::new(
        config,
        Arc::new(broker.clone()),
        Some(Arc::new(JsonMessageSerializer)),
        Arc::clone(handler) as Arc<dyn TransportObserver>,
    )
}

/// Poll `condition` until it holds or `timeout` passes; returns whether it held
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
