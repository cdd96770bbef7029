//! Device channel (C6): publishes dispatch commands, queues while the
//! transport is disconnected, reconnects with exponential backoff.
//!
//! The message-broker client and TLS themselves are explicitly out of scope
//! (spec §1) — this module owns only the queueing/backoff/topic contract and
//! depends on a pluggable `DeviceTransport` trait, the same
//! trait-object-backend shape the teacher uses for `RouteProvider` in the
//! old `routing.rs`. Backoff math follows
//! `seanchatmangpt-knhk/.../resilience.rs`'s `BackoffStrategy::Exponential`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

const QUEUE_CAPACITY: usize = 100;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Pluggable publish/connect backend. A real implementation would wrap an
/// MQTT/broker client; `dispatch_server` supplies one, `dispatch_core`'s
/// tests use an in-memory fake.
#[async_trait::async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), String>;
    async fn connect(&self) -> Result<(), String>;
}

struct QueuedCommand {
    topic: String,
    payload: Value,
}

/// Device channel: at-least-once publish with a bounded drop-oldest queue
/// while disconnected (spec §4.6).
pub struct DeviceChannel {
    transport: Box<dyn DeviceTransport>,
    queue: Mutex<VecDeque<QueuedCommand>>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl DeviceChannel {
    pub fn new(transport: Box<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            queue: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Publish a dispatch command to `device/{external_device_id}/dispatch`
    /// (spec §4.6). Never returns an error to the caller: the reservation is
    /// valid regardless of whether the command was sent or queued.
    pub async fn dispatch_command(&self, external_device_id: &str, fault_id: String, fault_details: Value) {
        let topic = format!("device/{external_device_id}/dispatch");
        let payload = json!({ "faultId": fault_id, "faultDetails": fault_details });
        self.publish_or_queue(topic, payload).await;
    }

    async fn publish_or_queue(&self, topic: String, payload: Value) {
        if self.is_connected() {
            match self.transport.publish(&topic, &payload).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(%err, topic, "device publish failed, marking disconnected");
                    self.connected.store(false, Ordering::Release);
                }
            }
        }
        self.enqueue(topic, payload);
    }

    fn enqueue(&self, topic: String, payload: Value) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            warn!("device command queue full, dropping oldest");
        }
        queue.push_back(QueuedCommand { topic, payload });
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Drain the queue in FIFO order after reconnecting. Stops and requeues
    /// the remainder (at the front) on the first failure, since the
    /// transport is presumed disconnected again.
    pub async fn drain_queue(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap();
                queue.pop_front()
            };
            let Some(cmd) = next else { break };
            match self.transport.publish(&cmd.topic, &cmd.payload).await {
                Ok(()) => continue,
                Err(err) => {
                    warn!(%err, "drain publish failed, requeueing and stopping drain");
                    let mut queue = self.queue.lock().unwrap();
                    queue.push_front(cmd);
                    self.connected.store(false, Ordering::Release);
                    break;
                }
            }
        }
    }

    /// Exponential-backoff reconnect loop with a 10-attempt ceiling (spec
    /// §4.6). On success, drains the queue and resets the attempt counter.
    pub async fn reconnect(&self) {
        let mut attempt = self.reconnect_attempts.load(Ordering::Acquire);
        while attempt < MAX_RECONNECT_ATTEMPTS {
            match self.transport.connect().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::Release);
                    self.reconnect_attempts.store(0, Ordering::Release);
                    self.drain_queue().await;
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    self.reconnect_attempts.store(attempt, Ordering::Release);
                    warn!(%err, attempt, "device channel reconnect failed");
                    let delay = Duration::from_millis(200u64.saturating_mul(1 << attempt.min(8)));
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!("device channel reconnect ceiling reached, giving up until next attempt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FlakyTransport {
        fail_publishes: AtomicBool,
        publish_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DeviceTransport for FlakyTransport {
        async fn publish(&self, _topic: &str, _payload: &Value) -> Result<(), String> {
            self.publish_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_publishes.load(Ordering::SeqCst) {
                Err("disconnected".into())
            } else {
                Ok(())
            }
        }
        async fn connect(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_failure_queues_and_drain_flushes() {
        let transport = Arc::new(FlakyTransport {
            fail_publishes: AtomicBool::new(true),
            publish_count: AtomicUsize::new(0),
        });

        struct Wrapper(Arc<FlakyTransport>);
        #[async_trait::async_trait]
        impl DeviceTransport for Wrapper {
            async fn publish(&self, t: &str, p: &Value) -> Result<(), String> {
                self.0.publish(t, p).await
            }
            async fn connect(&self) -> Result<(), String> {
                self.0.connect().await
            }
        }

        let channel = DeviceChannel::new(Box::new(Wrapper(transport.clone())));
        channel.connected.store(true, Ordering::SeqCst);

        channel.dispatch_command("dev-1", "f1".into(), json!({})).await;
        assert_eq!(channel.queued_len(), 1);
        assert!(!channel.is_connected());

        transport.fail_publishes.store(false, Ordering::SeqCst);
        channel.connected.store(true, Ordering::SeqCst);
        channel.drain_queue().await;

        assert_eq!(channel.queued_len(), 0);
    }

    #[tokio::test]
    async fn queue_drops_oldest_at_capacity() {
        struct AlwaysFail;
        #[async_trait::async_trait]
        impl DeviceTransport for AlwaysFail {
            async fn publish(&self, _: &str, _: &Value) -> Result<(), String> {
                Err("down".into())
            }
            async fn connect(&self) -> Result<(), String> {
                Err("down".into())
            }
        }

        let channel = DeviceChannel::new(Box::new(AlwaysFail));
        for i in 0..QUEUE_CAPACITY + 10 {
            channel.dispatch_command("dev-1", format!("f{i}"), json!({})).await;
        }
        assert_eq!(channel.queued_len(), QUEUE_CAPACITY);
    }
}
