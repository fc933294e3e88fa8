//! In-process broker with beanstalkd semantics
//!
//! Used by tests and single-host development runs. Reserved messages become
//! ready again when their time-to-run elapses without a delete or touch.

use crate::queue::{Broker, BrokerError, BrokerResult, Reserved, TubeStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound on how long a waiting reserve sleeps between checks
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Ready { ready_at: Instant },
    Reserved { deadline: Instant },
    Buried,
}

#[derive(Debug)]
struct StoredMessage {
    tube: String,
    body: Vec<u8>,
    priority: u32,
    ttr: Duration,
    state: MessageState,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    messages: HashMap<u64, StoredMessage>,
}

impl MemoryState {
    /// Returns expired reservations to the ready queue
    fn expire_reservations(&mut self, now: Instant) {
        for message in self.messages.values_mut() {
            if let MessageState::Reserved { deadline } = message.state {
                if deadline <= now {
                    message.state = MessageState::Ready { ready_at: now };
                }
            }
        }
    }

    fn take_ready(&mut self, tube: &str, now: Instant) -> Option<Reserved> {
        let id = self
            .messages
            .iter()
            .filter(|(_, m)| m.tube == tube)
            .filter(|(_, m)| matches!(m.state, MessageState::Ready { ready_at } if ready_at <= now))
            .min_by_key(|(id, m)| (m.priority, **id))
            .map(|(id, _)| *id)?;

        let message = self.messages.get_mut(&id)?;
        message.state = MessageState::Reserved {
            deadline: now + message.ttr,
        };
        Some(Reserved {
            id,
            body: message.body.clone(),
        })
    }

    fn reserved_mut(&mut self, id: u64) -> BrokerResult<&mut StoredMessage> {
        match self.messages.get_mut(&id) {
            Some(message) if matches!(message.state, MessageState::Reserved { .. }) => Ok(message),
            _ => Err(BrokerError::NotFound(id)),
        }
    }
}

/// In-memory [`Broker`]
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the broker going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("memory broker lock poisoned".to_string()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> BrokerResult<()> {
        self.lock().map(|_| ())
    }

    async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: u32,
        ttr: Duration,
    ) -> BrokerResult<u64> {
        let id = {
            let mut state = self.lock()?;
            state.next_id += 1;
            let id = state.next_id;
            state.messages.insert(
                id,
                StoredMessage {
                    tube: tube.to_string(),
                    body: body.to_vec(),
                    priority,
                    ttr: ttr.max(Duration::from_millis(1)),
                    state: MessageState::Ready {
                        ready_at: Instant::now(),
                    },
                },
            );
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(&self, tube: &str, timeout: Duration) -> BrokerResult<Option<Reserved>> {
        let give_up_at = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            {
                let mut state = self.lock()?;
                state.expire_reservations(now);
                if let Some(reserved) = state.take_ready(tube, now) {
                    return Ok(Some(reserved));
                }
            }

            if now >= give_up_at {
                return Ok(None);
            }

            let wait = (give_up_at - now).min(POLL_INTERVAL);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn delete(&self, id: u64) -> BrokerResult<()> {
        let mut state = self.lock()?;
        state.reserved_mut(id)?;
        state.messages.remove(&id);
        Ok(())
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> BrokerResult<()> {
        {
            let mut state = self.lock()?;
            let message = state.reserved_mut(id)?;
            message.priority = priority;
            message.state = MessageState::Ready {
                ready_at: Instant::now() + delay,
            };
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn bury(&self, id: u64) -> BrokerResult<()> {
        let mut state = self.lock()?;
        state.reserved_mut(id)?.state = MessageState::Buried;
        Ok(())
    }

    async fn touch(&self, id: u64) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let message = state.reserved_mut(id)?;
        message.state = MessageState::Reserved {
            deadline: Instant::now() + message.ttr,
        };
        Ok(())
    }

    async fn stats_tube(&self, tube: &str) -> BrokerResult<TubeStats> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.expire_reservations(now);

        let mut stats = TubeStats {
            name: tube.to_string(),
            ..TubeStats::default()
        };
        for message in state.messages.values().filter(|m| m.tube == tube) {
            match message.state {
                MessageState::Ready { ready_at } if ready_at <= now => stats.ready += 1,
                MessageState::Ready { .. } => stats.delayed += 1,
                MessageState::Reserved { .. } => stats.reserved += 1,
                MessageState::Buried => stats.buried += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTR: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let broker = MemoryBroker::new();
        broker.put("t", b"first", 100, TTR).await.unwrap();
        broker.put("t", b"second", 100, TTR).await.unwrap();
        broker.put("t", b"urgent", 1, TTR).await.unwrap();

        let timeout = Duration::from_millis(10);
        let a = broker.reserve("t", timeout).await.unwrap().unwrap();
        let b = broker.reserve("t", timeout).await.unwrap().unwrap();
        let c = broker.reserve("t", timeout).await.unwrap().unwrap();
        assert_eq!(a.body, b"urgent");
        assert_eq!(b.body, b"first");
        assert_eq!(c.body, b"second");
        assert!(broker.reserve("t", timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tubes_are_isolated() {
        let broker = MemoryBroker::new();
        broker.put("a", b"x", 1, TTR).await.unwrap();
        assert!(broker
            .reserve("b", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let broker = MemoryBroker::new();
        broker
            .put("t", b"job", 1, Duration::from_millis(50))
            .await
            .unwrap();

        let first = broker
            .reserve("t", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        // hidden while reserved
        assert!(broker
            .reserve("t", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        let again = broker
            .reserve("t", Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
    }

    #[tokio::test]
    async fn test_touch_extends_reservation() {
        let broker = MemoryBroker::new();
        broker
            .put("t", b"job", 1, Duration::from_millis(300))
            .await
            .unwrap();
        let reserved = broker
            .reserve("t", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.touch(reserved.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(broker
            .reserve("t", Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_bury_and_stats() {
        let broker = MemoryBroker::new();
        broker.put("t", b"a", 1, TTR).await.unwrap();
        broker.put("t", b"b", 1, TTR).await.unwrap();
        broker.put("t", b"c", 1, TTR).await.unwrap();

        let timeout = Duration::from_millis(10);
        let a = broker.reserve("t", timeout).await.unwrap().unwrap();
        let b = broker.reserve("t", timeout).await.unwrap().unwrap();
        broker.delete(a.id).await.unwrap();
        broker.bury(b.id).await.unwrap();

        let stats = broker.stats_tube("t").await.unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.buried, 1);
        assert_eq!(stats.reserved, 0);

        assert!(matches!(broker.delete(a.id).await, Err(BrokerError::NotFound(_))));
        // buried messages are not reserved
        assert!(matches!(broker.touch(b.id).await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_put() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.reserve("t", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.put("t", b"late", 1, TTR).await.unwrap();

        let reserved = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(reserved.body, b"late");
    }

    #[tokio::test]
    async fn test_offline_broker_fails() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.ping().await.is_err());
        assert!(broker.put("t", b"x", 1, TTR).await.is_err());
        broker.set_available(true);
        assert!(broker.ping().await.is_ok());
    }
}
