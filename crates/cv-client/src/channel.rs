//! Channel Pool - single-writer channels multiplexed over the connection
//!
//! Channels are pooled per role so publishers and consumers never share a
//! writer. When the connection generation changes (loss or reconnect) the
//! idle set is discarded wholesale and channels are recreated lazily on the
//! next acquire. A channel that errored is dropped, never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use cv_broker::BrokerChannel;
use cv_common::Result;

use crate::connection::{ConnectionEvent, ConnectionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Publisher,
    Consumer,
}

/// A channel checked out of the pool. Return it with `ChannelPool::release`
/// when still healthy; drop it otherwise.
pub struct PooledChannel {
    channel: Box<dyn BrokerChannel>,
    role: ChannelRole,
    generation: u64,
}

impl PooledChannel {
    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }
}

pub struct ChannelPool {
    connection: Arc<ConnectionManager>,
    idle_publishers: Mutex<Vec<PooledChannel>>,
    idle_consumers: Mutex<Vec<PooledChannel>>,
    generation: AtomicU64,
}

impl ChannelPool {
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<Self> {
        let pool = Arc::new(Self {
            connection,
            idle_publishers: Mutex::new(Vec::new()),
            idle_consumers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        });

        // Discard idle channels whenever the connection turns over.
        {
            let pool = pool.clone();
            let mut events = pool.connection.subscribe();
            let mut shutdown = pool.connection.shutdown_signal();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(ConnectionEvent::Lost)
                            | Ok(ConnectionEvent::Reconnected { .. })
                            | Ok(ConnectionEvent::Failed { .. }) => pool.invalidate(),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                pool.invalidate();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        pool
    }

    /// Check out an idle channel of the given role, or open a fresh one.
    pub async fn acquire(&self, role: ChannelRole) -> Result<PooledChannel> {
        let generation = self.generation.load(Ordering::SeqCst);

        loop {
            let candidate = self.idle_list(role).lock().pop();
            match candidate {
                Some(ch) if ch.generation == generation && ch.channel.is_open() => {
                    return Ok(ch);
                }
                Some(_) => continue, // stale or broken: drop and keep looking
                None => break,
            }
        }

        let channel = self.connection.open_channel().await?;
        debug!(?role, generation, "opened fresh channel");
        Ok(PooledChannel {
            channel,
            role,
            generation,
        })
    }

    /// Return a healthy channel for reuse. Stale or closed channels are
    /// silently discarded instead.
    pub fn release(&self, channel: PooledChannel) {
        if channel.generation == self.generation.load(Ordering::SeqCst)
            && channel.channel.is_open()
        {
            self.idle_list(channel.role).lock().push(channel);
        }
    }

    /// Bump the generation and drop every idle channel.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.idle_publishers.lock().clear();
        self.idle_consumers.lock().clear();
        debug!(
            generation = self.generation.load(Ordering::SeqCst),
            "channel pool invalidated"
        );
    }

    pub fn idle_count(&self) -> usize {
        self.idle_publishers.lock().len() + self.idle_consumers.lock().len()
    }

    fn idle_list(&self, role: ChannelRole) -> &Mutex<Vec<PooledChannel>> {
        match role {
            ChannelRole::Publisher => &self.idle_publishers,
            ChannelRole::Consumer => &self.idle_consumers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_broker::MemoryBroker;
    use cv_common::{BrokerConfig, ReconnectPolicy};
    use std::time::Duration;

    async fn pool_over_memory(broker: &MemoryBroker) -> Arc<ChannelPool> {
        let manager = ConnectionManager::connect(
            Box::new(broker.clone()),
            BrokerConfig::default(),
            ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_connect_attempts: None,
            },
        )
        .await
        .unwrap();
        ChannelPool::new(manager)
    }

    #[tokio::test]
    async fn released_channels_are_reused() {
        let broker = MemoryBroker::new();
        let pool = pool_over_memory(&broker).await;

        let ch = pool.acquire(ChannelRole::Publisher).await.unwrap();
        pool.release(ch);
        assert_eq!(pool.idle_count(), 1);

        let _ch = pool.acquire(ChannelRole::Publisher).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn roles_do_not_share_idle_channels() {
        let broker = MemoryBroker::new();
        let pool = pool_over_memory(&broker).await;

        let ch = pool.acquire(ChannelRole::Publisher).await.unwrap();
        pool.release(ch);

        // The consumer acquire must not get the idle publisher channel back.
        let ch = pool.acquire(ChannelRole::Consumer).await.unwrap();
        assert_eq!(ch.role(), ChannelRole::Consumer);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn invalidation_discards_idle_channels() {
        let broker = MemoryBroker::new();
        let pool = pool_over_memory(&broker).await;

        let ch = pool.acquire(ChannelRole::Publisher).await.unwrap();
        pool.release(ch);
        assert_eq!(pool.idle_count(), 1);

        pool.invalidate();
        assert_eq!(pool.idle_count(), 0);

        // A fresh acquire still works against the live connection.
        let ch = pool.acquire(ChannelRole::Publisher).await.unwrap();
        assert!(ch.channel().is_open());
    }
}
