//! Client - explicit connection lifecycle handle
//!
//! Owns the connection manager and channel pool and hands explicit
//! references to publishers and consumers. No ambient global state: the
//! process creates a `Client` on startup and calls `shutdown` on its way
//! out, which stops registered consumers before closing the connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use cv_broker::BrokerTransport;
use cv_common::{
    BrokerConfig, ConsumerOptions, PublisherConfig, QueueOptions, ReconnectPolicy, Result,
};

use crate::channel::ChannelPool;
use crate::connection::ConnectionManager;
use crate::consumer::Consumer;
use crate::publisher::Publisher;

pub struct Client {
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelPool>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
}

impl Client {
    /// Connect to the broker and build the channel pool.
    pub async fn connect(
        transport: Box<dyn BrokerTransport>,
        config: BrokerConfig,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let connection = ConnectionManager::connect(transport, config, policy).await?;
        let channels = ChannelPool::new(connection.clone());
        Ok(Self {
            connection,
            channels,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.channels
    }

    /// Build a publisher for one queue.
    pub fn publisher(&self, queue: QueueOptions, config: PublisherConfig) -> Publisher {
        Publisher::new(&self.connection, self.channels.clone(), queue, config)
    }

    /// Build a consumer and register it for shutdown.
    pub fn consumer(&self, options: ConsumerOptions) -> Arc<Consumer> {
        let consumer = Arc::new(Consumer::new(
            self.connection.clone(),
            self.channels.clone(),
            options,
        ));
        self.consumers.lock().push(consumer.clone());
        consumer
    }

    /// Stop registered consumers (draining each), then close the connection.
    pub async fn shutdown(&self) {
        info!("client shutting down");
        let consumers: Vec<Arc<Consumer>> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.stop().await {
                warn!(error = %e, "consumer did not stop cleanly");
            }
        }
        self.connection.close().await;
        info!("client shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use cv_broker::MemoryBroker;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_and_shutdown_lifecycle() {
        let broker = MemoryBroker::new();
        let client = Client::connect(
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
        assert_eq!(client.connection().state(), ConnectionState::Open);

        client.shutdown().await;
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_connections(), 0);
    }
}
