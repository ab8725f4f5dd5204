//! Owns the single physical connection every pool and the topology coordinator share.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::ConnectionFactory;
use crate::transport::{Channel, ConnectionPrimitive, Connector, LinkState};
use crate::Error;

/// `ConnectionManager` owns the connection to the broker and creates channels on it.
///
/// The connection is established lazily, on the first channel creation, and is never
/// re-established once closed: if it supports recovery, channel creation waits for it to
/// come back, otherwise it fails with [`Error::ChannelAvailability`].
///
/// Every channel it creates is closed by [`ConnectionManager::close`].
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    hosts: Vec<String>,
    client_name: String,
    connection: Mutex<Option<Arc<dyn ConnectionPrimitive>>>,
    channels: Mutex<Vec<Channel>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: impl Connector,
        hosts: Vec<String>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            hosts,
            client_name: client_name.into(),
            connection: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A `ConnectionManager` connecting to RabbitMq with `lapin`.
    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(settings).map_err(|e| {
            Error::Configuration(format!("invalid RabbitMq settings: {e:#}"))
        })?;
        Ok(Self::new(
            factory,
            settings.hosts.clone(),
            settings.client_name(),
        ))
    }

    /// Establish the connection, unless it already exists.
    ///
    /// A failure is final: it is not retried.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.connection(cancel).await.map(|_| ())
    }

    /// Create a new channel, connecting first if needed.
    #[tracing::instrument(name = "rabbitmq_create_channel", skip_all)]
    pub async fn create_channel(&self, cancel: &CancellationToken) -> Result<Channel, Error> {
        let connection = self.connection(cancel).await?;
        loop {
            match connection.state() {
                LinkState::Open => break,
                LinkState::Closed(reason) if reason.is_application_initiated() => {
                    return Err(Error::ChannelAvailability(format!(
                        "the connection was closed by the application ({reason})"
                    )));
                }
                LinkState::Closed(reason) if !connection.supports_recovery() => {
                    return Err(Error::ChannelAvailability(format!(
                        "the connection was lost and cannot recover ({reason})"
                    )));
                }
                LinkState::Closed(reason) => {
                    info!(%reason, "Connection lost, waiting for its recovery");
                    wait_for_recovery(connection.as_ref(), cancel).await?;
                }
            }
        }
        let channel = connection.create_channel().await?;

        let mut channels = self.channels.lock().await;
        // Channels that closed for good don't need to be closed again.
        channels.retain(|tracked| tracked.is_open() || tracked.supports_recovery());
        channels.push(channel.clone());
        Ok(channel)
    }

    /// Close every channel created so far, then the connection.
    ///
    /// Further channel creations fail with [`Error::ChannelAvailability`].
    #[tracing::instrument(name = "rabbitmq_close", skip_all)]
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let channels: Vec<Channel> = self.channels.lock().await.drain(..).collect();
        let outcomes = join_all(channels.iter().map(|channel| channel.close())).await;
        for (channel, outcome) in channels.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(channel = %channel.id(), "Failed to close channel: {:?}", e);
            }
        }
        if let Some(connection) = self.connection.lock().await.as_ref() {
            if let Err(e) = connection.close().await {
                warn!("Failed to close the RabbitMq connection: {:?}", e);
            }
        }
    }

    async fn connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ConnectionPrimitive>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelAvailability(
                "the connection manager has been closed".into(),
            ));
        }
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let established = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            established = self.connector.connect(&self.hosts, &self.client_name) => established,
        };
        let established = established.map_err(|source| Error::BrokerUnreachable {
            hosts: self.hosts.clone(),
            source,
        })?;
        info!(client_name = %self.client_name, "Connected to RabbitMq");
        *connection = Some(Arc::clone(&established));
        Ok(established)
    }
}

/// Wait until the connection is open again, or closed by the application.
async fn wait_for_recovery(
    connection: &dyn ConnectionPrimitive,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut state = connection.subscribe();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        changed = state.wait_for(|state| match state {
            LinkState::Open => true,
            LinkState::Closed(reason) => reason.is_application_initiated(),
        }) => changed.map(|_| ()).map_err(|_| {
            Error::ChannelAvailability("the connection was dropped while recovering".into())
        }),
    }
}
