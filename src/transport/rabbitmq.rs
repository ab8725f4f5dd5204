//! [`ConnectionPrimitive`] and [`ChannelPrimitive`] on top of [`lapin`]'s `Connection` and `Channel`.
//!
//! `lapin` connections do not recover on their own: both types report
//! `supports_recovery() == false`, so a closure the application did not ask for is final.
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::options::ConfirmSelectOptions;
use tokio::sync::watch;
use tracing::warn;

use super::{
    Channel, ChannelId, ChannelPrimitive, CloseReason, ConnectionPrimitive, LinkState,
};
use crate::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};

const REPLY_SUCCESS: u16 = 200;

/// A connection to a RabbitMq broker.
pub struct RabbitMqConnection {
    inner: lapin::Connection,
    state: Arc<watch::Sender<LinkState>>,
    publisher_confirms: bool,
}

impl RabbitMqConnection {
    pub(crate) fn new(connection: lapin::Connection, publisher_confirms: bool) -> Self {
        let (state, _) = watch::channel(LinkState::Open);
        let state = Arc::new(state);
        let on_error = Arc::clone(&state);
        // Register a callback to log connection errors.
        connection.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            on_error.send_replace(LinkState::Closed(CloseReason::peer(0, e.to_string())));
        });
        Self {
            inner: connection,
            state,
            publisher_confirms,
        }
    }

    /// Get access to the underlying raw connection
    pub fn raw(&self) -> &lapin::Connection {
        &self.inner
    }
}

#[async_trait::async_trait]
impl ConnectionPrimitive for RabbitMqConnection {
    fn state(&self) -> LinkState {
        let observed = self.state.borrow().clone();
        if !observed.is_open() {
            return observed;
        }
        if self.inner.status().connected() {
            LinkState::Open
        } else {
            LinkState::Closed(CloseReason::library(format!(
                "Connection is not in an healthy state {:?}",
                self.inner.status().state()
            )))
        }
    }

    fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn supports_recovery(&self) -> bool {
        false
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Channel, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        if self.publisher_confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Channel::new(RabbitMqChannel::new(channel)))
    }

    #[tracing::instrument(name = "rabbitmq_close_connection", skip(self))]
    async fn close(&self) -> Result<(), anyhow::Error> {
        self.state.send_replace(LinkState::Closed(CloseReason::application(
            "connection closed by the application",
        )));
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "closed by the application").await?;
        }
        Ok(())
    }
}

/// A channel on a [`RabbitMqConnection`].
///
/// Use [`Channel::downcast_ref`] on a leased channel to reach it, then [`RabbitMqChannel::raw`]
/// to publish or consume.
pub struct RabbitMqChannel {
    id: ChannelId,
    inner: lapin::Channel,
    state: watch::Sender<LinkState>,
    closed_by_application: AtomicBool,
}

impl RabbitMqChannel {
    fn new(channel: lapin::Channel) -> Self {
        let (state, _) = watch::channel(LinkState::Open);
        Self {
            id: ChannelId::next(),
            inner: channel,
            state,
            closed_by_application: AtomicBool::new(false),
        }
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait::async_trait]
impl ChannelPrimitive for RabbitMqChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn state(&self) -> LinkState {
        if self.closed_by_application.load(Ordering::Acquire) {
            return self.state.borrow().clone();
        }
        if self.inner.status().connected() {
            LinkState::Open
        } else {
            LinkState::Closed(CloseReason::peer(
                0,
                format!(
                    "Channel is in an unhealthy state: {:?}",
                    self.inner.status().state()
                ),
            ))
        }
    }

    fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn supports_recovery(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn declare_exchange(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), anyhow::Error> {
        self.inner
            .exchange_declare(
                &declaration.name,
                declaration.kind.clone(),
                declaration.options(),
                declaration.arguments.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error> {
        self.inner
            .queue_declare(
                &declaration.name,
                declaration.options(),
                declaration.arguments.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error> {
        self.inner
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                binding.options(),
                binding.arguments.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_unbind_queue", skip(self))]
    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error> {
        self.inner
            .queue_unbind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                binding.arguments.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_close_channel", skip(self), fields(channel = %self.id))]
    async fn close(&self) -> Result<(), anyhow::Error> {
        self.closed_by_application.store(true, Ordering::Release);
        self.state.send_replace(LinkState::Closed(CloseReason::application(
            "channel closed by the application",
        )));
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "closed by the application").await?;
        }
        Ok(())
    }
}
