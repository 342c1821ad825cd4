//! Broker session owned by the connection thread.
//!
//! Holds the lapin connection and two AMQP channels: `control` carries the
//! dead-letter consumer, `work` carries every command. A channel-level error
//! (404 on an unknown queue, 406 on a conflicting declaration) closes `work`;
//! it is reopened on the same connection before the next call. `work` runs in
//! publisher-confirm mode, so a publish only returns once the broker has
//! accepted or refused it.

use std::time::Duration;

use lapin::{
    options::{
        BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{Command, Delivery};
use super::topology::{expiration, Topology};
use crate::config::LayerConfig;
use crate::layer::{LayerError, Result};
use crate::naming::{self, DEAD_LETTERS, GENERATED_QUEUE_PREFIX};

/// Everything the connection thread needs from the layer configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub url: String,
    pub rules: crate::config::CapacityRules,
    pub message_ttl: Duration,
    pub membership_ttl: Duration,
    pub channel_ttl: Duration,
}

impl SessionSettings {
    pub(crate) fn from_config(config: &LayerConfig) -> Result<Self> {
        Ok(Self {
            url: config.url.clone(),
            rules: config.capacity_rules()?,
            message_ttl: config.message_ttl(),
            membership_ttl: config.membership_ttl(),
            channel_ttl: config.channel_ttl(),
        })
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Whether a lapin error is the given channel-level (soft) protocol error.
pub(crate) fn is_soft(err: &lapin::Error, expected: AMQPSoftError) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => matches!(e.kind(), AMQPErrorKind::Soft(soft) if *soft == expected),
        _ => false,
    }
}

/// Whether a lapin error means the whole connection is unusable.
pub(crate) fn is_connection_error(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => matches!(e.kind(), AMQPErrorKind::Hard(_)),
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => true,
        _ => false,
    }
}

fn connection_closed(context: &str, err: impl std::fmt::Display) -> LayerError {
    LayerError::ConnectionClosed(format!("{}: {}", context, err))
}

/// Open the command channel with publisher confirms enabled.
async fn open_work_channel(connection: &Connection) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| connection_closed("Failed to create channel", e))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| connection_closed("Failed to enable publisher confirms", e))?;
    Ok(channel)
}

// ============================================================================
// Session
// ============================================================================

pub(crate) struct Session {
    pub(super) connection: Connection,
    pub(super) control: Channel,
    pub(super) work: Channel,
    pub(super) topology: Topology,
}

impl Session {
    /// Connect, open both channels and start consuming dead letters.
    ///
    /// Also returns the dead-letter consumer and the connection error stream
    /// for the event loop to select on.
    pub(crate) async fn open(
        settings: SessionSettings,
    ) -> Result<(Self, Consumer, mpsc::UnboundedReceiver<String>)> {
        let connection = Connection::connect(&settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| connection_closed("Failed to connect", e))?;

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        connection.on_error(move |e| {
            let _ = error_tx.send(e.to_string());
        });

        let control = connection
            .create_channel()
            .await
            .map_err(|e| connection_closed("Failed to create control channel", e))?;
        let work = open_work_channel(&connection).await?;

        let consumer = Self::declare_control(&control).await?;

        info!(
            url = %redact(&settings.url),
            capacity = settings.rules.default_capacity(),
            expiry_ms = settings.message_ttl.as_millis() as u64,
            group_expiry_ms = settings.membership_ttl.as_millis() as u64,
            "Connected to AMQP"
        );

        let topology = Topology::new(
            settings.rules,
            settings.message_ttl,
            settings.membership_ttl,
            settings.channel_ttl,
        );

        Ok((
            Self {
                connection,
                control,
                work,
                topology,
            },
            consumer,
            error_rx,
        ))
    }

    /// Declare the dead-letter exchange and queue and consume from it.
    async fn declare_control(control: &Channel) -> Result<Consumer> {
        control
            .exchange_declare(
                DEAD_LETTERS,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_closed("Failed to declare dead-letter exchange", e))?;

        control
            .queue_declare(DEAD_LETTERS, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| connection_closed("Failed to declare dead-letter queue", e))?;

        control
            .queue_bind(
                DEAD_LETTERS,
                DEAD_LETTERS,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_closed("Failed to bind dead-letter queue", e))?;

        let tag = format!("channel-layer-{}", Uuid::new_v4());
        control
            .basic_consume(
                DEAD_LETTERS,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_closed("Failed to consume dead letters", e))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Close the connection gracefully.
    pub(crate) async fn close(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let _ = self.control.close(200, "OK").await;
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| connection_closed("Failed to close connection", e))
    }

    /// Run one command and resolve its reply.
    pub(crate) async fn execute(&mut self, command: Command) {
        match command {
            Command::Send {
                channel,
                body,
                reply,
            } => {
                let result = self.send(&channel, &body).await;
                let _ = reply.send(self.settle(result));
            }
            Command::Receive { channels, reply } => {
                let result = self.receive(&channels).await;
                let _ = reply.send(self.settle(result));
            }
            Command::NewChannel { pattern, reply } => {
                let result = self.new_channel(&pattern).await;
                let _ = reply.send(self.settle(result));
            }
            Command::DeclareChannel { channel, reply } => {
                let result = self.ensure_channel(&channel).await.map(|_| ());
                let _ = reply.send(self.settle(result));
            }
            Command::GroupAdd {
                group,
                channel,
                reply,
            } => {
                let result = self.group_add(&group, &channel).await;
                let _ = reply.send(self.settle(result));
            }
            Command::GroupDiscard {
                group,
                channel,
                reply,
            } => {
                let result = self.group_discard(&group, &channel).await;
                let _ = reply.send(self.settle(result));
            }
            Command::SendGroup { group, body, reply } => {
                let result = self.send_group(&group, &body).await;
                let _ = reply.send(self.settle(result));
            }
            Command::Flush { reply } => {
                let result = self.flush().await;
                let _ = reply.send(self.settle(result));
            }
            Command::Close { reply } => {
                let _ = reply.send(self.close().await);
            }
        }
    }

    /// A failure seen while the connection is down is a closed connection.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if !self.is_connected() && !e.is_connection_closed() => {
                Err(LayerError::ConnectionClosed(e.to_string()))
            }
            other => other,
        }
    }

    /// Reopen the work channel after a channel-level error closed it.
    pub(super) async fn recover(&mut self) -> Result<()> {
        if self.work.status().connected() {
            return Ok(());
        }
        self.work = open_work_channel(&self.connection).await?;
        debug!("Reopened work channel");
        Ok(())
    }

    /// Map an unexpected broker error, reopening the work channel if needed.
    pub(super) async fn fail(&mut self, context: &str, err: lapin::Error) -> LayerError {
        if is_connection_error(&err) {
            return connection_closed(context, err);
        }
        warn!(error = %err, context, "Broker rejected command");
        if let Err(e) = self.recover().await {
            return e;
        }
        LayerError::Protocol(format!("{}: {}", context, err))
    }

    // ------------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------------

    /// Declare a queue, falling back to a passive declare on 406.
    ///
    /// Returns the queue depth.
    pub(super) async fn declare_queue(&mut self, queue: &str, arguments: FieldTable) -> Result<u32> {
        match self
            .work
            .queue_declare(queue, QueueDeclareOptions::default(), arguments)
            .await
        {
            Ok(declared) => {
                self.topology.record_queue(queue);
                Ok(declared.message_count())
            }
            Err(e) if is_soft(&e, AMQPSoftError::PRECONDITIONFAILED) => {
                warn!(queue = %queue, error = %e, "Queue exists with other arguments, using it as is");
                self.recover().await?;
                match self.passive_declare(queue).await? {
                    Some(depth) => Ok(depth),
                    None => Err(LayerError::Protocol(format!(
                        "Queue '{}' vanished during declaration",
                        queue
                    ))),
                }
            }
            Err(e) => Err(self.fail("Failed to declare queue", e).await),
        }
    }

    /// Depth of an existing queue, `None` if it does not exist.
    pub(super) async fn passive_declare(&mut self, queue: &str) -> Result<Option<u32>> {
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        match self
            .work
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(declared) => Ok(Some(declared.message_count())),
            Err(e) if is_soft(&e, AMQPSoftError::NOTFOUND) => {
                self.recover().await?;
                Ok(None)
            }
            Err(e) => Err(self.fail("Failed to inspect queue", e).await),
        }
    }

    /// Make sure the queue behind `channel` exists and return its depth.
    ///
    /// Generated queues are named by the broker and cannot be recreated, so
    /// they are only inspected; `None` means the queue is gone.
    pub(super) async fn ensure_channel(&mut self, channel: &str) -> Result<Option<u32>> {
        let queue = naming::queue_name(channel);
        if naming::is_generated_queue(&queue) {
            return self.passive_declare(&queue).await;
        }
        let arguments = self.topology.channel_arguments(channel);
        self.declare_queue(&queue, arguments).await.map(Some)
    }

    /// Declare a group's fanout exchange and return its name.
    pub(super) async fn ensure_group(&mut self, group: &str) -> Result<String> {
        let exchange = naming::group_exchange(group);
        let options = ExchangeDeclareOptions {
            auto_delete: true,
            ..Default::default()
        };
        match self
            .work
            .exchange_declare(&exchange, ExchangeKind::Fanout, options, FieldTable::default())
            .await
        {
            Ok(()) => {
                self.topology.record_exchange(&exchange);
                Ok(exchange)
            }
            Err(e) => Err(self.fail("Failed to declare group exchange", e).await),
        }
    }

    /// Publish a payload and wait for the broker's confirm.
    ///
    /// Returns `false` when the broker nacked it, which happens when a
    /// destination queue is full (`reject-publish`).
    pub(super) async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<bool> {
        let confirm = match self
            .work
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => return Err(self.fail("Failed to publish", e).await),
        };
        match confirm.await {
            Ok(confirmation) => Ok(!confirmation.is_nack()),
            Err(e) => Err(self.fail("Publish not confirmed", e).await),
        }
    }

    fn message_properties(&self) -> BasicProperties {
        BasicProperties::default().with_expiration(expiration(self.topology.message_ttl()))
    }

    // ------------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------------

    async fn send(&mut self, channel: &str, body: &[u8]) -> Result<()> {
        let capacity = self.topology.capacity(channel);
        let Some(depth) = self.ensure_channel(channel).await? else {
            // The only reader of a generated channel is gone.
            debug!(channel = %channel, "Dropping message for vanished channel");
            return Ok(());
        };

        if depth as usize >= capacity {
            debug!(channel = %channel, depth, capacity, "Channel full");
            return Err(LayerError::ChannelFull {
                channel: channel.to_string(),
            });
        }

        let queue = naming::queue_name(channel);
        let properties = self.message_properties();
        if !self.publish("", &queue, body, properties).await? {
            // Another sender filled the queue after the depth check.
            return Err(LayerError::ChannelFull {
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    async fn receive(&mut self, channels: &[String]) -> Result<Option<Delivery>> {
        for channel in channels {
            let queue = naming::queue_name(channel);
            // Plain channels come into existence on first use.
            if !naming::is_generated_queue(&queue) && !self.topology.knows_queue(&queue) {
                let arguments = self.topology.channel_arguments(channel);
                self.declare_queue(&queue, arguments).await?;
            }

            match self
                .work
                .basic_get(&queue, BasicGetOptions { no_ack: true })
                .await
            {
                Ok(Some(message)) => return Ok(Some((channel.clone(), message.delivery.data))),
                Ok(None) => {}
                Err(e) if is_soft(&e, AMQPSoftError::NOTFOUND) => {
                    self.topology.forget_queue(&queue);
                    self.recover().await?;
                }
                Err(e) => return Err(self.fail("Failed to get message", e).await),
            }
        }
        Ok(None)
    }

    async fn new_channel(&mut self, pattern: &str) -> Result<String> {
        let arguments = self.topology.channel_arguments(pattern);
        let declared = match self
            .work
            .queue_declare("", QueueDeclareOptions::default(), arguments)
            .await
        {
            Ok(declared) => declared,
            Err(e) => return Err(self.fail("Failed to declare generated queue", e).await),
        };

        let queue = declared.name().as_str().to_string();
        self.topology.record_queue(&queue);
        let channel = naming::generated_channel_name(pattern, &queue).ok_or_else(|| {
            LayerError::Protocol(format!(
                "Broker named queue '{}' without the '{}' prefix",
                queue, GENERATED_QUEUE_PREFIX
            ))
        })?;
        debug!(channel = %channel, queue = %queue, "Created generated channel");
        Ok(channel)
    }

    /// Delete every queue and exchange this session declared.
    async fn flush(&mut self) -> Result<()> {
        let (queues, exchanges) = self.topology.take_declared();
        for queue in &queues {
            if let Err(e) = self
                .work
                .queue_delete(queue, QueueDeleteOptions::default())
                .await
            {
                if !is_soft(&e, AMQPSoftError::NOTFOUND) {
                    return Err(self.fail("Failed to delete queue", e).await);
                }
                self.recover().await?;
            }
        }
        for exchange in &exchanges {
            if let Err(e) = self
                .work
                .exchange_delete(exchange, ExchangeDeleteOptions::default())
                .await
            {
                if !is_soft(&e, AMQPSoftError::NOTFOUND) {
                    return Err(self.fail("Failed to delete exchange", e).await);
                }
                self.recover().await?;
            }
        }
        info!(
            queues = queues.len(),
            exchanges = exchanges.len(),
            "Flushed channel layer topology"
        );
        Ok(())
    }
}

/// Strip credentials from a broker URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
