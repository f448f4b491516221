//! Kafka protocol client
//!
//! Sources become consumer groups (group id = connection id), targets become
//! produced topics. The delivery confirmation from the broker doubles as the
//! publish acknowledgement, so publishes never linger unacknowledged.

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{Connection, Credentials, Source};
use crate::monitoring::MonitorRegistry;
use crate::routing::{InboundPipeline, OutboundSignal, PayloadMapper, RawInbound};

use super::{select_targets, ClientContext, ProtocolClient, PublishToken};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaClient {
    connection: Connection,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    pipeline: Arc<InboundPipeline>,
    producer: Option<FutureProducer>,
    consumer_tasks: Vec<JoinHandle<()>>,
}

impl KafkaClient {
    pub fn new(context: ClientContext) -> Self {
        let pipeline = Arc::new(context.pipeline());
        Self {
            connection: context.connection,
            registry: context.registry,
            mapper: context.mapper,
            pipeline,
            producer: None,
            consumer_tasks: Vec::new(),
        }
    }

    fn bootstrap_servers(&self) -> String {
        if let Some(servers) = self.connection.specific_config().get("bootstrapServers") {
            return servers.clone();
        }
        // "kafka://host:9092" and "ssl://host:9093" both reduce to host:port
        let uri = self.connection.uri();
        uri.split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| uri.to_string())
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.bootstrap_servers());

        let tls = self.connection.uri().starts_with("ssl://");
        if !self.connection.validate_certificates() {
            config.set("enable.ssl.certificate.verification", "false");
        }
        if let (Some(mechanism), Some(Credentials::UserPassword { username, password })) = (
            self.connection.specific_config().get("saslMechanism"),
            self.connection.credentials(),
        ) {
            config.set("sasl.mechanism", mechanism);
            config.set("sasl.username", username);
            config.set("sasl.password", password);
            config.set(
                "security.protocol",
                if tls { "SASL_SSL" } else { "SASL_PLAINTEXT" },
            );
        } else if tls {
            config.set("security.protocol", "SSL");
        }
        config
    }

    fn spawn_consumer(&self, source: &Source, index: u32) -> ConnectivityResult<JoinHandle<()>> {
        let consumer: StreamConsumer = self
            .base_config()
            .set("group.id", self.connection.id().as_str())
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| ConnectivityError::transport(format!("kafka consumer setup: {e}")))?;

        let topics: Vec<&str> = source.addresses.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConnectivityError::transport(format!("kafka subscribe: {e}")))?;

        let pipeline = Arc::clone(&self.pipeline);
        let registry = Arc::clone(&self.registry);
        let connection_id = self.connection.id().clone();
        let source = source.clone();
        Ok(tokio::spawn(async move {
            debug!(connection_id = %connection_id, consumer = index, "kafka consumer started");
            let mut stream = consumer.stream();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(message) => {
                        let topic = message.topic().to_string();
                        let raw = RawInbound {
                            source_address: topic.clone(),
                            payload: message
                                .payload()
                                .map(|p| bytes::Bytes::copy_from_slice(p))
                                .unwrap_or_default(),
                            content_type: None,
                            correlation_id: message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).into_owned()),
                        };
                        match pipeline.handle(&source, raw).await {
                            // auto commit carries the offset forward
                            Ok(()) => registry
                                .for_inbound_acknowledged(&connection_id, &topic)
                                .record(),
                            Err(error) => {
                                debug!(%error, topic = %topic, "kafka record not dispatched");
                            }
                        }
                    }
                    Err(error) => warn!(%error, "kafka consumer error"),
                }
            }
        }))
    }

    async fn produce(&self, address: &str, signal: &OutboundSignal) -> ConnectivityResult<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| ConnectivityError::transport("kafka producer not connected"))?;
        let payload = self.mapper.map_outbound(signal)?;
        let key = signal
            .correlation_id
            .clone()
            .unwrap_or_else(|| signal.topic.clone());

        let record = FutureRecord::to(address).payload(payload.as_ref()).key(&key);
        producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| ConnectivityError::transport(format!("kafka produce: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for KafkaClient {
    async fn connect(&mut self) -> ConnectivityResult<()> {
        let producer: FutureProducer = self
            .base_config()
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| ConnectivityError::transport(format!("kafka producer setup: {e}")))?;
        self.producer = Some(producer);

        let sources = self.connection.sources().to_vec();
        for source in &sources {
            for index in 0..source.consumer_count.max(1) {
                let task = self.spawn_consumer(source, index)?;
                self.consumer_tasks.push(task);
            }
        }
        info!(
            connection_id = %self.connection.id(),
            consumers = self.consumer_tasks.len(),
            "kafka client connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self, drain: Duration) -> ConnectivityResult<()> {
        for task in self.consumer_tasks.drain(..) {
            task.abort();
        }
        if let Some(producer) = self.producer.take() {
            producer
                .flush(drain)
                .map_err(|e| ConnectivityError::transport(format!("kafka flush: {e}")))?;
        }
        Ok(())
    }

    async fn publish_signal(&self, signal: OutboundSignal) -> ConnectivityResult<()> {
        let id = self.connection.id();
        if signal.is_response {
            self.registry.for_response_dispatched(id).record();
            match self.produce(&signal.topic, &signal).await {
                Ok(()) => {
                    self.registry.for_response_published(id).record();
                    return Ok(());
                }
                Err(error) => {
                    self.registry.for_response_dropped(id).record();
                    return Err(error);
                }
            }
        }

        let (selected, filtered) = select_targets(self.connection.targets(), &signal.topic);
        for target in &filtered {
            self.registry
                .for_outbound_filtered(id, &target.address)
                .record();
        }

        let mut first_error = None;
        for target in selected {
            self.registry
                .for_outbound_dispatched(id, &target.address)
                .record();
            match self.produce(&target.address, &signal).await {
                Ok(()) => {
                    self.registry
                        .for_outbound_published(id, &target.address)
                        .record();
                    // the delivery confirmation is the broker acknowledgement
                    self.registry
                        .for_outbound_acknowledged(id, &target.address)
                        .record();
                }
                Err(error) => {
                    warn!(
                        connection_id = %id,
                        target = %target.address,
                        %error,
                        "kafka produce to target failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn unacknowledged_publishes(&self) -> Vec<PublishToken> {
        // deliveries are awaited inline; flush on disconnect covers the queue
        Vec::new()
    }
}
