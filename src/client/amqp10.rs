//! AMQP 1.0 protocol client
//!
//! One connection, one session. Every source address gets its own receiver
//! link (times `consumer_count`), every target address a sender link attached
//! up front; reply addresses get their sender attached on first use. A
//! publish counts as acknowledged once the peer settles it with an accepted
//! outcome.

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{Body, Message, MessageId, Outcome, Properties};
use fe2o3_amqp::types::primitives::{Binary, Value};
use fe2o3_amqp::{Connection as AmqpConnection, Delivery, Receiver, Sender, Session};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{Connection, Credentials, Source};
use crate::monitoring::MonitorRegistry;
use crate::routing::{InboundPipeline, OutboundSignal, PayloadMapper, RawInbound};

use super::{select_targets, ClientContext, ProtocolClient, PublishToken};

pub struct Amqp10Client {
    connection: Connection,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    pipeline: Arc<InboundPipeline>,
    handle: Option<ConnectionHandle<()>>,
    session: Mutex<Option<SessionHandle<()>>>,
    senders: Mutex<HashMap<String, Sender>>,
    receiver_tasks: Vec<JoinHandle<()>>,
}

impl Amqp10Client {
    pub fn new(context: ClientContext) -> Self {
        let pipeline = Arc::new(context.pipeline());
        Self {
            connection: context.connection,
            registry: context.registry,
            mapper: context.mapper,
            pipeline,
            handle: None,
            session: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            receiver_tasks: Vec::new(),
        }
    }

    async fn open_connection(&self) -> ConnectivityResult<ConnectionHandle<()>> {
        let container_id = format!("twinlink-{}", self.connection.id());
        let mut builder = AmqpConnection::builder().container_id(container_id);
        if let Some(Credentials::UserPassword { username, password }) =
            self.connection.credentials()
        {
            builder = builder.sasl_profile(SaslProfile::Plain {
                username: username.clone(),
                password: password.clone(),
            });
        }
        builder
            .open(self.connection.uri())
            .await
            .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 open: {e}")))
    }

    fn spawn_receiver(&self, mut receiver: Receiver, source: Source, address: String) -> JoinHandle<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let registry = Arc::clone(&self.registry);
        let connection_id = self.connection.id().clone();
        tokio::spawn(async move {
            loop {
                let delivery: Delivery<Body<Value>> = match receiver.recv().await {
                    Ok(delivery) => delivery,
                    Err(error) => {
                        warn!(%error, address = %address, "amqp 1.0 receiver stopped");
                        break;
                    }
                };
                let Some(payload) = body_bytes(delivery.body()) else {
                    debug!(address = %address, "ignoring delivery without a usable body");
                    let _ = receiver.accept(&delivery).await;
                    continue;
                };
                let raw = RawInbound {
                    source_address: address.clone(),
                    payload,
                    content_type: None,
                    correlation_id: correlation_id_of(&delivery),
                };
                match pipeline.handle(&source, raw).await {
                    Ok(()) => {
                        if receiver.accept(&delivery).await.is_ok() {
                            registry
                                .for_inbound_acknowledged(&connection_id, &address)
                                .record();
                        }
                    }
                    Err(error) => {
                        debug!(%error, address = %address, "amqp 1.0 delivery not dispatched");
                        let _ = receiver.reject(&delivery, None).await;
                    }
                }
            }
        })
    }

    /// Send through the sender link for `address`, attaching one first if the
    /// address was not declared as a target (reply addresses).
    async fn produce(&self, address: &str, signal: &OutboundSignal) -> ConnectivityResult<()> {
        let payload = self.mapper.map_outbound(signal)?;

        let mut senders = self.senders.lock().await;
        if !senders.contains_key(address) {
            let mut session = self.session.lock().await;
            let session = session
                .as_mut()
                .ok_or_else(|| ConnectivityError::transport("amqp 1.0 session not connected"))?;
            let link_name = format!("{}-reply-{address}", self.connection.id());
            let sender = Sender::attach(session, link_name, address)
                .await
                .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 attach: {e}")))?;
            senders.insert(address.to_string(), sender);
        }
        let sender = senders
            .get_mut(address)
            .ok_or_else(|| ConnectivityError::transport("amqp 1.0 sender link missing"))?;

        let mut properties = Properties::builder();
        if let Some(correlation_id) = &signal.correlation_id {
            properties = properties.correlation_id(MessageId::from(correlation_id.clone()));
        }
        let message = Message::builder()
            .properties(properties.build())
            .data(Binary::from(payload.to_vec()))
            .build();

        let outcome = sender
            .send(message)
            .await
            .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 send: {e}")))?;
        if !matches!(outcome, Outcome::Accepted(_)) {
            return Err(ConnectivityError::transport(format!(
                "peer settled the publish with {outcome:?}"
            )));
        }
        Ok(())
    }
}

/// Extract an opaque payload from a standard AMQP body.
fn body_bytes(body: &Body<Value>) -> Option<Bytes> {
    match body {
        Body::Data(batch) => {
            let mut bytes = Vec::new();
            for data in batch.iter() {
                bytes.extend_from_slice(&data.0);
            }
            Some(Bytes::from(bytes))
        }
        Body::Value(value) => match &value.0 {
            Value::Binary(binary) => Some(Bytes::from(binary.to_vec())),
            Value::String(text) => Some(Bytes::from(text.clone().into_bytes())),
            _ => None,
        },
        _ => None,
    }
}

fn correlation_id_of(delivery: &Delivery<Body<Value>>) -> Option<String> {
    match delivery
        .message()
        .properties
        .as_ref()
        .and_then(|p| p.correlation_id.as_ref())
    {
        Some(MessageId::String(id)) => Some(id.clone()),
        _ => None,
    }
}

#[async_trait]
impl ProtocolClient for Amqp10Client {
    async fn connect(&mut self) -> ConnectivityResult<()> {
        let mut handle = self.open_connection().await?;
        let mut session = Session::begin(&mut handle)
            .await
            .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 session: {e}")))?;

        let mut senders = HashMap::new();
        for (index, target) in self.connection.targets().iter().enumerate() {
            let link_name = format!("{}-target-{index}", self.connection.id());
            let sender = Sender::attach(&mut session, link_name, &target.address)
                .await
                .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 attach: {e}")))?;
            senders.insert(target.address.clone(), sender);
        }

        let sources = self.connection.sources().to_vec();
        for source in &sources {
            for address in &source.addresses {
                for index in 0..source.consumer_count.max(1) {
                    let link_name = format!("{}-source-{address}-{index}", self.connection.id());
                    let receiver = Receiver::attach(&mut session, link_name, address)
                        .await
                        .map_err(|e| {
                            ConnectivityError::transport(format!("amqp 1.0 attach: {e}"))
                        })?;
                    let task = self.spawn_receiver(receiver, source.clone(), address.clone());
                    self.receiver_tasks.push(task);
                }
            }
        }

        info!(
            connection_id = %self.connection.id(),
            receivers = self.receiver_tasks.len(),
            senders = senders.len(),
            "amqp 1.0 client connected"
        );
        *self.senders.lock().await = senders;
        *self.session.lock().await = Some(session);
        self.handle = Some(handle);
        Ok(())
    }

    async fn disconnect(&mut self, _drain: Duration) -> ConnectivityResult<()> {
        // outcomes are awaited inline, so there is nothing left to drain
        for task in self.receiver_tasks.drain(..) {
            task.abort();
        }
        for (_, sender) in self.senders.lock().await.drain() {
            let _ = sender.close().await;
        }
        if let Some(mut session) = self.session.lock().await.take() {
            let _ = session.end().await;
        }
        if let Some(mut handle) = self.handle.take() {
            handle
                .close()
                .await
                .map_err(|e| ConnectivityError::transport(format!("amqp 1.0 close: {e}")))?;
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
                    self.registry
                        .for_outbound_acknowledged(id, &target.address)
                        .record();
                }
                Err(error) => {
                    warn!(
                        connection_id = %id,
                        target = %target.address,
                        %error,
                        "amqp 1.0 publish to target failed"
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
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp::types::messaging::AmqpValue;

    #[test]
    fn data_body_concatenates_sections() {
        let body: Body<Value> = Body::Data(
            vec![
                fe2o3_amqp::types::messaging::Data(Binary::from(b"twin".to_vec())),
                fe2o3_amqp::types::messaging::Data(Binary::from(b"link".to_vec())),
            ]
            .into(),
        );
        assert_eq!(body_bytes(&body), Some(Bytes::from_static(b"twinlink")));
    }

    #[test]
    fn value_bodies_are_accepted_as_payload() {
        let binary: Body<Value> = Body::Value(AmqpValue(Value::Binary(Binary::from(
            b"payload".to_vec(),
        ))));
        assert_eq!(body_bytes(&binary), Some(Bytes::from_static(b"payload")));

        let text: Body<Value> = Body::Value(AmqpValue(Value::String("hi".to_string())));
        assert_eq!(body_bytes(&text), Some(Bytes::from_static(b"hi")));

        let unusable: Body<Value> = Body::Value(AmqpValue(Value::Bool(true)));
        assert_eq!(body_bytes(&unusable), None);
    }

    #[test]
    fn empty_body_has_no_payload() {
        assert_eq!(body_bytes(&Body::Empty), None);
    }
}
