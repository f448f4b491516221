//! MQTT 5 session backed by the rumqttc v5 client
//!
//! Same observable behavior as [`super::v3`], plus the 5-only session
//! parameters: clean start with session expiry, receive maximum and
//! correlation data on publishes.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnectProperties, ConnectReturnCode, Filter, Packet, PublishProperties, SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::{Outgoing, Transport};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::generic::{
    AckHook, GenericMqttClient, GenericMqttConnect, GenericMqttMessage, GenericMqttPublish,
    GenericMqttSubscribe, PendingPublish, PendingSubscribe, SessionShared, SubscriptionOutcome,
};
use super::{broker_endpoint, EVENT_CHANNEL_CAPACITY};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{Credentials, QualityOfService};

pub struct Mqtt5Client {
    broker_uri: String,
    credentials: Option<Credentials>,
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
}

impl Mqtt5Client {
    pub fn new<S: Into<String>>(broker_uri: S, credentials: Option<Credentials>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            credentials,
            client: None,
            event_loop_handle: None,
            shared: Arc::new(SessionShared::default()),
        }
    }

    fn options(&self, connect: &GenericMqttConnect) -> ConnectivityResult<MqttOptions> {
        let endpoint = broker_endpoint(&self.broker_uri)?;
        let mut options = MqttOptions::new(&connect.client_id, endpoint.host, endpoint.port);
        if endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options.set_keep_alive(connect.keep_alive);
        options.set_clean_start(connect.clean_session);
        if let Some(Credentials::UserPassword { username, password }) = &self.credentials {
            options.set_credentials(username, password);
        }
        if connect.session_expiry.is_some() || connect.receive_maximum.is_some() {
            let mut properties = ConnectProperties::default();
            properties.session_expiry_interval =
                connect.session_expiry.map(|expiry| expiry.as_secs() as u32);
            properties.receive_maximum = connect.receive_maximum;
            options.set_connect_properties(properties);
        }
        Ok(options)
    }

    fn session(&self) -> ConnectivityResult<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectivityError::transport("mqtt session not connected"))
    }
}

#[async_trait]
impl GenericMqttClient for Mqtt5Client {
    async fn connect(&mut self, connect: GenericMqttConnect) -> ConnectivityResult<()> {
        let options = self.options(&connect)?;
        let (client, mut event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(ConnectivityError::transport(format!(
                        "broker refused MQTT 5 session: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(error) => {
                    return Err(ConnectivityError::transport(format!(
                        "MQTT 5 connect failed: {error}"
                    )))
                }
            }
        }

        info!(broker = %self.broker_uri, "MQTT 5 session established");
        let shared = Arc::clone(&self.shared);
        self.event_loop_handle = Some(tokio::spawn(run_event_loop(event_loop, shared)));
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> ConnectivityResult<()> {
        if let Some(client) = self.client.take() {
            client
                .disconnect()
                .await
                .map_err(|e| ConnectivityError::transport(format!("mqtt disconnect: {e}")))?;
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn publish(&self, publish: GenericMqttPublish) -> ConnectivityResult<()> {
        let mut properties = PublishProperties::default();
        properties.correlation_data = publish
            .correlation_id
            .as_ref()
            .map(|id| Bytes::from(id.clone().into_bytes()));

        let client = self.session()?;
        self.shared.enqueue_publish_topic(&publish.topic);
        let result = client
            .publish_with_properties(
                publish.topic,
                to_qos(publish.qos),
                publish.retain,
                publish.payload,
                properties,
            )
            .await;
        if result.is_err() {
            self.shared.abort_last_enqueued();
        }
        result.map_err(|e| ConnectivityError::transport(format!("mqtt publish: {e}")))
    }

    async fn subscribe(
        &self,
        subscribe: GenericMqttSubscribe,
    ) -> ConnectivityResult<Vec<SubscriptionOutcome>> {
        let client = self.session()?;
        let filters: Vec<Filter> = subscribe
            .subscriptions
            .iter()
            .map(|s| Filter::new(s.topic_filter.clone(), to_qos(s.qos)))
            .collect();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.push_pending_subscribe(PendingSubscribe {
            filters: subscribe.topic_filters(),
            reply: reply_tx,
        });

        client
            .subscribe_many(filters)
            .await
            .map_err(|e| ConnectivityError::transport(format!("mqtt subscribe: {e}")))?;

        reply_rx.await.map_err(|_| {
            ConnectivityError::transport("session ended before the subscribe was acknowledged")
        })
    }

    fn set_inbound_sender(&mut self, sender: mpsc::Sender<GenericMqttMessage>) {
        self.shared.set_inbound(sender);
    }

    fn set_acknowledged_hook(&mut self, hook: AckHook) {
        self.shared.set_acknowledged_hook(hook);
    }

    fn unacknowledged_publishes(&self) -> Vec<PendingPublish> {
        self.shared.unacknowledged()
    }
}

async fn run_event_loop(mut event_loop: EventLoop, shared: Arc<SessionShared>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let correlation_id = publish
                    .properties
                    .as_ref()
                    .and_then(|p| p.correlation_data.as_ref())
                    .map(|data| String::from_utf8_lossy(data).into_owned());
                let message = GenericMqttMessage {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.clone(),
                    qos: from_qos(publish.qos),
                    retain: publish.retain,
                    correlation_id,
                };
                shared.forward_inbound(message).await;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let results = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => Ok(from_qos(*qos)),
                        other => Err(format!("{other:?}")),
                    })
                    .collect();
                shared.resolve_subscribe(results);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.settle_publish(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => shared.settle_publish(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.track_publish(pkid),
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "MQTT 5 event loop terminated");
                break;
            }
        }
    }
}

fn to_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::AtMostOnce,
        QoS::AtLeastOnce => QualityOfService::AtLeastOnce,
        QoS::ExactlyOnce => QualityOfService::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn session_parameters_land_in_connect_properties() {
        let client = Mqtt5Client::new("mqtts://broker.example:8883", None);
        let connect = GenericMqttConnect::clean_session("client-5")
            .with_session_expiry(Duration::from_secs(300))
            .with_receive_maximum(32);
        let options = client.options(&connect).unwrap();

        assert!(options.clean_start());
        let properties = options.connect_properties().unwrap();
        assert_eq!(properties.session_expiry_interval, Some(300));
        assert_eq!(properties.receive_maximum, Some(32));
    }

    #[test]
    fn no_connect_properties_without_session_parameters() {
        let client = Mqtt5Client::new("mqtt://broker.example:1883", None);
        let options = client
            .options(&GenericMqttConnect::new("client-5"))
            .unwrap();
        assert!(options.connect_properties().is_none());
    }
}
