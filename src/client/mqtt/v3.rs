//! MQTT 3.1.1 session backed by the rumqttc v4 client

use async_trait::async_trait;
use rumqttc::mqttbytes::v4::ConnectReturnCode;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::generic::{
    AckHook, GenericMqttClient, GenericMqttConnect, GenericMqttMessage, GenericMqttPublish,
    GenericMqttSubscribe, PendingPublish, PendingSubscribe, SessionShared, SubscriptionOutcome,
};
use super::{broker_endpoint, EVENT_CHANNEL_CAPACITY};
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{Credentials, QualityOfService};

pub struct Mqtt3Client {
    broker_uri: String,
    credentials: Option<Credentials>,
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
}

impl Mqtt3Client {
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
        options.set_clean_session(connect.clean_session);
        if let Some(Credentials::UserPassword { username, password }) = &self.credentials {
            options.set_credentials(username, password);
        }
        // session expiry and receive maximum have no 3.1.1 wire representation
        if connect.session_expiry.is_some() || connect.receive_maximum.is_some() {
            debug!("session expiry / receive maximum not expressible in MQTT 3.1.1, ignored");
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
impl GenericMqttClient for Mqtt3Client {
    async fn connect(&mut self, connect: GenericMqttConnect) -> ConnectivityResult<()> {
        let options = self.options(&connect)?;
        let (client, mut event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        // only a ConnAck counts as connected, not just a working socket
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(ConnectivityError::transport(format!(
                        "broker refused MQTT 3.1.1 session: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(error) => {
                    return Err(ConnectivityError::transport(format!(
                        "MQTT 3.1.1 connect failed: {error}"
                    )))
                }
            }
        }

        info!(broker = %self.broker_uri, "MQTT 3.1.1 session established");
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
        if publish.correlation_id.is_some() {
            debug!(topic = %publish.topic, "correlation data not expressible in MQTT 3.1.1, dropped");
        }
        let client = self.session()?;
        self.shared.enqueue_publish_topic(&publish.topic);
        let result = client
            .publish(
                publish.topic,
                to_qos(publish.qos),
                publish.retain,
                publish.payload,
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
        let filters: Vec<SubscribeFilter> = subscribe
            .subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic_filter.clone(), to_qos(s.qos)))
            .collect();

        // registered before the wire call so the SubAck finds it waiting
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
                let message = GenericMqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: from_qos(publish.qos),
                    retain: publish.retain,
                    correlation_id: None,
                };
                shared.forward_inbound(message).await;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let results = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        rumqttc::mqttbytes::v4::SubscribeReasonCode::Success(qos) => {
                            Ok(from_qos(*qos))
                        }
                        rumqttc::mqttbytes::v4::SubscribeReasonCode::Failure => {
                            Err("broker rejected the subscription".to_string())
                        }
                    })
                    .collect();
                shared.resolve_subscribe(results);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.settle_publish(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => shared.settle_publish(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.track_publish(pkid),
            Ok(_) => {}
            Err(error) => {
                // no transport-level retry here; the lifecycle owner decides
                warn!(%error, "MQTT 3.1.1 event loop terminated");
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

    #[test]
    fn qos_mapping_is_lossless() {
        for qos in [
            QualityOfService::AtMostOnce,
            QualityOfService::AtLeastOnce,
            QualityOfService::ExactlyOnce,
        ] {
            assert_eq!(from_qos(to_qos(qos)), qos);
        }
    }

    #[test]
    fn options_reflect_clean_session_and_credentials() {
        let client = Mqtt3Client::new(
            "mqtt://broker.example:1883",
            Some(Credentials::UserPassword {
                username: "twin".to_string(),
                password: "secret".to_string(),
            }),
        );
        let options = client
            .options(&GenericMqttConnect::clean_session("client-1"))
            .unwrap();
        assert!(options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("twin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn publish_without_session_is_a_transport_error() {
        let client = Mqtt3Client::new("mqtt://broker.example:1883", None);
        assert!(client.session().is_err());
    }
}
