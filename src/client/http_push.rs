//! HTTP push protocol client
//!
//! Outbound only: every selected target becomes an HTTP request against the
//! connection's base URI. A target address is `METHOD:path` (the method
//! defaults to POST when absent). The HTTP response is the broker
//! acknowledgement, so nothing ever stays pending here.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::{Connection, Credentials};
use crate::monitoring::MonitorRegistry;
use crate::routing::{OutboundSignal, PayloadMapper};

use super::{select_targets, ClientContext, ProtocolClient, PublishToken};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpPushClient {
    connection: Connection,
    registry: Arc<MonitorRegistry>,
    mapper: Arc<dyn PayloadMapper>,
    client: Option<Client>,
    base_uri: Option<Url>,
}

impl HttpPushClient {
    pub fn new(context: ClientContext) -> Self {
        Self {
            connection: context.connection,
            registry: context.registry,
            mapper: context.mapper,
            client: None,
            base_uri: None,
        }
    }

    fn request_parts(&self, address: &str) -> ConnectivityResult<(Method, Url)> {
        let (method, path) = match address.split_once(':') {
            Some((method, path)) => {
                let method = match method.to_ascii_uppercase().as_str() {
                    "GET" => Method::GET,
                    "POST" => Method::POST,
                    "PUT" => Method::PUT,
                    "PATCH" => Method::PATCH,
                    "DELETE" => Method::DELETE,
                    _ => {
                        return Err(ConnectivityError::configuration(format!(
                            "invalid HTTP method in target address: {address}"
                        )))
                    }
                };
                (method, path)
            }
            None => (Method::POST, address),
        };
        let base = self
            .base_uri
            .as_ref()
            .ok_or_else(|| ConnectivityError::transport("http client not connected"))?;
        let url = base.join(path.trim_start_matches('/')).map_err(|_| {
            ConnectivityError::configuration(format!("invalid target path: {path}"))
        })?;
        Ok((method, url))
    }

    async fn push(&self, signal: &OutboundSignal, address: &str) -> ConnectivityResult<()> {
        let (method, url) = self.request_parts(address)?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectivityError::transport("http client not connected"))?;

        let payload = self.mapper.map_outbound(signal)?;
        let mut request = client.request(method, url).body(payload.to_vec());
        if let Some(content_type) = &signal.content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(correlation_id) = &signal.correlation_id {
            request = request.header("correlation-id", correlation_id);
        }
        if let Some(Credentials::UserPassword { username, password }) =
            self.connection.credentials()
        {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectivityError::transport(format!("http push failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ConnectivityError::transport(format!(
                "http push rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for HttpPushClient {
    async fn connect(&mut self) -> ConnectivityResult<()> {
        if !self.connection.sources().is_empty() {
            return Err(ConnectivityError::configuration(
                "http-push connections cannot declare sources",
            ));
        }
        let base_uri = Url::parse(self.connection.uri()).map_err(|_| {
            ConnectivityError::configuration(format!(
                "invalid base URI: {}",
                self.connection.uri()
            ))
        })?;

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!self.connection.validate_certificates())
            .build()
            .map_err(|e| ConnectivityError::transport(format!("http client setup: {e}")))?;

        self.base_uri = Some(base_uri);
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self, _drain: Duration) -> ConnectivityResult<()> {
        self.client = None;
        self.base_uri = None;
        Ok(())
    }

    async fn publish_signal(&self, signal: OutboundSignal) -> ConnectivityResult<()> {
        let id = self.connection.id();
        if signal.is_response {
            self.registry.for_response_dispatched(id).record();
            match self.push(&signal, &signal.topic).await {
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
            match self.push(&signal, &target.address).await {
                Ok(()) => {
                    self.registry
                        .for_outbound_published(id, &target.address)
                        .record();
                    // the HTTP response is the acknowledgement
                    self.registry
                        .for_outbound_acknowledged(id, &target.address)
                        .record();
                }
                Err(error) => {
                    warn!(
                        connection_id = %id,
                        target = %target.address,
                        %error,
                        "http push to target failed"
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
    use crate::model::{ConnectionId, ConnectionType, ConnectivityStatus, QualityOfService, Source, Target};
    use crate::routing::{IdentityMapper, InboundDispatcher};
    use crate::testing::RecordingDispatcher;

    fn http_context(connection: Connection) -> ClientContext {
        ClientContext {
            connection,
            registry: Arc::new(MonitorRegistry::new()),
            mapper: Arc::new(IdentityMapper),
            dispatcher: Arc::new(RecordingDispatcher::default()) as Arc<dyn InboundDispatcher>,
            headers: Default::default(),
        }
    }

    fn http_connection() -> Connection {
        Connection::builder(
            ConnectionId::new("push-1"),
            ConnectionType::HttpPush,
            ConnectivityStatus::Open,
            "https://sink.example/api/",
        )
        .targets(vec![Target::new("POST:/telemetry").with_topics(["twin/events"])])
        .build()
    }

    #[tokio::test]
    async fn sources_are_rejected_at_connect() {
        let connection = http_connection()
            .rebuild()
            .sources(vec![Source::new(["inbox"], QualityOfService::AtLeastOnce)])
            .build();
        let mut client = HttpPushClient::new(http_context(connection));

        let error = client.connect().await.unwrap_err();
        assert!(matches!(error, ConnectivityError::Configuration { .. }));
    }

    #[tokio::test]
    async fn target_addresses_parse_method_and_path() {
        let mut client = HttpPushClient::new(http_context(http_connection()));
        client.connect().await.unwrap();

        let (method, url) = client.request_parts("POST:/telemetry").unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(url.as_str(), "https://sink.example/api/telemetry");

        let (method, _) = client.request_parts("PUT:/state").unwrap();
        assert_eq!(method, Method::PUT);

        // method defaults to POST
        let (method, _) = client.request_parts("/events").unwrap();
        assert_eq!(method, Method::POST);

        assert!(client.request_parts("FETCH:/nope").is_err());
    }

    #[tokio::test]
    async fn invalid_base_uri_is_a_configuration_error() {
        let connection = http_connection().rebuild().uri("not a uri").build();
        let mut client = HttpPushClient::new(http_context(connection));
        let error = client.connect().await.unwrap_err();
        assert!(matches!(error, ConnectivityError::Configuration { .. }));
    }
}
