//! MQTT transport for change messages.
//!
//! Envelopes travel CBOR-encoded on the tenant's change topic at QoS 1.
//! Acknowledgement is manual: the runtime acks a publish only once the
//! applier has finished with it.

use docsync_proto::{Envelope, Publisher, TopicScheme, TransportError};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Publish, QoS};
use std::time::Duration;
use url::Url;

/// MQTT connection for one instance.
pub struct MqttTransport {
    client: AsyncClient,
    topic_scheme: TopicScheme,
}

impl MqttTransport {
    /// Create a new transport.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
    ) -> Result<(Self, EventLoop), MqttError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_manual_acks(true);
        mqtt_options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                topic_scheme,
            },
            eventloop,
        ))
    }

    /// The topic scheme in use.
    #[must_use]
    pub fn topic_scheme(&self) -> &TopicScheme {
        &self.topic_scheme
    }

    /// Subscribe to the tenant's change topic.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe(&self) -> Result<(), MqttError> {
        let topic = self.topic_scheme.changes();

        tracing::info!(topic, "Subscribing to change topic");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))?;

        Ok(())
    }

    /// Acknowledge a handled publish.
    ///
    /// # Errors
    ///
    /// Returns error if the ack cannot be queued.
    pub async fn ack(&self, publish: &Publish) -> Result<(), MqttError> {
        self.client
            .ack(publish)
            .await
            .map_err(|e| MqttError::Ack(e.to_string()))
    }

    /// A publisher sending on the change topic.
    #[must_use]
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            topic: self.topic_scheme.changes(),
        }
    }
}

/// [`Publisher`] over an MQTT client.
///
/// Publishing only queues the message for the event loop, so it is safe to
/// call from a store commit hook.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
}

impl Publisher for MqttPublisher {
    fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        let payload = envelope
            .to_cbor()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        tracing::debug!(
            topic = %self.topic,
            payload_len = payload.len(),
            "Publishing change"
        );

        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

/// Parse MQTT URL into host and port.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), MqttError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| MqttError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let (host, port) = match input.split_once(':') {
        None => (input, None),
        Some((host, port)) => (host, Some(port)),
    };
    if host.is_empty() {
        return Err(MqttError::InvalidBrokerUrl(format!("{input}: missing host")));
    }
    let port = match port {
        None => 1883,
        Some(port) if port.contains(':') => {
            return Err(MqttError::InvalidBrokerUrl(format!(
                "{input}: too many ':' separators"
            )));
        }
        Some(port) => port
            .parse()
            .map_err(|_| MqttError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'")))?,
    };

    Ok((host.to_string(), port))
}

/// Errors for MQTT operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Acknowledgement failed
    #[error("ack error: {0}")]
    Ack(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_urls() {
        assert_eq!(
            parse_mqtt_url("tcp://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_mqtt_url("mqtt://broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("localhost:1999").unwrap(),
            ("localhost".to_string(), 1999)
        );
        assert_eq!(
            parse_mqtt_url("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
    }

    #[test]
    fn bad_broker_urls() {
        assert!(parse_mqtt_url("ws://broker:80").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
        assert!(parse_mqtt_url("host:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
    }

    #[test]
    fn publisher_queues_without_broker() {
        let (transport, _eventloop) =
            MqttTransport::new("tcp://localhost:1883", "test-client", TopicScheme::new("t")).unwrap();
        let publisher = transport.publisher();
        assert!(publisher
            .publish(Envelope::new().with_property("k", "v"))
            .is_ok());
        tokio_test::block_on(transport.subscribe()).unwrap();
    }
}
