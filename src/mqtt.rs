//! MQTT broker session
//!
//! Wraps one rumqttc client per process: connect/reconnect handling,
//! subscription fan-out for the smartreader topic set, and thread-safe
//! publishing with a bounded acknowledgment wait. The session never inspects
//! message contents; inbound messages are forwarded to the router channel.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::GatewayError;
use crate::pump::CommandPublisher;

/// Session connection phases
const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// Topic suffixes the session subscribes to, scoped by `smartreader/+/`
pub const SUBSCRIBED_SUFFIXES: [&str; 6] = [
    "manageResult",
    "controlResult",
    "tagEvents",
    "event",
    "metrics",
    "lwt",
];

/// Capacity of the channel feeding the inbound router
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the internal rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Incoming message from the broker, routed by the Inbound Router
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Snapshot of session health for the diagnostics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub connection_state: &'static str,
    pub broker: String,
    pub port: u16,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub publish_attempts: u64,
    pub successful_publishes: u64,
}

/// Certificate verifier that accepts any certificate, used when hostname
/// verification is disabled for brokers with self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Process-wide broker session. Created once at startup and shared by
/// reference; workers must not open ad hoc connections for single publishes.
pub struct BrokerSession {
    config: MqttConfig,
    state: AtomicU8,
    client: RwLock<Option<AsyncClient>>,
    inbound_tx: mpsc::Sender<IncomingMessage>,
    /// Serializes the publish path; one publish in flight per process
    publish_lock: Mutex<()>,
    /// Counter of publish completions (PUBACK for QoS 1, PUBCOMP for QoS 2)
    /// seen by the event loop. Publishes are serialized, so the next
    /// completion after a publish belongs to that publish.
    acked: watch::Sender<u64>,
    last_connect_time: RwLock<Option<DateTime<Utc>>>,
    reconnect_count: AtomicU32,
    publish_attempts: AtomicU64,
    successful_publishes: AtomicU64,
}

impl BrokerSession {
    /// Create the session and the inbound channel consumed by the router
    pub fn new(config: MqttConfig) -> (Arc<Self>, mpsc::Receiver<IncomingMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (acked, _) = watch::channel(0u64);

        let session = Arc::new(Self {
            config,
            state: AtomicU8::new(STATE_DISCONNECTED),
            client: RwLock::new(None),
            inbound_tx,
            publish_lock: Mutex::new(()),
            acked,
            last_connect_time: RwLock::new(None),
            reconnect_count: AtomicU32::new(0),
            publish_attempts: AtomicU64::new(0),
            successful_publishes: AtomicU64::new(0),
        });

        (session, inbound_rx)
    }

    /// Open the broker connection and start the network loop in the
    /// background. A second caller while a connection attempt is in progress
    /// is rejected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        match self.state.compare_exchange(
            STATE_DISCONNECTED,
            STATE_CONNECTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_CONNECTING) => return Err(GatewayError::ConnectInProgress),
            Err(_) => return Ok(()), // already connected
        }

        info!(
            "Connecting to MQTT broker at {}:{} (tls: {})",
            self.config.broker, self.config.port, self.config.use_tls
        );

        let client_id = format!("smartreader-gateway-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &self.config.broker, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs));

        if let (Some(username), Some(password)) =
            (&self.config.username, &self.config.password)
        {
            options.set_credentials(username, password);
        }

        if self.config.use_tls {
            let transport = self.transport().map_err(|e| {
                self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                e
            })?;
            options.set_transport(transport);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *self.client.write().await = Some(client.clone());

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run_event_loop(client, eventloop).await;
        });

        Ok(())
    }

    /// Build the TLS transport from configuration
    fn transport(&self) -> Result<Transport, GatewayError> {
        if !self.config.verify_hostname {
            // Self-signed or mismatched broker certificates: skip
            // verification entirely.
            warn!("TLS hostname verification is disabled");
            let builder = match self.config.tls_version.as_deref() {
                Some("1.2") => ClientConfig::builder_with_protocol_versions(&[
                    &rustls::version::TLS12,
                ]),
                Some("1.3") => ClientConfig::builder_with_protocol_versions(&[
                    &rustls::version::TLS13,
                ]),
                _ => ClientConfig::builder(),
            };
            let tls = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            return Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(tls),
            )));
        }

        let ca_path = self.config.ca_certs.as_ref().ok_or_else(|| {
            GatewayError::Config("MQTT_CA_CERTS is required when MQTT_USE_TLS is set".to_string())
        })?;
        let ca = fs::read(ca_path)
            .map_err(|e| GatewayError::Config(format!("Failed to read CA file {ca_path}: {e}")))?;

        let client_auth = match (&self.config.certfile, &self.config.keyfile) {
            (Some(cert), Some(key)) => {
                let cert_pem = fs::read(cert).map_err(|e| {
                    GatewayError::Config(format!("Failed to read client cert {cert}: {e}"))
                })?;
                let key_pem = fs::read(key).map_err(|e| {
                    GatewayError::Config(format!("Failed to read client key {key}: {e}"))
                })?;
                Some((cert_pem, key_pem))
            }
            _ => None,
        };

        Ok(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }

    /// Drive the rumqttc event loop: forward publishes to the router, count
    /// acks, resubscribe on every (re)connect, and back off on errors up to
    /// the configured attempt cap.
    async fn run_event_loop(self: Arc<Self>, client: AsyncClient, mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    if connack.code != ConnectReturnCode::Success {
                        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                        error!("MQTT connection rejected: {:?}", connack.code);
                        continue;
                    }

                    self.state.store(STATE_CONNECTED, Ordering::SeqCst);
                    *self.last_connect_time.write().await = Some(Utc::now());
                    self.reconnect_count.store(0, Ordering::SeqCst);
                    info!("Connected to MQTT broker");

                    // The broker drops subscriptions for clean sessions, so
                    // the subscription set is replayed on every reconnect.
                    self.resubscribe(&client).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = IncomingMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if self.inbound_tx.send(message).await.is_err() {
                        warn!("Inbound channel closed; dropping message");
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    self.acked.send_modify(|n| *n += 1);
                }
                // QoS 2 publishes complete with PUBCOMP, not PUBACK
                Ok(Event::Incoming(Packet::PubComp(_))) => {
                    self.acked.send_modify(|n| *n += 1);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    let attempts = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;

                    if attempts > self.config.max_reconnect_attempts {
                        error!(
                            "MQTT connection lost ({e}); max reconnect attempts ({}) reached, \
                             an explicit connect() is required to resume",
                            self.config.max_reconnect_attempts
                        );
                        break;
                    }

                    warn!(
                        "MQTT connection error ({e}); reconnect attempt {attempts}/{} in {}s",
                        self.config.max_reconnect_attempts, self.config.reconnect_delay_secs
                    );
                    self.state.store(STATE_CONNECTING, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay_secs))
                        .await;
                }
            }
        }

        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        *self.client.write().await = None;
    }

    async fn resubscribe(&self, client: &AsyncClient) {
        for suffix in SUBSCRIBED_SUFFIXES {
            let topic = format!("smartreader/+/{suffix}");
            match client.subscribe(&topic, self.qos()).await {
                Ok(()) => debug!("Subscribed to {topic}"),
                Err(e) => error!("Failed to subscribe to {topic}: {e}"),
            }
        }
    }

    /// Publish a JSON payload and wait for broker acknowledgment up to the
    /// configured timeout. Safe to call from any worker; publishes are
    /// serialized internally.
    pub async fn publish(&self, topic: &str, payload: &Value) -> Result<(), GatewayError> {
        let _guard = self.publish_lock.lock().await;
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if self.state.load(Ordering::SeqCst) != STATE_CONNECTED {
            return Err(GatewayError::NotConnected);
        }

        let body = serde_json::to_vec(payload)?;
        if body.len() > self.config.max_message_size {
            return Err(GatewayError::Mqtt(format!(
                "message size {} exceeds maximum {}",
                body.len(),
                self.config.max_message_size
            )));
        }

        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NotConnected)?;

        let qos = self.qos();
        let deadline = Instant::now() + Duration::from_secs(self.config.publish_ack_timeout_secs);

        let mut ack_rx = self.acked.subscribe();
        let acked_before = *ack_rx.borrow_and_update();

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        tokio::time::timeout(remaining, client.publish(topic, qos, self.config.retain, body))
            .await
            .map_err(|_| GatewayError::PublishTimeout)?
            .map_err(|e| GatewayError::Mqtt(e.to_string()))?;

        // QoS 0 has no acknowledgment to wait for
        if qos != QoS::AtMostOnce {
            loop {
                if *ack_rx.borrow_and_update() > acked_before {
                    break;
                }
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .ok_or(GatewayError::PublishTimeout)?;
                match tokio::time::timeout(remaining, ack_rx.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => {
                        return Err(GatewayError::Mqtt("session event loop stopped".to_string()))
                    }
                    Err(_) => return Err(GatewayError::PublishTimeout),
                }
            }
        }

        self.successful_publishes.fetch_add(1, Ordering::SeqCst);
        debug!("Published message to {topic}");
        Ok(())
    }

    /// Connection state, connect time and publish counters
    pub async fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            connection_state: self.state_name(),
            broker: self.config.broker.clone(),
            port: self.config.port,
            last_connect_time: *self.last_connect_time.read().await,
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
            publish_attempts: self.publish_attempts.load(Ordering::SeqCst),
            successful_publishes: self.successful_publishes.load(Ordering::SeqCst),
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => "CONNECTING",
            STATE_CONNECTED => "CONNECTED",
            _ => "DISCONNECTED",
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    fn qos(&self) -> QoS {
        match self.config.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Disconnect cleanly at shutdown
    pub async fn disconnect(&self) {
        if let Some(client) = self.client.read().await.clone() {
            if let Err(e) = client.disconnect().await {
                warn!("Error disconnecting MQTT: {e}");
            }
        }
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        info!("MQTT disconnected");
    }
}

#[async_trait]
impl CommandPublisher for BrokerSession {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), GatewayError> {
        BrokerSession::publish(self, topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Arc<BrokerSession> {
        let (session, _rx) = BrokerSession::new(MqttConfig::default());
        session
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let session = session();
        assert_eq!(session.state_name(), "DISCONNECTED");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        let session = session();
        let err = session
            .publish("smartreader/S1/control", &json!({"command": "start"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));

        let diag = session.diagnostics().await;
        assert_eq!(diag.publish_attempts, 1);
        assert_eq!(diag.successful_publishes, 0);
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting_is_rejected() {
        let session = session();
        session.state.store(STATE_CONNECTING, Ordering::SeqCst);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectInProgress));
    }

    #[tokio::test]
    async fn test_oversize_message_is_rejected() {
        let (session, _rx) = BrokerSession::new(MqttConfig {
            max_message_size: 8,
            ..MqttConfig::default()
        });
        session.state.store(STATE_CONNECTED, Ordering::SeqCst);
        let err = session
            .publish("smartreader/S1/control", &json!({"command": "start"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_subscription_set() {
        assert_eq!(SUBSCRIBED_SUFFIXES.len(), 6);
        for suffix in ["manageResult", "controlResult", "tagEvents", "event", "metrics", "lwt"] {
            assert!(SUBSCRIBED_SUFFIXES.contains(&suffix));
        }
    }

    /// Hand the session a client whose event loop is never polled, so
    /// publish() can be driven without a broker.
    async fn connected_session(config: MqttConfig) -> (Arc<BrokerSession>, rumqttc::EventLoop) {
        let (session, _rx) = BrokerSession::new(config);
        let options = MqttOptions::new("test", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, 8);
        *session.client.write().await = Some(client);
        session.state.store(STATE_CONNECTED, Ordering::SeqCst);
        (session, eventloop)
    }

    #[tokio::test]
    async fn test_qos2_publish_completes_on_pubcomp() {
        let (session, _eventloop) = connected_session(MqttConfig {
            qos: 2,
            publish_ack_timeout_secs: 5,
            ..MqttConfig::default()
        })
        .await;

        // Stand in for the event loop observing the PUBCOMP
        let acker = Arc::clone(&session);
        let ack_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            acker.acked.send_modify(|n| *n += 1);
        });

        session
            .publish("smartreader/S1/control", &json!({"command": "start"}))
            .await
            .unwrap();
        ack_task.await.unwrap();

        let diag = session.diagnostics().await;
        assert_eq!(diag.publish_attempts, 1);
        assert_eq!(diag.successful_publishes, 1);
    }

    #[tokio::test]
    async fn test_qos2_publish_times_out_without_completion() {
        let (session, _eventloop) = connected_session(MqttConfig {
            qos: 2,
            publish_ack_timeout_secs: 0,
            ..MqttConfig::default()
        })
        .await;

        let err = session
            .publish("smartreader/S1/control", &json!({"command": "start"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PublishTimeout));

        let diag = session.diagnostics().await;
        assert_eq!(diag.publish_attempts, 1);
        assert_eq!(diag.successful_publishes, 0);
    }

    #[test]
    fn test_qos_mapping() {
        let (session, _rx) = BrokerSession::new(MqttConfig { qos: 0, ..MqttConfig::default() });
        assert_eq!(session.qos(), QoS::AtMostOnce);
        let (session, _rx) = BrokerSession::new(MqttConfig { qos: 1, ..MqttConfig::default() });
        assert_eq!(session.qos(), QoS::AtLeastOnce);
        let (session, _rx) = BrokerSession::new(MqttConfig { qos: 2, ..MqttConfig::default() });
        assert_eq!(session.qos(), QoS::ExactlyOnce);
    }
}
