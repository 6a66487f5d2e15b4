//! Destinations a batch of records can be delivered to.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use trail_core::config::{Destination, FollowerConfig, GatewayConfig, LokiConfig};
use trail_core::record::parse_timestamp;
use trail_core::wire::{IngestBatch, IngestResponse, Rejection, ShipRecord};
use trail_core::DeliveryError;

use crate::error::ShipError;

/// What the destination acknowledged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub accepted: usize,
    /// Records the destination refused individually. The batch as a whole
    /// still counts as delivered.
    pub rejected: Vec<Rejection>,
}

impl DeliveryReceipt {
    pub fn all(accepted: usize) -> Self {
        Self {
            accepted,
            rejected: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, records: &[ShipRecord]) -> Result<DeliveryReceipt, DeliveryError>;
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ShipError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .map_err(|e| ShipError::Config(format!("http client: {e}")))
}

fn classify(err: reqwest::Error, timeout: Duration) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout(timeout)
    } else {
        DeliveryError::NetworkError(err.to_string())
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn failure(response: reqwest::Response) -> DeliveryError {
    let status = response.status().as_u16();
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    match DeliveryError::from_status(status, body) {
        DeliveryError::RateLimited { .. } => DeliveryError::RateLimited { retry_after: hint },
        other => other,
    }
}

/// Posts [`IngestBatch`] bodies to an HTTP endpoint, typically the gateway.
pub struct GenericSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl GenericSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ShipError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sink for GenericSink {
    fn name(&self) -> &str {
        "generic"
    }

    async fn deliver(&self, records: &[ShipRecord]) -> Result<DeliveryReceipt, DeliveryError> {
        let batch = IngestBatch::new(records.to_vec());
        let response = self
            .client
            .post(&self.url)
            .json(&batch)
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        let body = response.text().await.map_err(|e| classify(e, self.timeout))?;
        // Collectors other than the gateway may answer with anything.
        match serde_json::from_str::<IngestResponse>(&body) {
            Ok(ack) => {
                if !ack.rejected.is_empty() {
                    warn!(
                        batch_id = %ack.batch_id,
                        rejected = ack.rejected.len(),
                        "collector rejected part of a batch"
                    );
                }
                Ok(DeliveryReceipt {
                    accepted: ack.accepted,
                    rejected: ack.rejected,
                })
            }
            Err(_) => Ok(DeliveryReceipt::all(records.len())),
        }
    }
}

#[derive(Serialize)]
struct LokiPush {
    streams: Vec<LokiStream>,
}

#[derive(Serialize)]
struct LokiStream {
    stream: BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

/// Pushes records to Loki's `/loki/api/v1/push`, one stream per
/// session and direction.
pub struct LokiSink {
    client: reqwest::Client,
    push_url: String,
    job: String,
    host: String,
    labels: BTreeMap<String, String>,
    auth_token: Option<SecretString>,
    timeout: Duration,
}

impl LokiSink {
    pub fn new(config: &LokiConfig, host: impl Into<String>, timeout: Duration) -> Result<Self, ShipError> {
        Ok(Self {
            client: build_client(timeout)?,
            push_url: config.push_url(),
            job: config.job.clone(),
            host: host.into(),
            labels: config.labels.clone(),
            auth_token: config.auth_token.clone().map(SecretString::from),
            timeout,
        })
    }

    fn body(&self, records: &[ShipRecord]) -> Result<LokiPush, DeliveryError> {
        let mut streams: BTreeMap<(String, String), Vec<[String; 2]>> = BTreeMap::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| DeliveryError::InvalidPayload(e.to_string()))?;
            let nanos = parse_timestamp(&record.ts)
                .and_then(|t| t.timestamp_nanos_opt())
                .ok_or_else(|| DeliveryError::InvalidPayload(format!("bad timestamp on {}", record.key())))?;
            streams
                .entry((record.session_id.to_string(), record.dir.to_string()))
                .or_default()
                .push([nanos.to_string(), line]);
        }
        let streams = streams
            .into_iter()
            .map(|((session_id, dir), values)| {
                let mut stream = self.labels.clone();
                stream.insert("job".to_string(), self.job.clone());
                stream.insert("host".to_string(), self.host.clone());
                stream.insert("session_id".to_string(), session_id);
                stream.insert("dir".to_string(), dir);
                LokiStream { stream, values }
            })
            .collect();
        Ok(LokiPush { streams })
    }
}

#[async_trait]
impl Sink for LokiSink {
    fn name(&self) -> &str {
        "loki"
    }

    async fn deliver(&self, records: &[ShipRecord]) -> Result<DeliveryReceipt, DeliveryError> {
        let body = self.body(records)?;
        let mut request = self.client.post(&self.push_url).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await.map_err(|e| classify(e, self.timeout))?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        debug!(streams = body.streams.len(), records = records.len(), "pushed to loki");
        Ok(DeliveryReceipt::all(records.len()))
    }
}

/// The sink `follower` settings point at.
pub fn sink_from_config(
    follower: &FollowerConfig,
    gateway: &GatewayConfig,
    loki: &LokiConfig,
    host: &str,
) -> Result<Arc<dyn Sink>, ShipError> {
    let timeout = Duration::from_secs(follower.timeout_secs.max(1));
    Ok(match follower.destination {
        Destination::Generic => Arc::new(GenericSink::new(follower.endpoint_url(gateway), timeout)?),
        Destination::Loki => Arc::new(LokiSink::new(loki, host, timeout)?),
    })
}
