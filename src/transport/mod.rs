//! # HTTP Transport
//!
//! The transport collaborator boundary: the engine hands over a fully
//! interpolated request and gets back status, headers, body and timing. The
//! transport never interprets variables.
//!
//! The production implementation wraps a shared `reqwest` client (connection
//! pool reuse); requests carrying client-certificate material get a
//! dedicated client, cached per certificate pair. Tests swap in
//! [`testing::StaticTransport`].

use crate::errors::ErrorCode;
use crate::protocol::{CertificateConfig, JsonMap};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// A request ready for the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    /// Header values, already interpolated.
    pub headers: JsonMap,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub certificate: Option<CertificateConfig>,
}

/// What came back.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status_code: u16,
    pub headers: JsonMap,
    /// Parsed JSON body, or the raw text under `Value::String`, or `Null`
    /// for an empty body.
    pub body: Value,
    pub duration_ms: u64,
}

/// Transport failures, classified for retry-compatible error codes.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {timeout_ms}ms: {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("connection failed for {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("TLS failure for {url}: {reason}")]
    Tls { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::TRANSPORT_TIMEOUT,
            Self::Connection { .. } => ErrorCode::CONNECTION_FAILED,
            Self::Tls { .. } => ErrorCode::TLS_FAILED,
            Self::InvalidRequest { .. } => ErrorCode::INVALID_REQUEST,
        }
    }
}

/// The transport contract the execution core depends on.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        step_name: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError>;
}

// ============================================================================
// REQWEST IMPLEMENTATION
// ============================================================================

/// Production transport over `reqwest` with rustls.
pub struct ReqwestTransport {
    client: Client,
    /// Clients built for client-certificate requests, keyed by cert path
    /// pair.
    cert_clients: Mutex<HashMap<String, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            cert_clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, certificate: Option<&CertificateConfig>) -> Result<Client, TransportError> {
        let cert = match certificate {
            Some(cert) => cert,
            None => return Ok(self.client.clone()),
        };
        let key = format!("{}|{}", cert.cert_file, cert.key_file);
        {
            let cache = self.cert_clients.lock().expect("cert client cache");
            if let Some(client) = cache.get(&key) {
                return Ok(client.clone());
            }
        }

        let mut pem = std::fs::read(&cert.cert_file).map_err(|e| TransportError::Tls {
            url: cert.cert_file.clone(),
            reason: format!("cannot read certificate: {e}"),
        })?;
        let key_material = std::fs::read(&cert.key_file).map_err(|e| TransportError::Tls {
            url: cert.key_file.clone(),
            reason: format!("cannot read private key: {e}"),
        })?;
        pem.extend_from_slice(&key_material);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| TransportError::Tls {
            url: cert.cert_file.clone(),
            reason: format!("invalid client certificate: {e}"),
        })?;
        let client = Client::builder()
            .identity(identity)
            .use_rustls_tls()
            .build()
            .map_err(|e| TransportError::Tls {
                url: cert.cert_file.clone(),
                reason: format!("cannot build TLS client: {e}"),
            })?;

        let mut cache = self.cert_clients.lock().expect("cert client cache");
        cache.insert(key, client.clone());
        Ok(client)
    }

    fn classify(url: &str, timeout_ms: u64, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            return TransportError::Timeout {
                url: url.to_string(),
                timeout_ms,
            };
        }
        let chain = format!("{error:#}");
        if error.is_connect() {
            if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake")
            {
                return TransportError::Tls {
                    url: url.to_string(),
                    reason: chain,
                };
            }
            return TransportError::Connection {
                url: url.to_string(),
                reason: chain,
            };
        }
        if error.is_builder() || error.is_request() {
            return TransportError::InvalidRequest { reason: chain };
        }
        TransportError::Connection {
            url: url.to_string(),
            reason: chain,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[tracing::instrument(name = "http_request", skip_all, fields(step = %step_name, http.method = %request.method, http.url = %request.url))]
    async fn execute(
        &self,
        step_name: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            TransportError::InvalidRequest {
                reason: format!("invalid HTTP method '{}': {e}", request.method),
            }
        })?;

        let client = self.client_for(request.certificate.as_ref())?;
        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            builder = builder.header(name, rendered);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let start = Instant::now();
        let timeout_ms = request.timeout.as_millis() as u64;
        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(&request.url, timeout_ms, e))?;
        let status_code = response.status().as_u16();

        let mut headers = JsonMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), Value::String(text.to_string()));
            }
        }

        let raw_body = response
            .text()
            .await
            .map_err(|e| Self::classify(&request.url, timeout_ms, e))?;
        let body = parse_body(&raw_body);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(status = status_code, duration_ms, "request completed");
        Ok(TransportResponse {
            status_code,
            headers,
            body,
            duration_ms,
        })
    }
}

/// Parse a response body: JSON when it is JSON, raw text otherwise, `Null`
/// when empty.
pub fn parse_body(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ============================================================================
// TEST DOUBLE
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    struct Rule {
        url_contains: String,
        once: bool,
        result: Result<TransportResponse, TransportError>,
    }

    /// Scripted transport for tests: rules match on a URL substring, in
    /// registration order; `once` rules are consumed.
    pub struct StaticTransport {
        rules: Mutex<Vec<Rule>>,
        pub seen: Mutex<Vec<TransportRequest>>,
    }

    impl StaticTransport {
        pub fn new() -> Self {
            Self {
                rules: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(self, url_contains: &str, status: u16, body: Value) -> Self {
            self.push(url_contains, false, Ok(response(status, body)));
            self
        }

        pub fn respond_once(self, url_contains: &str, status: u16, body: Value) -> Self {
            self.push(url_contains, true, Ok(response(status, body)));
            self
        }

        pub fn fail_once(self, url_contains: &str, error: TransportError) -> Self {
            self.push(url_contains, true, Err(error));
            self
        }

        pub fn fail(self, url_contains: &str, error: TransportError) -> Self {
            self.push(url_contains, false, Err(error));
            self
        }

        fn push(&self, url_contains: &str, once: bool, result: Result<TransportResponse, TransportError>) {
            self.rules.lock().unwrap().push(Rule {
                url_contains: url_contains.to_string(),
                once,
                result,
            });
        }

        pub fn request_count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        pub fn requests(&self) -> Vec<TransportRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    pub fn response(status: u16, body: Value) -> TransportResponse {
        let mut headers = JsonMap::new();
        headers.insert(
            "content-type".to_string(),
            Value::String("application/json".to_string()),
        );
        TransportResponse {
            status_code: status,
            headers,
            body,
            duration_ms: 3,
        }
    }

    #[async_trait]
    impl HttpTransport for StaticTransport {
        async fn execute(
            &self,
            _step_name: &str,
            request: &TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            let mut rules = self.rules.lock().unwrap();
            let position = rules
                .iter()
                .position(|r| request.url.contains(&r.url_contains));
            match position {
                Some(i) => {
                    let result = rules[i].result.clone();
                    if rules[i].once {
                        rules.remove(i);
                    }
                    result
                }
                None => Err(TransportError::Connection {
                    url: request.url.clone(),
                    reason: "no scripted response".to_string(),
                }),
            }
        }
    }
}
