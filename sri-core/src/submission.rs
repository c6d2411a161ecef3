//! SOAP client for the SRI reception and authorization web services.
pub mod envelope;
pub mod response;

use crate::access_key::AccessKey;
use crate::config::{Config, Endpoints, RetryPolicy, SubmissionStrategy};
use crate::document::sign::strip_declaration;
use crate::response_log::codes;
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, FixedOffset};
use envelope::{SoapOperation, SoapRequest, parse_wsdl, raw_envelope, typed_envelope};
use parking_lot::RwLock;
use quick_xml::se::SeError;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use response::{ResponseBody, ResponseError, SoapFault, SriMessage, format_messages};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while talking to the SRI.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not reach {url}: {message}")]
    Connection { url: String, message: String },
    #[error("SRI service unavailable (HTTP {status})")]
    Unavailable { status: u16, body: String },
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16, body: String },
    #[error("SOAP fault: {0}")]
    Fault(SoapFault),
    #[error(transparent)]
    InvalidResponse(#[from] ResponseError),
    #[error("typed binding unavailable: {0}")]
    BindingUnavailable(String),
    #[error("failed to build SOAP envelope: {0}")]
    Envelope(#[from] SeError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SubmissionError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubmissionError::Timeout { .. }
                | SubmissionError::Connection { .. }
                | SubmissionError::Unavailable { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SubmissionError::Timeout { .. })
    }

    /// Code recorded in the response log.
    pub fn response_code(&self) -> String {
        match self {
            SubmissionError::Timeout { .. } => codes::TIMEOUT.into(),
            SubmissionError::Connection { .. } | SubmissionError::Unavailable { .. } => {
                codes::SERVICE_UNAVAILABLE.into()
            }
            SubmissionError::HttpStatus { status, .. } => format!("HTTP_{status}"),
            SubmissionError::Fault(_) => codes::SOAP_FAULT.into(),
            _ => codes::CRITICAL.into(),
        }
    }

    /// Raw body received along with the failure, if any.
    pub fn payload(&self) -> &str {
        match self {
            SubmissionError::Unavailable { body, .. } | SubmissionError::HttpStatus { body, .. } => {
                body
            }
            _ => "",
        }
    }
}

/// A parsed outcome together with the raw SOAP body it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange<T> {
    pub outcome: T,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceptionOutcome {
    Accepted { messages: Vec<SriMessage> },
    Rejected { messages: Vec<SriMessage> },
}

impl ReceptionOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            ReceptionOutcome::Accepted { .. } => "RECIBIDA",
            ReceptionOutcome::Rejected { .. } => "DEVUELTA",
        }
    }

    pub fn messages(&self) -> &[SriMessage] {
        match self {
            ReceptionOutcome::Accepted { messages } | ReceptionOutcome::Rejected { messages } => {
                messages
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Authorized {
        number: String,
        authorized_at: Option<DateTime<FixedOffset>>,
        messages: Vec<SriMessage>,
    },
    Rejected {
        messages: Vec<SriMessage>,
    },
    /// Not yet decided. `state` is whatever the SRI reported, if anything.
    Pending {
        state: Option<String>,
    },
}

impl AuthorizationOutcome {
    pub fn code(&self) -> &str {
        match self {
            AuthorizationOutcome::Authorized { .. } => "AUTORIZADO",
            AuthorizationOutcome::Rejected { .. } => "NO AUTORIZ",
            AuthorizationOutcome::Pending { state } => state.as_deref().unwrap_or("PENDIENTE"),
        }
    }

    pub fn message(&self) -> String {
        match self {
            AuthorizationOutcome::Authorized { number, .. } => {
                format!("Autorizado con numero {number}")
            }
            AuthorizationOutcome::Rejected { messages } => format_messages(messages),
            AuthorizationOutcome::Pending { .. } => "Autorizacion pendiente".into(),
        }
    }
}

/// Reachability of both services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub reception: bool,
    pub authorization: bool,
}

impl ServiceStatus {
    pub fn is_online(&self) -> bool {
        self.reception && self.authorization
    }
}

/// The operations the pipeline needs from the SRI.
#[async_trait]
pub trait SriService: Send + Sync {
    async fn submit_for_reception(
        &self,
        signed_xml: &str,
    ) -> Result<Exchange<ReceptionOutcome>, SubmissionError>;

    async fn query_authorization(
        &self,
        access_key: &AccessKey,
    ) -> Result<Exchange<AuthorizationOutcome>, SubmissionError>;

    async fn service_status(&self) -> ServiceStatus;
}

/// One way of delivering a SOAP request and returning the response body.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, request: &SoapRequest) -> Result<String, SubmissionError>;
}

/// Posts the hand-built envelope to the configured endpoints.
#[derive(Debug, Clone)]
pub struct RawTransport {
    http: Client,
    endpoints: Endpoints,
}

impl RawTransport {
    pub fn new(http: Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl SoapTransport for RawTransport {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn call(&self, request: &SoapRequest) -> Result<String, SubmissionError> {
        let url = endpoint_for(&self.endpoints, request.operation());
        post_soap(&self.http, url, raw_envelope(request)).await
    }
}

/// Resolves the SOAP address from the service WSDL and posts typed envelopes.
#[derive(Debug)]
pub struct TypedBinding {
    http: Client,
    endpoints: Endpoints,
    addresses: RwLock<HashMap<SoapOperation, String>>,
}

impl TypedBinding {
    pub fn new(http: Client, endpoints: Endpoints) -> Self {
        Self {
            http,
            endpoints,
            addresses: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, operation: SoapOperation) -> Result<String, SubmissionError> {
        let cached = self.addresses.read().get(&operation).cloned();
        if let Some(address) = cached {
            return Ok(address);
        }
        let wsdl_url = format!("{}?wsdl", endpoint_for(&self.endpoints, operation));
        let response = self
            .http
            .get(&wsdl_url)
            .send()
            .await
            .map_err(|e| SubmissionError::BindingUnavailable(format!("{wsdl_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(SubmissionError::BindingUnavailable(format!(
                "{wsdl_url}: HTTP {}",
                response.status().as_u16()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SubmissionError::BindingUnavailable(format!("{wsdl_url}: {e}")))?;
        let binding = parse_wsdl(&body).ok_or_else(|| {
            SubmissionError::BindingUnavailable(format!("{wsdl_url}: unreadable WSDL"))
        })?;
        if !binding.supports(operation) {
            return Err(SubmissionError::BindingUnavailable(format!(
                "{wsdl_url}: operation {} not offered",
                operation.name()
            )));
        }
        debug!(operation = operation.name(), address = %binding.address, "resolved SOAP address");
        self.addresses
            .write()
            .insert(operation, binding.address.clone());
        Ok(binding.address)
    }
}

#[async_trait]
impl SoapTransport for TypedBinding {
    fn name(&self) -> &'static str {
        "typed"
    }

    async fn call(&self, request: &SoapRequest) -> Result<String, SubmissionError> {
        let address = self.resolve(request.operation()).await?;
        post_soap(&self.http, &address, typed_envelope(request)?).await
    }
}

fn endpoint_for(endpoints: &Endpoints, operation: SoapOperation) -> &str {
    match operation {
        SoapOperation::ValidarComprobante => &endpoints.reception,
        SoapOperation::AutorizacionComprobante => &endpoints.authorization,
    }
}

fn map_transport_error(url: &str, err: reqwest::Error) -> SubmissionError {
    if err.is_timeout() {
        SubmissionError::Timeout { url: url.into() }
    } else if err.is_connect() {
        SubmissionError::Connection {
            url: url.into(),
            message: err.to_string(),
        }
    } else {
        SubmissionError::Http(err)
    }
}

async fn post_soap(http: &Client, url: &str, envelope: String) -> Result<String, SubmissionError> {
    let response = http
        .post(url)
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", "\"\"")
        .body(envelope)
        .send()
        .await
        .map_err(|e| map_transport_error(url, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| map_transport_error(url, e))?;

    if status.is_success() {
        return Ok(body);
    }
    // The SRI answers some rejections and faults with HTTP 500.
    if status == StatusCode::INTERNAL_SERVER_ERROR && response::is_sri_payload(&body) {
        return Ok(body);
    }
    match status.as_u16() {
        500 | 502 | 503 | 504 => Err(SubmissionError::Unavailable {
            status: status.as_u16(),
            body,
        }),
        code => Err(SubmissionError::HttpStatus { status: code, body }),
    }
}

/// SRI web service client.
///
/// # Examples
/// ```rust,no_run
/// use sri_core::config::{Config, Environment};
/// use sri_core::submission::SriClient;
///
/// let client = SriClient::new(&Config::new(Environment::Test))?;
/// # let _ = client;
/// # Ok::<(), sri_core::submission::SubmissionError>(())
/// ```
pub struct SriClient {
    typed: TypedBinding,
    raw: RawTransport,
    strategy: SubmissionStrategy,
    retry: RetryPolicy,
    endpoints: Endpoints,
    http: Client,
}

impl SriClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    /// Returns [`SubmissionError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, SubmissionError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        let endpoints = config.endpoints();
        Ok(Self {
            typed: TypedBinding::new(http.clone(), endpoints.clone()),
            raw: RawTransport::new(http.clone(), endpoints.clone()),
            strategy: config.strategy(),
            retry: config.retry().clone(),
            endpoints,
            http,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn strategy(&self) -> SubmissionStrategy {
        self.strategy
    }

    async fn call_once(&self, request: &SoapRequest) -> Result<String, SubmissionError> {
        match self.strategy {
            SubmissionStrategy::RawOnly => self.raw.call(request).await,
            SubmissionStrategy::TypedOnly => self.typed.call(request).await,
            SubmissionStrategy::TypedFirst => match self.typed.call(request).await {
                Err(err)
                    if err.is_transient()
                        || matches!(err, SubmissionError::BindingUnavailable(_)) =>
                {
                    debug!(
                        operation = request.operation().name(),
                        error = %err,
                        "typed binding failed, using raw envelope"
                    );
                    self.raw.call(request).await
                }
                other => other,
            },
        }
    }

    /// Send a request, retrying transient failures per the retry policy.
    async fn exchange(&self, request: &SoapRequest) -> Result<String, SubmissionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.call_once(request).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation = request.operation().name(),
                        attempt,
                        ?delay,
                        error = %err,
                        "transient SRI failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl SriService for SriClient {
    async fn submit_for_reception(
        &self,
        signed_xml: &str,
    ) -> Result<Exchange<ReceptionOutcome>, SubmissionError> {
        let request = SoapRequest::Reception {
            xml_base64: Base64::encode_string(strip_declaration(signed_xml).as_bytes()),
        };
        let raw = self.exchange(&request).await?;
        let outcome = match response::parse_body(&raw)? {
            ResponseBody::Fault(fault) => return Err(SubmissionError::Fault(fault)),
            ResponseBody::Reception(reception) => match reception.state.as_str() {
                "RECIBIDA" => ReceptionOutcome::Accepted {
                    messages: reception.messages,
                },
                "DEVUELTA" => ReceptionOutcome::Rejected {
                    messages: reception.messages,
                },
                other => {
                    return Err(ResponseError(format!("unknown reception state {other:?}")).into())
                }
            },
            ResponseBody::Authorization(_) => {
                return Err(ResponseError("authorization answer to a reception call".into()).into())
            }
        };
        info!(state = outcome.code(), "reception answered");
        Ok(Exchange { outcome, raw })
    }

    async fn query_authorization(
        &self,
        access_key: &AccessKey,
    ) -> Result<Exchange<AuthorizationOutcome>, SubmissionError> {
        let request = SoapRequest::Authorization {
            access_key: access_key.as_str().to_string(),
        };
        let raw = self.exchange(&request).await?;
        let authorization = match response::parse_body(&raw)? {
            ResponseBody::Fault(fault) => return Err(SubmissionError::Fault(fault)),
            ResponseBody::Authorization(authorization) => authorization,
            ResponseBody::Reception(_) => {
                return Err(ResponseError("reception answer to an authorization call".into()).into())
            }
        };
        let outcome = match authorization.decisive_record() {
            Some(record) if record.state == "AUTORIZADO" => AuthorizationOutcome::Authorized {
                number: record
                    .number
                    .clone()
                    .unwrap_or_else(|| access_key.as_str().to_string()),
                authorized_at: record.authorized_at,
                messages: record.messages.clone(),
            },
            Some(record) if record.state == "NO AUTORIZADO" => AuthorizationOutcome::Rejected {
                messages: record.messages.clone(),
            },
            Some(record) => AuthorizationOutcome::Pending {
                state: Some(record.state.clone()).filter(|s| !s.is_empty()),
            },
            None => AuthorizationOutcome::Pending { state: None },
        };
        info!(access_key = %access_key, state = outcome.code(), "authorization answered");
        Ok(Exchange { outcome, raw })
    }

    async fn service_status(&self) -> ServiceStatus {
        let probe = |url: String| {
            let http = self.http.clone();
            async move {
                match http.head(&url).send().await {
                    Ok(response) => matches!(response.status().as_u16(), 200 | 404 | 405),
                    Err(err) => {
                        debug!(url = %url, error = %err, "service probe failed");
                        false
                    }
                }
            }
        };
        let (reception, authorization) = tokio::join!(
            probe(self.endpoints.reception.clone()),
            probe(self.endpoints.authorization.clone())
        );
        ServiceStatus {
            reception,
            authorization,
        }
    }
}
