//! Parsing of SRI SOAP responses.
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use libxml::{parser::Parser, tree::Node, xpath};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset applied to SRI timestamps that carry none (Ecuador mainland time).
pub const SRI_UTC_OFFSET_SECS: i32 = -5 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// A message attached to a reception or authorization answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SriMessage {
    pub identifier: String,
    pub message: String,
    pub additional_info: Option<String>,
    pub kind: Option<String>,
}

impl fmt::Display for SriMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}: {}", self.identifier, self.message)?;
        if let Some(info) = &self.additional_info {
            write!(f, " - {info}")?;
        }
        Ok(())
    }
}

/// Joins messages the way they are persisted on the document.
pub fn format_messages(messages: &[SriMessage]) -> String {
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionResponse {
    pub state: String,
    pub messages: Vec<SriMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    pub state: String,
    pub number: Option<String>,
    pub authorized_at: Option<DateTime<FixedOffset>>,
    pub raw_date: Option<String>,
    pub environment: Option<String>,
    pub messages: Vec<SriMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub access_key: Option<String>,
    pub records: Vec<AuthorizationRecord>,
}

impl AuthorizationResponse {
    /// The record that decides the outcome: any `AUTORIZADO`, else the first.
    pub fn decisive_record(&self) -> Option<&AuthorizationRecord> {
        self.records
            .iter()
            .find(|r| r.state == "AUTORIZADO")
            .or_else(|| self.records.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid SRI response: {0}")]
pub struct ResponseError(pub String);

/// Which SRI answer a body carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Reception(ReceptionResponse),
    Authorization(AuthorizationResponse),
    Fault(SoapFault),
}

/// Parse any SOAP body returned by the reception or authorization service.
pub fn parse_body(body: &str) -> Result<ResponseBody, ResponseError> {
    let doc = Parser::default()
        .parse_string(body)
        .map_err(|e| ResponseError(format!("XML parse error: {e:?}")))?;
    let ctx = xpath::Context::new(&doc)
        .map_err(|e| ResponseError(format!("XPath context error: {e:?}")))?;
    let first = |name: &str| -> Option<Node> {
        ctx.evaluate(&format!("//*[local-name()='{name}']"))
            .ok()?
            .get_nodes_as_vec()
            .into_iter()
            .next()
    };

    if let Some(fault) = first("Fault") {
        return Ok(ResponseBody::Fault(read_fault(&fault)));
    }
    if let Some(node) = first("RespuestaRecepcionComprobante") {
        return Ok(ResponseBody::Reception(read_reception(&node)));
    }
    if let Some(node) = first("RespuestaAutorizacionComprobante") {
        return Ok(ResponseBody::Authorization(read_authorization(&node)));
    }
    Err(ResponseError("no SRI response element found".into()))
}

/// True when the body holds an SRI answer or fault, whatever the HTTP status.
pub fn is_sri_payload(body: &str) -> bool {
    parse_body(body).is_ok()
}

fn read_fault(node: &Node) -> SoapFault {
    SoapFault {
        code: child_text(node, "faultcode").unwrap_or_else(|| "soap:Server".into()),
        message: child_text(node, "faultstring").unwrap_or_default(),
        detail: child(node, "detail")
            .map(|d| d.get_content().trim().to_string())
            .filter(|d| !d.is_empty()),
    }
}

fn read_reception(node: &Node) -> ReceptionResponse {
    let messages = child(node, "comprobantes")
        .map(|list| {
            children(&list, "comprobante")
                .iter()
                .flat_map(read_messages)
                .collect()
        })
        .unwrap_or_default();
    ReceptionResponse {
        state: child_text(node, "estado").unwrap_or_default(),
        messages,
    }
}

fn read_authorization(node: &Node) -> AuthorizationResponse {
    let records = child(node, "autorizaciones")
        .map(|list| {
            children(&list, "autorizacion")
                .iter()
                .map(|a| {
                    let raw_date = child_text(a, "fechaAutorizacion");
                    AuthorizationRecord {
                        state: child_text(a, "estado").unwrap_or_default(),
                        number: child_text(a, "numeroAutorizacion"),
                        authorized_at: raw_date.as_deref().and_then(parse_authorization_date),
                        raw_date,
                        environment: child_text(a, "ambiente"),
                        messages: read_messages(a),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    AuthorizationResponse {
        access_key: child_text(node, "claveAccesoConsultada"),
        records,
    }
}

fn read_messages(node: &Node) -> Vec<SriMessage> {
    let Some(list) = child(node, "mensajes") else {
        return Vec::new();
    };
    children(&list, "mensaje")
        .iter()
        .map(|m| SriMessage {
            identifier: child_text(m, "identificador").unwrap_or_default(),
            message: child_text(m, "mensaje").unwrap_or_default(),
            additional_info: child_text(m, "informacionAdicional"),
            kind: child_text(m, "tipo"),
        })
        .collect()
}

fn children(node: &Node, name: &str) -> Vec<Node> {
    node.get_child_elements()
        .into_iter()
        .filter(|c| c.get_name() == name)
        .collect()
}

fn child(node: &Node, name: &str) -> Option<Node> {
    children(node, name).into_iter().next()
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    let text = child(node, name)?.get_content().trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Parse `fechaAutorizacion` in any of the formats the SRI has been seen to send.
pub fn parse_authorization_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt);
    }
    let offset = FixedOffset::east_opt(SRI_UTC_OFFSET_SECS)?;
    const NAIVE_FORMATS: [&str; 4] = [
        "%d/%m/%Y %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return offset.from_local_datetime(&naive).single();
        }
    }
    let date = NaiveDate::parse_from_str(value, "%d/%m/%Y").ok()?;
    offset
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
}
