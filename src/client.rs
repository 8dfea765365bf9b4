//! Submission over HTTP and classification of whatever comes back.

use crate::envelope::Envelope;
use crate::error::{VerifactuError, VerifactuResult};
use crate::record::RecordOperation;
use crate::xml::XmlNode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Sent,
    AcceptedWithErrors,
    Canceled,
    Error,
}

/// Why an `Error` outcome happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// HTML page or 5xx from the authority's front end
    AuthorityIncident,
    SoapFault,
    /// The authority read the record and refused it
    Rejected,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub status: OutcomeStatus,
    pub error_class: Option<ErrorClass>,
    pub remote_code: Option<u32>,
    pub summary: String,
    pub raw_payload: String,
    pub http_status: u16,
    pub receipt: Option<String>, // secure verification code
    pub inferred_cancellation: bool,
}

impl SubmissionOutcome {
    pub fn is_authority_incident(&self) -> bool {
        self.error_class == Some(ErrorClass::AuthorityIncident)
    }
    pub fn is_rejection(&self) -> bool {
        self.error_class == Some(ErrorClass::Rejected)
    }

    /// The authority's refusal as an error value, `None` for any other outcome.
    pub fn rejection(&self) -> Option<VerifactuError> {
        self.is_rejection().then(|| VerifactuError::BusinessRejection {
            code: self.remote_code,
            message: self.summary.clone(),
        })
    }

    fn error(class: ErrorClass, code: Option<u32>, summary: String, raw: &RawResponse) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error_class: Some(class),
            remote_code: code,
            summary,
            raw_payload: raw.body.clone(),
            http_status: raw.status,
            receipt: None,
            inferred_cancellation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub timeout: Duration,
}

pub trait HttpTransport: Send + Sync {
    fn post(&self, endpoint: &Endpoint, body: &[u8]) -> VerifactuResult<RawResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> VerifactuResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| VerifactuError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(&self, endpoint: &Endpoint, body: &[u8]) -> VerifactuResult<RawResponse> {
        debug!(url = %endpoint.url, bytes = body.len(), "posting envelope");
        let response = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "\"\"")
            .body(body.to_vec())
            .send()
            .map_err(|e| {
                if e.is_builder() {
                    VerifactuError::Configuration(format!("invalid endpoint {}: {e}", endpoint.url))
                } else if e.is_timeout() {
                    VerifactuError::Transport(format!("timed out after {:?}: {e}", endpoint.timeout))
                } else {
                    VerifactuError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .map_err(|e| VerifactuError::Transport(format!("reading response body: {e}")))?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

pub struct SubmissionClient {
    transport: Arc<dyn HttpTransport>,
}

impl SubmissionClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Business outcomes, including refusals, come back as `Ok`. Only failures
    /// to get any answer at all are errors.
    pub fn send(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
        operation: RecordOperation,
    ) -> VerifactuResult<SubmissionOutcome> {
        let raw = self.transport.post(endpoint, &envelope.bytes)?;
        let outcome = classify_response(&raw, operation);
        if outcome.is_authority_incident() {
            warn!(
                record = %envelope.record_id,
                http_status = raw.status,
                body = %body_excerpt(&raw.body),
                "authority incident"
            );
        }
        Ok(outcome)
    }
}

fn body_excerpt(body: &str) -> String {
    body.chars().take(300).collect()
}

pub fn is_rejection_code(code: u32) -> bool {
    matches!(code, 1100..=1299 | 4102..=4140 | 3001..=3004)
}

pub fn is_accepted_with_errors_code(code: u32) -> bool {
    matches!(code, 2000..=2008 | 3000)
}

fn looks_like_html(raw: &RawResponse) -> bool {
    let head: String = raw
        .body
        .trim_start()
        .chars()
        .take(15)
        .collect::<String>()
        .to_ascii_lowercase();
    raw.content_type.to_ascii_lowercase().contains("text/html")
        || head.starts_with("<!doctype html")
        || head.starts_with("<html")
}

/// Pure classification of a raw authority response.
pub fn classify_response(raw: &RawResponse, operation: RecordOperation) -> SubmissionOutcome {
    if raw.status >= 500 || looks_like_html(raw) {
        return SubmissionOutcome::error(
            ErrorClass::AuthorityIncident,
            extract_status_code(&raw.body),
            format!("authority incident: HTTP {}", raw.status),
            raw,
        );
    }

    let tree = match XmlNode::parse(raw.body.trim().as_bytes()) {
        Ok(tree) => tree,
        Err(_) => {
            let code = extract_status_code(&raw.body);
            let class = match code {
                Some(code) if is_rejection_code(code) => ErrorClass::Rejected,
                _ => ErrorClass::Unrecognized,
            };
            return SubmissionOutcome::error(
                class,
                code,
                format!("unparseable response (HTTP {})", raw.status),
                raw,
            );
        }
    };

    if let Some(fault) = tree.find("Fault") {
        let text = fault
            .find_text("faultstring")
            .unwrap_or("SOAP fault without faultstring");
        let code = first_code(text, 4..=5);
        let class = match code {
            Some(code) if is_rejection_code(code) => ErrorClass::Rejected,
            _ => ErrorClass::SoapFault,
        };
        return SubmissionOutcome::error(class, code, format!("SOAP fault: {text}"), raw);
    }

    if tree.find("RespuestaRegFactuSistemaFacturacion").is_none() {
        return SubmissionOutcome::error(
            ErrorClass::Unrecognized,
            None,
            format!("response without submission result (HTTP {})", raw.status),
            raw,
        );
    }

    let line = tree.find("RespuestaLinea").unwrap_or(&tree);
    let shipment = tree.find_text("EstadoEnvio").unwrap_or_default();
    let state = line.find_text("EstadoRegistro").unwrap_or_default();
    let code = line
        .find_text("CodigoErrorRegistro")
        .and_then(|c| c.parse::<u32>().ok());
    let description = line.find_text("DescripcionErrorRegistro");
    let operation_type = line.find_text("TipoOperacion").unwrap_or_default();
    let receipt = tree.find_text("CSV").map(str::to_string);
    let state_lower = state.to_ascii_lowercase();
    let explicit_failure = state_lower == "incorrecto";

    let summary = |label: &str| match (code, description) {
        (Some(code), Some(text)) => format!("{label}: [{code}] {text}"),
        (None, Some(text)) => format!("{label}: {text}"),
        (Some(code), None) => format!("{label}: [{code}]"),
        (None, None) => label.to_string(),
    };
    let outcome = |status, summary: String, inferred| SubmissionOutcome {
        status,
        error_class: None,
        remote_code: code,
        summary,
        raw_payload: raw.body.clone(),
        http_status: raw.status,
        receipt: receipt.clone(),
        inferred_cancellation: inferred,
    };

    // heuristic: cancellations are often answered without an explicit success state
    if operation_type.eq_ignore_ascii_case("anulacion") && !explicit_failure {
        let inferred = state_lower != "correcto";
        return outcome(OutcomeStatus::Canceled, summary("cancellation accepted"), inferred);
    }

    let accepted_with_errors = (state_lower.starts_with("aceptado") && state_lower.contains("error"))
        || (shipment.eq_ignore_ascii_case("ParcialmenteCorrecto") && !explicit_failure)
        || code.is_some_and(is_accepted_with_errors_code);
    if accepted_with_errors {
        return outcome(
            OutcomeStatus::AcceptedWithErrors,
            summary("accepted with errors"),
            false,
        );
    }

    if state_lower == "correcto" || (state.is_empty() && shipment.eq_ignore_ascii_case("Correcto")) {
        let status = match operation {
            RecordOperation::Cancellation => OutcomeStatus::Canceled,
            RecordOperation::Registration => OutcomeStatus::Sent,
        };
        return outcome(status, summary("accepted"), false);
    }

    let class = if explicit_failure || code.is_some_and(is_rejection_code) {
        ErrorClass::Rejected
    } else {
        ErrorClass::Unrecognized
    };
    SubmissionOutcome::error(class, code, summary("rejected"), raw)
}

/// First digit run whose length is in `lengths`.
fn first_code(text: &str, lengths: std::ops::RangeInclusive<usize>) -> Option<u32> {
    digit_runs(text)
        .find(|run| lengths.contains(&run.len()))
        .and_then(|run| run.parse().ok())
}

/// First standalone number that looks like an authority status code.
pub fn extract_status_code(text: &str) -> Option<u32> {
    digit_runs(text).find_map(|run| {
        let value: u32 = run.parse().ok()?;
        let plausible = match run.len() {
            4 => matches!(value, 1000..=1199 | 3000..=3999 | 4000..=4199),
            5 => matches!(value, 20000..=29999),
            _ => false,
        };
        plausible.then_some(value)
    })
}

fn digit_runs(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
}
