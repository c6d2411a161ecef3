mod common;

use chrono::DateTime;
use common::{
    TENANT, authorized_body, certificate_bundle, reception_body, sample_invoice, try_start_server,
};
use httpmock::{Method::POST, MockServer};
use sri_core::config::{
    AUTHORIZATION_PATH, Config, Environment, RECEPTION_PATH, RetryPolicy, SubmissionStrategy,
};
use sri_core::pipeline::{Collaborators, Pipeline};
use sri_core::poller::PollOutcome;
use sri_core::response_log::Operation;
use sri_core::{CertificateStore, DocumentStatus, SriClient};
use std::sync::Arc;
use std::time::Duration;

fn pipeline_for(server: &MockServer) -> Pipeline {
    let config = Config::new(Environment::Test)
        .with_base_url(server.base_url())
        .with_retry(RetryPolicy::immediate(1))
        .with_timeouts(Duration::from_secs(1), Duration::from_secs(1))
        .with_strategy(SubmissionStrategy::RawOnly);
    let certificates = Arc::new(CertificateStore::new());
    certificates.insert(certificate_bundle(TENANT));
    let client = SriClient::new(&config).expect("client");
    Pipeline::new(
        config,
        certificates,
        Arc::new(client),
        Collaborators::in_memory(),
    )
    .without_auto_poll()
}

#[test]
fn received_invoice_is_sent() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    let reception = server.mock(|when, then| {
        when.method(POST)
            .path(RECEPTION_PATH)
            .header("content-type", "text/xml; charset=utf-8")
            .body_contains("<ser:validarComprobante><xml>");
        then.status(200).body(reception_body("RECIBIDA"));
    });
    let pipeline = pipeline_for(&server);
    let id = pipeline.create_draft(sample_invoice(TENANT)).unwrap();

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let snapshot = rt.block_on(pipeline.process(id)).unwrap();

    assert_eq!(snapshot.status, DocumentStatus::Sent);
    assert_eq!(snapshot.number.as_deref(), Some("001-001-000000001"));
    assert_eq!(
        snapshot.access_key.as_ref().map(|k| k.as_str()),
        Some("1501202401179173740900110010010000000011234567814")
    );
    let entries = pipeline.response_log().entries(id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation(), Operation::Reception);
    assert_eq!(entries[0].code(), "RECIBIDA");
    assert!(entries[0].payload().contains("RespuestaRecepcionComprobante"));
    reception.assert_hits(1);
}

#[test]
fn authorized_invoice_keeps_number_and_date() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path(RECEPTION_PATH);
        then.status(200).body(reception_body("RECIBIDA"));
    });
    let authorization = server.mock(|when, then| {
        when.method(POST)
            .path(AUTHORIZATION_PATH)
            .body_contains("<claveAccesoComprobante xmlns=\"\">1501202401179173740900110010010000000011234567814</claveAccesoComprobante>");
        then.status(200).body(authorized_body(
            "1501202401179173740900110010010000000011234567814",
            "2024-01-15T10:20:30-05:00",
        ));
    });
    let pipeline = pipeline_for(&server);
    let id = pipeline.create_draft(sample_invoice(TENANT)).unwrap();

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(pipeline.process(id)).unwrap();
    let (outcome, snapshot) = rt.block_on(pipeline.check_authorization(id)).unwrap();

    assert!(matches!(outcome, PollOutcome::Authorized { .. }));
    assert_eq!(snapshot.status, DocumentStatus::Authorized);
    assert_eq!(
        snapshot.authorization_number.as_deref(),
        Some("1501202401179173740900110010010000000011234567814")
    );
    assert_eq!(
        snapshot.authorized_at,
        Some(DateTime::parse_from_rfc3339("2024-01-15T10:20:30-05:00").unwrap())
    );
    assert_eq!(snapshot.last_good_status, Some(DocumentStatus::Authorized));
    authorization.assert_hits(1);
}

#[test]
fn authorization_timeout_leaves_document_sent() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path(RECEPTION_PATH);
        then.status(200).body(reception_body("RECIBIDA"));
    });
    server.mock(|when, then| {
        when.method(POST).path(AUTHORIZATION_PATH);
        then.status(200)
            .delay(Duration::from_secs(3))
            .body("<late/>");
    });
    let pipeline = pipeline_for(&server);
    let id = pipeline.create_draft(sample_invoice(TENANT)).unwrap();

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(pipeline.process(id)).unwrap();
    let outcome = rt.block_on(pipeline.poller().poll_once(id, 1)).unwrap();

    assert_eq!(
        outcome,
        PollOutcome::Retry {
            next_attempt: 2,
            delay: Duration::from_secs(120)
        }
    );
    assert_eq!(pipeline.get_status(id).unwrap().status, DocumentStatus::Sent);
    let entries = pipeline.response_log().entries(id);
    let last = entries.last().unwrap();
    assert_eq!(last.operation(), Operation::Authorization);
    assert_eq!(last.code(), "TIMEOUT");
}

#[test]
fn unreachable_reception_keeps_signed_document() {
    let server = match try_start_server() {
        Some(server) => server,
        None => return,
    };
    server.mock(|when, then| {
        when.method(POST).path(RECEPTION_PATH);
        then.status(503).body("mantenimiento");
    });
    let pipeline = pipeline_for(&server);
    let id = pipeline.create_draft(sample_invoice(TENANT)).unwrap();

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let failure = rt.block_on(pipeline.process(id)).unwrap_err();

    assert_eq!(failure.status(), Some(DocumentStatus::Signed));
    let entries = pipeline.response_log().entries(id);
    assert_eq!(entries[0].code(), "SVC_UNAVL");
    assert_eq!(entries[0].payload(), "mantenimiento");
}
