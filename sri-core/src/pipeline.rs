//! Document state machine: generation, signing, submission and polling.
pub mod collaborators;
mod locks;

pub use locks::DocumentLocks;

use crate::access_key::{AccessKey, AccessKeyError, AccessKeyParts};
use crate::certificate::{CertificateError, CertificateStore};
use crate::config::Config;
use crate::document::sign::{DocumentSigner, SigningError};
use crate::document::xml::{DocumentXml, DocumentXmlError, ToXml};
use crate::document::{
    Document, DocumentCapabilities, DocumentId, DocumentStatus, DocumentType, TenantId,
    TransitionError, ValidationError,
};
use crate::poller::{AuthorizationPoller, PollError, PollOutcome};
use crate::response_log::{InMemoryResponseLog, LogEntry, Operation, ResponseLog};
use crate::submission::response::format_messages;
use crate::submission::{ReceptionOutcome, SriService, SubmissionError};
use chrono::{DateTime, FixedOffset, Utc};
use collaborators::{
    ArtifactStore, BillingGate, DocumentRepository, InMemoryArtifacts, InMemoryDocuments,
    StoreError, UnlimitedBilling,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Who is asking for a pipeline operation, resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { user_id: String, tenant_id: TenantId },
    TenantToken { tenant_id: TenantId, token_id: String },
}

impl Principal {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Principal::User { tenant_id, .. } | Principal::TenantToken { tenant_id, .. } => {
                tenant_id
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Xml(#[from] DocumentXmlError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("reception rejected: {0}")]
    ReceptionRejected(String),
    #[error("authorization rejected: {0}")]
    AuthorizationRejected(String),
    #[error("SRI did not answer in time: {0}")]
    Timeout(String),
    #[error("billing quota exhausted for tenant {0}")]
    QuotaExceeded(TenantId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("document {0} is already being processed")]
    Busy(DocumentId),
    #[error("not allowed to act on document {0}")]
    Forbidden(DocumentId),
    #[error("{0} documents cannot be cancelled")]
    NotCancellable(DocumentType),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PollError> for PipelineError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Store(e) => PipelineError::Store(e),
            PollError::Transition(e) => PipelineError::Transition(e),
        }
    }
}

/// Public view of a document's progress. Carries no signing material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub number: Option<String>,
    pub access_key: Option<AccessKey>,
    pub status: DocumentStatus,
    /// Highest status proven by a logged SRI response.
    pub last_good_status: Option<DocumentStatus>,
    pub authorization_number: Option<String>,
    pub authorized_at: Option<DateTime<FixedOffset>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A failed pipeline call and where it left the document.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ProcessFailure {
    pub snapshot: Option<StatusSnapshot>,
    pub source: PipelineError,
}

impl ProcessFailure {
    pub fn status(&self) -> Option<DocumentStatus> {
        self.snapshot.as_ref().map(|s| s.status)
    }
}

/// Storage-side services the pipeline depends on.
pub struct Collaborators {
    pub repository: Arc<dyn DocumentRepository>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub billing: Arc<dyn BillingGate>,
    pub log: Arc<dyn ResponseLog>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            repository: Arc::new(InMemoryDocuments::new()),
            artifacts: Arc::new(InMemoryArtifacts::new()),
            billing: Arc::new(UnlimitedBilling),
            log: Arc::new(InMemoryResponseLog::new()),
        }
    }
}

/// Drives documents from `DRAFT` to an SRI decision.
pub struct Pipeline {
    config: Config,
    certificates: Arc<CertificateStore>,
    sri: Arc<dyn SriService>,
    repository: Arc<dyn DocumentRepository>,
    artifacts: Arc<dyn ArtifactStore>,
    billing: Arc<dyn BillingGate>,
    log: Arc<dyn ResponseLog>,
    locks: Arc<DocumentLocks>,
    poller: Arc<AuthorizationPoller>,
    auto_poll: bool,
}

impl Pipeline {
    pub fn new(
        config: Config,
        certificates: Arc<CertificateStore>,
        sri: Arc<dyn SriService>,
        collaborators: Collaborators,
    ) -> Self {
        let locks = Arc::new(DocumentLocks::new());
        let poller = Arc::new(AuthorizationPoller::new(
            collaborators.repository.clone(),
            sri.clone(),
            collaborators.log.clone(),
            locks.clone(),
            config.poll().clone(),
        ));
        Self {
            config,
            certificates,
            sri,
            repository: collaborators.repository,
            artifacts: collaborators.artifacts,
            billing: collaborators.billing,
            log: collaborators.log,
            locks,
            poller,
            auto_poll: true,
        }
    }

    /// Do not start polling after a successful submission.
    pub fn without_auto_poll(mut self) -> Self {
        self.auto_poll = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn poller(&self) -> &Arc<AuthorizationPoller> {
        &self.poller
    }

    pub fn response_log(&self) -> &Arc<dyn ResponseLog> {
        &self.log
    }

    pub fn service(&self) -> &Arc<dyn SriService> {
        &self.sri
    }

    /// Store a new `DRAFT` document.
    #[tracing::instrument(skip_all, fields(document_id = %document.id()))]
    pub fn create_draft(&self, document: Document) -> Result<DocumentId, PipelineError> {
        if document.status() != DocumentStatus::Draft {
            return Err(TransitionError {
                from: document.status(),
                to: DocumentStatus::Draft,
            }
            .into());
        }
        document.validate()?;
        self.repository.save(&document)?;
        info!(tenant = %document.tenant_id(), "draft created");
        Ok(document.id())
    }

    /// Generate, sign and submit a document, then start polling.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub async fn process(&self, id: DocumentId) -> Result<StatusSnapshot, ProcessFailure> {
        let result = {
            let _guard = self
                .locks
                .try_acquire(id)
                .ok_or_else(|| self.failure(id, PipelineError::Busy(id)))?;
            let mut doc = self.load(id).map_err(|e| self.failure(id, e))?;
            let reserve = doc.status() == DocumentStatus::Draft;
            self.run_stages(&mut doc, reserve).await
        };
        self.start_polling(&result);
        result
    }

    /// Reset a stuck or failed document to `GENERATED` and process it again.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub async fn reprocess(&self, id: DocumentId) -> Result<StatusSnapshot, ProcessFailure> {
        let result = {
            let _guard = self
                .locks
                .try_acquire(id)
                .ok_or_else(|| self.failure(id, PipelineError::Busy(id)))?;
            let mut doc = self.load(id).map_err(|e| self.failure(id, e))?;
            let previous = doc.status();
            // A draft has nothing to reset and still owes its billing reservation.
            if previous != DocumentStatus::Draft {
                doc.reset_for_reprocess()
                    .map_err(|e| self.failure(id, e.into()))?;
                self.repository
                    .save(&doc)
                    .map_err(|e| self.failure(id, e.into()))?;
                info!(from = %previous, "document reset for reprocessing");
            }
            self.run_stages(&mut doc, previous == DocumentStatus::Draft)
                .await
        };
        self.start_polling(&result);
        result
    }

    /// [`Pipeline::process`] on behalf of a caller, who must own the document.
    pub async fn process_as(
        &self,
        principal: &Principal,
        id: DocumentId,
    ) -> Result<StatusSnapshot, ProcessFailure> {
        let doc = self.load(id).map_err(|e| self.failure(id, e))?;
        if doc.tenant_id() != principal.tenant_id() {
            warn!(document_id = %id, tenant = %principal.tenant_id(), "cross-tenant request refused");
            return Err(ProcessFailure {
                snapshot: None,
                source: PipelineError::Forbidden(id),
            });
        }
        self.process(id).await
    }

    pub fn get_status(&self, id: DocumentId) -> Result<StatusSnapshot, PipelineError> {
        let doc = self.load(id)?;
        Ok(self.snapshot(&doc))
    }

    /// Cancel an authorized invoice.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub fn cancel(&self, id: DocumentId) -> Result<StatusSnapshot, PipelineError> {
        let _guard = self.locks.try_acquire(id).ok_or(PipelineError::Busy(id))?;
        let mut doc = self.load(id)?;
        if !doc
            .document_type()
            .capabilities()
            .contains(DocumentCapabilities::SUPPORTS_CANCELLATION)
        {
            return Err(PipelineError::NotCancellable(doc.document_type()));
        }
        doc.transition_to(DocumentStatus::Cancelled)?;
        self.repository.save(&doc)?;
        info!("document cancelled");
        Ok(self.snapshot(&doc))
    }

    /// One manual authorization check, outside the polling schedule.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub async fn check_authorization(
        &self,
        id: DocumentId,
    ) -> Result<(PollOutcome, StatusSnapshot), PipelineError> {
        let outcome = self.poller.poll_once(id, 1).await?;
        let snapshot = self.get_status(id)?;
        Ok((outcome, snapshot))
    }

    /// Poll on the configured schedule until the SRI decides.
    ///
    /// A rejection becomes [`PipelineError::AuthorizationRejected`]; giving up
    /// becomes [`PipelineError::Timeout`] with the document left `SENT`.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub async fn wait_for_authorization(
        &self,
        id: DocumentId,
    ) -> Result<StatusSnapshot, PipelineError> {
        match self.poller.run(id).await {
            PollOutcome::Authorized { .. } => self.get_status(id),
            PollOutcome::Rejected { message } => Err(PipelineError::AuthorizationRejected(message)),
            PollOutcome::CeilingReached => Err(PipelineError::Timeout(format!(
                "no decision within {}s of submission",
                self.poller.policy().ceiling_secs
            ))),
            PollOutcome::Exhausted => Err(PipelineError::Timeout(format!(
                "no decision after {} attempts",
                self.poller.policy().max_attempts
            ))),
            PollOutcome::Skipped { reason } => {
                let snapshot = self.get_status(id)?;
                match snapshot.status {
                    DocumentStatus::Authorized | DocumentStatus::Cancelled => Ok(snapshot),
                    DocumentStatus::Rejected => Err(PipelineError::AuthorizationRejected(
                        snapshot.last_error.unwrap_or(reason),
                    )),
                    _ => Err(PipelineError::Timeout(reason)),
                }
            }
            PollOutcome::Locked => Err(PipelineError::Busy(id)),
            // run() only returns final outcomes
            PollOutcome::Retry { .. } => Err(PipelineError::Timeout("polling interrupted".into())),
        }
    }

    fn load(&self, id: DocumentId) -> Result<Document, PipelineError> {
        self.repository.load(id)?.ok_or(PipelineError::NotFound(id))
    }

    fn snapshot(&self, doc: &Document) -> StatusSnapshot {
        StatusSnapshot {
            id: doc.id(),
            tenant_id: doc.tenant_id().clone(),
            document_type: doc.document_type(),
            number: doc.document_number(),
            access_key: doc.access_key().cloned(),
            status: doc.status(),
            last_good_status: self.log.last_successful_status(doc.id()),
            authorization_number: doc.authorization().map(|a| a.number.clone()),
            authorized_at: doc.authorization().and_then(|a| a.authorized_at),
            last_error: doc.last_error().map(str::to_string),
            updated_at: doc.updated_at(),
        }
    }

    fn failure(&self, id: DocumentId, source: PipelineError) -> ProcessFailure {
        let snapshot = self
            .repository
            .load(id)
            .ok()
            .flatten()
            .map(|doc| self.snapshot(&doc));
        ProcessFailure { snapshot, source }
    }

    /// Poll a freshly sent document. Runs after the document lock is released.
    fn start_polling(&self, result: &Result<StatusSnapshot, ProcessFailure>) {
        if let Ok(snapshot) = result {
            if self.auto_poll && snapshot.status == DocumentStatus::Sent {
                self.poller.clone().spawn(snapshot.id);
            }
        }
    }

    /// `reserve` is set only when the document leaves `DRAFT`, so a resend
    /// never takes a second unit of quota.
    async fn run_stages(
        &self,
        doc: &mut Document,
        reserve: bool,
    ) -> Result<StatusSnapshot, ProcessFailure> {
        let status = doc.status();
        if !matches!(
            status,
            DocumentStatus::Draft | DocumentStatus::Generated | DocumentStatus::Signed
        ) {
            let err = TransitionError {
                from: status,
                to: DocumentStatus::Sent,
            };
            return Err(ProcessFailure {
                snapshot: Some(self.snapshot(doc)),
                source: err.into(),
            });
        }
        if reserve && !self.billing.reserve(doc.tenant_id()).await {
            warn!(tenant = %doc.tenant_id(), "billing gate refused document");
            return Err(ProcessFailure {
                snapshot: Some(self.snapshot(doc)),
                source: PipelineError::QuotaExceeded(doc.tenant_id().clone()),
            });
        }

        if let Err(source) = self.advance(doc).await {
            return Err(ProcessFailure {
                snapshot: Some(self.snapshot(doc)),
                source,
            });
        }
        Ok(self.snapshot(doc))
    }

    async fn advance(&self, doc: &mut Document) -> Result<(), PipelineError> {
        if matches!(
            doc.status(),
            DocumentStatus::Draft | DocumentStatus::Generated
        ) {
            let signed = match self.generate(doc).await {
                Ok(xml) => self.sign(doc, &xml).await,
                Err(err) => Err(err),
            };
            if let Err(err) = signed {
                self.abort(doc, &err);
                return Err(err);
            }
        }
        self.submit(doc).await
    }

    /// Move the document to `ERROR`, keeping the message.
    fn abort(&self, doc: &mut Document, err: &PipelineError) {
        warn!(document_id = %doc.id(), status = %doc.status(), error = %err, "processing aborted");
        doc.fail(err.to_string());
        if let Err(save_err) = self.repository.save(doc) {
            warn!(document_id = %doc.id(), error = %save_err, "failed to persist ERROR status");
        }
    }

    async fn generate(&self, doc: &mut Document) -> Result<String, PipelineError> {
        let sequence = match doc.sequence() {
            Some(sequence) => sequence,
            None => {
                let sequence = self
                    .repository
                    .next_sequence(doc.tenant_id(), doc.document_type())?;
                doc.set_sequence(sequence);
                sequence
            }
        };
        if doc.access_key().is_none() {
            let key = AccessKeyParts {
                issue_date: doc.issue_date(),
                document_type: doc.document_type(),
                tax_id: doc.issuer().ruc.clone(),
                environment: self.config.env(),
                establishment: doc.emission_point().establishment.clone(),
                emission_point: doc.emission_point().point.clone(),
                sequence,
                numeric_code: self.config.numeric_code().to_string(),
                emission_type: self.config.emission_type().to_string(),
            }
            .generate()?;
            doc.set_access_key(key);
        }
        doc.validate()?;

        let default_tax = self.config.default_tax();
        doc.set_totals(doc.compute_totals(default_tax));
        let xml = DocumentXml::new(doc, default_tax).to_xml()?;
        let name = format!("{}.xml", artifact_stem(doc));
        let locator = self.artifacts.save(&name, xml.clone().into_bytes()).await?;
        doc.artifacts_mut().xml = Some(locator);
        if doc.status() == DocumentStatus::Draft {
            doc.transition_to(DocumentStatus::Generated)?;
        }
        self.repository.save(doc)?;
        info!(
            document_id = %doc.id(),
            number = %doc.document_number().unwrap_or_default(),
            "document generated"
        );
        Ok(xml)
    }

    async fn sign(&self, doc: &mut Document, xml: &str) -> Result<(), PipelineError> {
        let bundle = self.certificates.get(doc.tenant_id())?;
        let check = CertificateStore::validate(&bundle);
        if !check.ok {
            return Err(CertificateError::Invalid(check.message).into());
        }
        let signed = DocumentSigner::new(&bundle).sign_xml(xml)?;
        if !signed.report().accepted() {
            warn!(
                document_id = %doc.id(),
                failures = ?signed.report().failures,
                "signed document failed structural review"
            );
        }
        let name = format!("{}-signed.xml", artifact_stem(doc));
        let locator = self
            .artifacts
            .save(&name, signed.into_xml().into_bytes())
            .await?;
        doc.artifacts_mut().signed_xml = Some(locator);
        doc.transition_to(DocumentStatus::Signed)?;
        self.repository.save(doc)?;
        info!(document_id = %doc.id(), "document signed");
        Ok(())
    }

    async fn submit(&self, doc: &mut Document) -> Result<(), PipelineError> {
        let id = doc.id();
        let locator = doc
            .artifacts()
            .signed_xml
            .clone()
            .ok_or_else(|| StoreError::ArtifactNotFound(format!("signed XML of {id}")))?;
        let bytes = self.artifacts.load(&locator).await?;
        let signed_xml =
            String::from_utf8(bytes).map_err(|e| StoreError::Backend(e.to_string()))?;

        match self.sri.submit_for_reception(&signed_xml).await {
            Ok(exchange) => {
                let message = format_messages(exchange.outcome.messages());
                self.log.append(LogEntry::new(
                    id,
                    Operation::Reception,
                    exchange.outcome.code(),
                    &message,
                    exchange.raw,
                ));
                match exchange.outcome {
                    ReceptionOutcome::Accepted { .. } => {
                        doc.transition_to(DocumentStatus::Sent)?;
                        self.repository.save(doc)?;
                        info!(document_id = %id, "document received by SRI");
                        Ok(())
                    }
                    ReceptionOutcome::Rejected { .. } => {
                        warn!(document_id = %id, %message, "reception rejected");
                        doc.fail(message.clone());
                        self.repository.save(doc)?;
                        Err(PipelineError::ReceptionRejected(message))
                    }
                }
            }
            Err(err) => {
                warn!(document_id = %id, error = %err, "reception failed");
                self.log.append(LogEntry::new(
                    id,
                    Operation::Reception,
                    &err.response_code(),
                    &err.to_string(),
                    err.payload(),
                ));
                if let Some(status) = self.log.last_successful_status(id) {
                    if doc.restore_status(status) {
                        // An earlier attempt already got through.
                        self.repository.save(doc)?;
                        info!(document_id = %id, status = %status, "status restored from response log");
                        return Ok(());
                    }
                }
                if err.is_transient() {
                    // Stays SIGNED so the same signed XML can be resent.
                    doc.set_last_error(err.to_string());
                    self.repository.save(doc)?;
                    if err.is_timeout() {
                        return Err(PipelineError::Timeout(err.to_string()));
                    }
                } else {
                    doc.fail(err.to_string());
                    self.repository.save(doc)?;
                }
                Err(err.into())
            }
        }
    }
}

fn artifact_stem(doc: &Document) -> String {
    doc.access_key()
        .map(|k| k.as_str().to_string())
        .unwrap_or_else(|| doc.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateBundle;
    use crate::certificate::testing::{bundle, certificate_der, leaf_profile, rsa_key};
    use crate::config::Environment;
    use crate::document::{
        Counterparty, DocumentBody, DocumentBuilder, EmissionPoint, IdentificationType, Issuer,
        LineItem, Payment, RequiredDocumentFields,
    };
    use crate::submission::AuthorizationOutcome;
    use crate::submission::response::SriMessage;
    use crate::submission::testing::ScriptedSri;
    use chrono::NaiveDate;
    use collaborators::QuotaBilling;
    use rsa::pkcs8::EncodePrivateKey;
    use rust_decimal_macros::dec;
    use x509_cert::time::Validity;

    fn invoice(tenant: &str) -> Document {
        DocumentBuilder::new(RequiredDocumentFields {
            tenant_id: TenantId::new(tenant),
            issuer: Issuer {
                ruc: "1791737409001".into(),
                legal_name: "ACME S.A.".into(),
                trade_name: None,
                head_office_address: "Av. Amazonas N1".into(),
                establishment_address: "Av. Amazonas N1".into(),
                special_taxpayer: None,
                accounting_required: true,
            },
            emission_point: EmissionPoint::new("001", "001"),
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            body: DocumentBody::Invoice {
                payments: vec![Payment {
                    method: "01".into(),
                    total: dec!(31.05),
                }],
            },
        })
        .counterparty(Counterparty {
            identification_type: IdentificationType::Cedula,
            identification: "1710034065".into(),
            name: "Juan Perez".into(),
            address: None,
            email: None,
            phone: None,
        })
        .item(LineItem::new("P1", "Widget", dec!(2), dec!(15)).with_discount(dec!(3)))
        .build()
        .unwrap()
    }

    fn pipeline_with(sri: ScriptedSri, collaborators: Collaborators) -> (Pipeline, Arc<ScriptedSri>) {
        let certificates = Arc::new(CertificateStore::new());
        certificates.insert(bundle());
        let sri = Arc::new(sri);
        let pipeline = Pipeline::new(
            Config::new(Environment::Test),
            certificates,
            sri.clone(),
            collaborators,
        )
        .without_auto_poll();
        (pipeline, sri)
    }

    fn pipeline(sri: ScriptedSri) -> (Pipeline, Arc<ScriptedSri>) {
        pipeline_with(sri, Collaborators::in_memory())
    }

    fn accepted() -> Result<ReceptionOutcome, SubmissionError> {
        Ok(ReceptionOutcome::Accepted { messages: vec![] })
    }

    fn timeout() -> SubmissionError {
        SubmissionError::Timeout {
            url: "https://celcer.sri.gob.ec".into(),
        }
    }

    #[tokio::test]
    async fn draft_goes_to_sent() {
        let (pipeline, sri) = pipeline(ScriptedSri::new().reception(accepted()));
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let snapshot = pipeline.process(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
        assert_eq!(snapshot.number.as_deref(), Some("001-001-000000001"));
        assert_eq!(snapshot.last_good_status, Some(DocumentStatus::Sent));
        let key = snapshot.access_key.unwrap();
        assert_eq!(&key.as_str()[..8], "15012024");
        assert_eq!(&key.as_str()[39..47], "12345678");

        let submitted = sri.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].contains("<ds:Signature"));
        assert!(submitted[0].contains("<importeTotal>31.05</importeTotal>"));

        let entries = pipeline.response_log().entries(id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code(), "RECIBIDA");
        assert_eq!(entries[0].operation(), Operation::Reception);
    }

    #[tokio::test]
    async fn sequences_advance_per_document() {
        let (pipeline, _) =
            pipeline(ScriptedSri::new().reception(accepted()).reception(accepted()));
        let first = pipeline.create_draft(invoice("t1")).unwrap();
        let second = pipeline.create_draft(invoice("t1")).unwrap();
        pipeline.process(first).await.unwrap();
        let snapshot = pipeline.process(second).await.unwrap();
        assert_eq!(snapshot.number.as_deref(), Some("001-001-000000002"));
    }

    #[tokio::test]
    async fn reception_rejection_moves_to_error() {
        let rejected = ReceptionOutcome::Rejected {
            messages: vec![SriMessage {
                identifier: "35".into(),
                message: "ARCHIVO NO CUMPLE ESTRUCTURA XML".into(),
                additional_info: None,
                kind: Some("ERROR".into()),
            }],
        };
        let (pipeline, _) = pipeline(ScriptedSri::new().reception(Ok(rejected)));
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let failure = pipeline.process(id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::ReceptionRejected(_)));
        assert_eq!(failure.status(), Some(DocumentStatus::Error));
        let status = pipeline.get_status(id).unwrap();
        assert!(status.last_error.unwrap().contains("Error 35"));
        assert_eq!(pipeline.response_log().entries(id)[0].code(), "DEVUELTA");
    }

    #[tokio::test]
    async fn reception_timeout_keeps_signed_then_resends() {
        let (pipeline, sri) =
            pipeline(ScriptedSri::new().reception(Err(timeout())).reception(accepted()));
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let failure = pipeline.process(id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::Timeout(_)));
        assert_eq!(failure.status(), Some(DocumentStatus::Signed));
        assert_eq!(pipeline.response_log().entries(id)[0].code(), "TIMEOUT");

        let snapshot = pipeline.process(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
        let submitted = sri.submitted();
        assert_eq!(submitted[0], submitted[1]);
    }

    #[tokio::test]
    async fn failed_resend_restores_logged_status() {
        let (pipeline, _) = pipeline(ScriptedSri::new().reception(Err(
            SubmissionError::HttpStatus {
                status: 400,
                body: "bad".into(),
            },
        )));
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        // An earlier attempt was received but its save never happened.
        pipeline.response_log().append(LogEntry::new(
            id,
            Operation::Reception,
            "RECIBIDA",
            "",
            "<soap:Envelope/>",
        ));

        let snapshot = pipeline.process(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
        assert_eq!(pipeline.response_log().entries(id)[1].code(), "HTTP_400");
    }

    #[tokio::test]
    async fn resend_keeps_single_reservation() {
        let quota = Arc::new(QuotaBilling::new().with_quota(TenantId::new("t1"), 1));
        let collaborators = Collaborators {
            billing: quota.clone(),
            ..Collaborators::in_memory()
        };
        let (pipeline, _) = pipeline_with(
            ScriptedSri::new().reception(Err(timeout())).reception(accepted()),
            collaborators,
        );
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let failure = pipeline.process(id).await.unwrap_err();
        assert_eq!(failure.status(), Some(DocumentStatus::Signed));
        assert_eq!(quota.remaining(&TenantId::new("t1")), 0);

        let snapshot = pipeline.process(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
    }

    #[tokio::test]
    async fn refused_draft_reprocess_stays_draft() {
        let collaborators = Collaborators {
            billing: Arc::new(QuotaBilling::new()),
            ..Collaborators::in_memory()
        };
        let (pipeline, _) = pipeline_with(ScriptedSri::new(), collaborators);
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let failure = pipeline.reprocess(id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::QuotaExceeded(_)));
        assert_eq!(failure.status(), Some(DocumentStatus::Draft));
    }

    #[tokio::test]
    async fn reprocess_from_signed_signs_again() {
        let (pipeline, sri) =
            pipeline(ScriptedSri::new().reception(Err(timeout())).reception(accepted()));
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        pipeline.process(id).await.unwrap_err();
        let signer = pipeline.certificates.get(&TenantId::new("t1")).unwrap();
        assert_eq!(signer.usage_count(), 1);

        let snapshot = pipeline.reprocess(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
        assert_eq!(signer.usage_count(), 2);
        let submitted = sri.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].matches("<ds:SignatureValue").count(), 1);
    }

    #[tokio::test]
    async fn quota_blocks_without_changes() {
        let collaborators = Collaborators {
            billing: Arc::new(QuotaBilling::new()),
            ..Collaborators::in_memory()
        };
        let (pipeline, sri) = pipeline_with(ScriptedSri::new(), collaborators);
        let id = pipeline.create_draft(invoice("t1")).unwrap();

        let failure = pipeline.process(id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::QuotaExceeded(_)));
        assert_eq!(failure.status(), Some(DocumentStatus::Draft));
        assert!(pipeline.get_status(id).unwrap().access_key.is_none());
        assert!(sri.submitted().is_empty());
    }

    #[tokio::test]
    async fn missing_certificate_aborts_to_error() {
        let (pipeline, _) = pipeline(ScriptedSri::new());
        let id = pipeline.create_draft(invoice("other")).unwrap();

        let failure = pipeline.process(id).await.unwrap_err();
        assert!(matches!(
            failure.source,
            PipelineError::Certificate(CertificateError::NotFound { .. })
        ));
        assert_eq!(failure.status(), Some(DocumentStatus::Error));
    }

    #[tokio::test]
    async fn reprocess_recovers_from_error() {
        let (pipeline, _) = pipeline(ScriptedSri::new().reception(accepted()));
        let id = pipeline.create_draft(invoice("other")).unwrap();
        pipeline.process(id).await.unwrap_err();

        let key = rsa_key();
        let der = certificate_der(
            key,
            leaf_profile(),
            Validity::from_now(std::time::Duration::from_secs(3600)).unwrap(),
        );
        let key_der = key.to_pkcs8_der().unwrap();
        pipeline.certificates.insert(
            CertificateBundle::from_der(TenantId::new("other"), &der, key_der.as_bytes(), vec![])
                .unwrap(),
        );
        let snapshot = pipeline.reprocess(id).await.unwrap();
        assert_eq!(snapshot.status, DocumentStatus::Sent);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn authorized_invoice_can_be_cancelled() {
        let (pipeline, _) = pipeline(
            ScriptedSri::new()
                .reception(accepted())
                .authorization(Ok(AuthorizationOutcome::Authorized {
                    number: "1501202401179173740900110010010000000011234567814".into(),
                    authorized_at: None,
                    messages: vec![],
                })),
        );
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        pipeline.process(id).await.unwrap();

        let (outcome, snapshot) = pipeline.check_authorization(id).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Authorized { .. }));
        assert_eq!(snapshot.status, DocumentStatus::Authorized);
        assert_eq!(snapshot.last_good_status, Some(DocumentStatus::Authorized));

        let cancelled = pipeline.cancel(id).unwrap();
        assert_eq!(cancelled.status, DocumentStatus::Cancelled);
        assert!(matches!(
            pipeline.process(id).await.unwrap_err().source,
            PipelineError::Transition(_)
        ));
    }

    #[tokio::test]
    async fn waiting_surfaces_rejection() {
        let (pipeline, _) = pipeline(
            ScriptedSri::new()
                .reception(accepted())
                .authorization(Ok(AuthorizationOutcome::Rejected {
                    messages: vec![SriMessage {
                        identifier: "39".into(),
                        message: "FIRMA INVALIDA".into(),
                        additional_info: None,
                        kind: Some("ERROR".into()),
                    }],
                })),
        );
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        pipeline.process(id).await.unwrap();

        match pipeline.wait_for_authorization(id).await {
            Err(PipelineError::AuthorizationRejected(message)) => {
                assert_eq!(message, "Error 39: FIRMA INVALIDA")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pipeline.get_status(id).unwrap().status, DocumentStatus::Rejected);
    }

    #[tokio::test]
    async fn cancel_requires_authorized_document() {
        let (pipeline, _) = pipeline(ScriptedSri::new());
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        assert!(matches!(
            pipeline.cancel(id),
            Err(PipelineError::Transition(_))
        ));
    }

    #[tokio::test]
    async fn other_tenant_is_forbidden() {
        let (pipeline, sri) = pipeline(ScriptedSri::new().reception(accepted()));
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        let intruder = Principal::TenantToken {
            tenant_id: TenantId::new("t2"),
            token_id: "tok".into(),
        };

        let failure = pipeline.process_as(&intruder, id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::Forbidden(_)));
        assert!(failure.snapshot.is_none());
        assert!(sri.submitted().is_empty());

        let owner = Principal::User {
            user_id: "u1".into(),
            tenant_id: TenantId::new("t1"),
        };
        assert!(pipeline.process_as(&owner, id).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_processing_is_refused() {
        let (pipeline, _) = pipeline(ScriptedSri::new());
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        let _guard = pipeline.locks.try_acquire(id).unwrap();
        let failure = pipeline.process(id).await.unwrap_err();
        assert!(matches!(failure.source, PipelineError::Busy(_)));
        assert_eq!(failure.status(), Some(DocumentStatus::Draft));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sent_documents_are_polled_to_authorization() {
        const DOCUMENTS: usize = 16;
        let sri = (0..DOCUMENTS).fold(ScriptedSri::new(), |sri, _| {
            sri.reception(accepted())
                .authorization(Ok(AuthorizationOutcome::Authorized {
                    number: "1501202401179173740900110010010000000011234567814".into(),
                    authorized_at: None,
                    messages: vec![],
                }))
        });
        let certificates = Arc::new(CertificateStore::new());
        certificates.insert(bundle());
        let config = Config::new(Environment::Test).with_poll(crate::config::PollPolicy {
            short_delay_secs: 0,
            ..Default::default()
        });
        let pipeline = Pipeline::new(
            config,
            certificates,
            Arc::new(sri),
            Collaborators::in_memory(),
        );

        let mut ids = Vec::new();
        for _ in 0..DOCUMENTS {
            let id = pipeline.create_draft(invoice("t1")).unwrap();
            let snapshot = pipeline.process(id).await.unwrap();
            assert_eq!(snapshot.status, DocumentStatus::Sent);
            ids.push(id);
        }

        let settled = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let statuses: Vec<_> = ids
                    .iter()
                    .map(|id| pipeline.get_status(*id).unwrap().status)
                    .collect();
                if statuses.iter().all(|s| *s != DocumentStatus::Sent) {
                    return statuses;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("every sent document is decided");
        assert!(settled.iter().all(|s| *s == DocumentStatus::Authorized));
    }

    #[tokio::test]
    async fn snapshot_serializes_for_callers() {
        let (pipeline, _) = pipeline(ScriptedSri::new().reception(accepted()));
        let id = pipeline.create_draft(invoice("t1")).unwrap();
        let snapshot = pipeline.process(id).await.unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "SENT");
        assert_eq!(json["number"], "001-001-000000001");
        assert_eq!(json["document_type"], "INVOICE");
    }

    #[test]
    fn unknown_document_is_not_found() {
        let (pipeline, _) = pipeline(ScriptedSri::new());
        assert!(matches!(
            pipeline.get_status(DocumentId::new()),
            Err(PipelineError::NotFound(_))
        ));
    }
}
