//! Follow-up of sent documents until the SRI decides on them.
use crate::config::PollPolicy;
use crate::document::{Authorization, DocumentId, DocumentStatus, TransitionError};
use crate::pipeline::DocumentLocks;
use crate::pipeline::collaborators::{DocumentRepository, StoreError};
use crate::response_log::{LogEntry, Operation, ResponseLog};
use crate::submission::{AuthorizationOutcome, SriService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wait before retrying a poll that found the document locked.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);
/// Consecutive lock contentions `run` tolerates before giving up.
const MAX_LOCK_RETRIES: u32 = 240;

/// Result of a single authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Authorized { number: String },
    Rejected { message: String },
    /// Still undecided; check again after `delay`.
    Retry { next_attempt: u32, delay: Duration },
    /// Too long since the document was sent. It stays `SENT`.
    CeilingReached,
    /// No attempts left. It stays `SENT`.
    Exhausted,
    /// Another task holds the document's lock; check again shortly.
    Locked,
    /// Nothing to do: the document is not `SENT` or is missing.
    Skipped { reason: String },
}

impl PollOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, PollOutcome::Retry { .. } | PollOutcome::Locked)
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

pub struct AuthorizationPoller {
    repository: Arc<dyn DocumentRepository>,
    sri: Arc<dyn SriService>,
    log: Arc<dyn ResponseLog>,
    locks: Arc<DocumentLocks>,
    policy: PollPolicy,
}

impl AuthorizationPoller {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        sri: Arc<dyn SriService>,
        log: Arc<dyn ResponseLog>,
        locks: Arc<DocumentLocks>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            repository,
            sri,
            log,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Query the SRI once. Safe to call repeatedly and concurrently.
    #[tracing::instrument(skip(self), fields(document_id = %id))]
    pub async fn poll_once(&self, id: DocumentId, attempt: u32) -> Result<PollOutcome, PollError> {
        let Some(_guard) = self.locks.try_acquire(id) else {
            return Ok(PollOutcome::Locked);
        };
        let Some(mut doc) = self.repository.load(id)? else {
            return Ok(skipped("document not found"));
        };
        if doc.status() != DocumentStatus::Sent {
            return Ok(skipped(&format!("status is {}", doc.status())));
        }
        let Some(key) = doc.access_key().cloned() else {
            return Ok(skipped("document has no access key"));
        };
        if let Some(sent_at) = doc.sent_at() {
            let elapsed = (Utc::now() - sent_at).to_std().unwrap_or_default();
            if elapsed >= self.policy.ceiling() {
                warn!(?elapsed, "authorization ceiling reached, leaving document SENT");
                return Ok(PollOutcome::CeilingReached);
            }
        }
        if attempt > self.policy.max_attempts {
            return Ok(PollOutcome::Exhausted);
        }

        debug!(attempt, access_key = %key, "querying authorization");
        match self.sri.query_authorization(&key).await {
            Ok(exchange) => {
                let outcome = exchange.outcome;
                self.log.append(LogEntry::new(
                    id,
                    Operation::Authorization,
                    outcome.code(),
                    &outcome.message(),
                    exchange.raw,
                ));
                match outcome {
                    AuthorizationOutcome::Authorized {
                        number,
                        authorized_at,
                        ..
                    } => {
                        doc.set_authorization(Authorization {
                            number: number.clone(),
                            authorized_at,
                        });
                        doc.transition_to(DocumentStatus::Authorized)?;
                        self.repository.save(&doc)?;
                        info!(attempt, number = %number, "document authorized");
                        Ok(PollOutcome::Authorized { number })
                    }
                    AuthorizationOutcome::Rejected { .. } => {
                        let message = outcome.message();
                        doc.transition_to(DocumentStatus::Rejected)?;
                        doc.set_last_error(message.clone());
                        self.repository.save(&doc)?;
                        warn!(attempt, %message, "authorization rejected");
                        Ok(PollOutcome::Rejected { message })
                    }
                    AuthorizationOutcome::Pending { .. } => {
                        debug!(attempt, "authorization pending");
                        Ok(self.next(attempt))
                    }
                }
            }
            Err(err) => {
                warn!(attempt, error = %err, "authorization query failed");
                self.log.append(LogEntry::new(
                    id,
                    Operation::Authorization,
                    &err.response_code(),
                    &err.to_string(),
                    err.payload(),
                ));
                // A failed query never moves the document backwards.
                if let Some(status) = self.log.last_successful_status(id) {
                    if doc.restore_status(status) {
                        self.repository.save(&doc)?;
                    }
                }
                Ok(self.next(attempt))
            }
        }
    }

    fn next(&self, attempt: u32) -> PollOutcome {
        if attempt >= self.policy.max_attempts {
            PollOutcome::Exhausted
        } else {
            PollOutcome::Retry {
                next_attempt: attempt + 1,
                delay: self.policy.delay_after(attempt),
            }
        }
    }

    /// Poll until the document is decided or polling gives up.
    pub async fn run(&self, id: DocumentId) -> PollOutcome {
        let mut attempt = 1;
        let mut contended = 0;
        loop {
            match self.poll_once(id, attempt).await {
                Ok(PollOutcome::Retry {
                    next_attempt,
                    delay,
                }) => {
                    contended = 0;
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
                Ok(PollOutcome::Locked) if contended < MAX_LOCK_RETRIES => {
                    contended += 1;
                    debug!(document_id = %id, attempt, "document locked, polling again shortly");
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Ok(outcome) => {
                    debug!(document_id = %id, ?outcome, "polling finished");
                    return outcome;
                }
                Err(err) => {
                    warn!(document_id = %id, error = %err, "polling aborted");
                    return skipped(&err.to_string());
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, id: DocumentId) -> JoinHandle<PollOutcome> {
        tokio::spawn(async move { self.run(id).await })
    }
}

fn skipped(reason: &str) -> PollOutcome {
    PollOutcome::Skipped {
        reason: reason.to_string(),
    }
}
