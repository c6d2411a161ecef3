//! Services the pipeline consumes, with in-memory implementations.
use crate::document::{Document, DocumentId, DocumentType, TenantId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("artifact {0} not found")]
    ArtifactNotFound(String),
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Quota check performed before a document consumes SRI resources.
#[async_trait]
pub trait BillingGate: Send + Sync {
    /// Reserve one document for `tenant`. `false` blocks processing.
    async fn reserve(&self, tenant: &TenantId) -> bool;
}

/// Blob storage for generated XML.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` and return a locator for [`ArtifactStore::load`].
    async fn save(&self, name: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn load(&self, locator: &str) -> Result<Vec<u8>, StoreError>;
}

/// Persistence of documents and their sequence counters.
pub trait DocumentRepository: Send + Sync {
    fn load(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Insert or replace.
    fn save(&self, document: &Document) -> Result<(), StoreError>;

    /// Next unused sequence for `(tenant, document_type)`, starting at 1.
    fn next_sequence(
        &self,
        tenant: &TenantId,
        document_type: DocumentType,
    ) -> Result<u64, StoreError>;
}

/// Lets every tenant through.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBilling;

#[async_trait]
impl BillingGate for UnlimitedBilling {
    async fn reserve(&self, _tenant: &TenantId) -> bool {
        true
    }
}

/// Fixed number of documents per tenant. Unknown tenants get nothing.
#[derive(Debug, Default)]
pub struct QuotaBilling {
    remaining: Mutex<HashMap<TenantId, u32>>,
}

impl QuotaBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(self, tenant: TenantId, documents: u32) -> Self {
        self.remaining.lock().insert(tenant, documents);
        self
    }

    pub fn remaining(&self, tenant: &TenantId) -> u32 {
        self.remaining.lock().get(tenant).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BillingGate for QuotaBilling {
    async fn reserve(&self, tenant: &TenantId) -> bool {
        match self.remaining.lock().get_mut(tenant) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryArtifacts {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifacts {
    async fn save(&self, name: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let locator = format!("mem://{name}");
        self.blobs.write().insert(locator.clone(), bytes);
        Ok(locator)
    }

    async fn load(&self, locator: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound(locator.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDocuments {
    documents: RwLock<HashMap<DocumentId, Document>>,
    sequences: Mutex<HashMap<(TenantId, DocumentType), u64>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentRepository for InMemoryDocuments {
    fn load(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().get(&id).cloned())
    }

    fn save(&self, document: &Document) -> Result<(), StoreError> {
        if let Some(sequence) = document.sequence() {
            // Keep the counter ahead of caller-assigned sequences.
            let mut sequences = self.sequences.lock();
            let counter = sequences
                .entry((document.tenant_id().clone(), document.document_type()))
                .or_insert(0);
            *counter = (*counter).max(sequence);
        }
        self.documents
            .write()
            .insert(document.id(), document.clone());
        Ok(())
    }

    fn next_sequence(
        &self,
        tenant: &TenantId,
        document_type: DocumentType,
    ) -> Result<u64, StoreError> {
        let mut sequences = self.sequences.lock();
        let counter = sequences
            .entry((tenant.clone(), document_type))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_per_tenant_and_type() {
        let repo = InMemoryDocuments::new();
        let acme = TenantId::new("acme");
        let other = TenantId::new("other");
        assert_eq!(repo.next_sequence(&acme, DocumentType::Invoice).unwrap(), 1);
        assert_eq!(repo.next_sequence(&acme, DocumentType::Invoice).unwrap(), 2);
        assert_eq!(repo.next_sequence(&acme, DocumentType::CreditNote).unwrap(), 1);
        assert_eq!(repo.next_sequence(&other, DocumentType::Invoice).unwrap(), 1);
    }

    #[tokio::test]
    async fn quota_runs_out() {
        let tenant = TenantId::new("acme");
        let billing = QuotaBilling::new().with_quota(tenant.clone(), 1);
        assert!(billing.reserve(&tenant).await);
        assert!(!billing.reserve(&tenant).await);
        assert!(!billing.reserve(&TenantId::new("nobody")).await);
        assert_eq!(billing.remaining(&tenant), 0);
    }

    #[tokio::test]
    async fn artifacts_round_trip_by_locator() {
        let store = InMemoryArtifacts::new();
        let locator = store.save("a.xml", b"<a/>".to_vec()).await.unwrap();
        assert_eq!(store.load(&locator).await.unwrap(), b"<a/>");
        assert!(matches!(
            store.load("mem://missing").await,
            Err(StoreError::ArtifactNotFound(_))
        ));
    }
}
