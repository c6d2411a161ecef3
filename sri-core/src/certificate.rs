//! Tenant signing certificates loaded from PKCS#12 bundles.
use crate::document::TenantId;
use chrono::{DateTime, Utc};
use const_oid::db::rfc5280::ID_CE_KEY_USAGE;
use p12_keystore::{KeyStore, KeyStoreEntry};
use parking_lot::RwLock;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::{
    Certificate,
    der::{Decode, Encode},
    ext::pkix::KeyUsage,
};

/// Days before expiry at which validation starts warning.
const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to open PKCS#12 archive: {0}")]
    Pkcs12(String),
    #[error("PKCS#12 archive holds no private key with a certificate")]
    NoPrivateKey,
    #[error("invalid certificate DER: {0}")]
    Der(#[from] x509_cert::der::Error),
    #[error("unsupported private key (RSA PKCS#8 expected): {0}")]
    UnsupportedKey(String),
    #[error("private key does not match the certificate public key")]
    KeyMismatch,
    #[error("no certificate loaded for tenant {tenant}")]
    NotFound { tenant: TenantId },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate rejected: {0}")]
    Invalid(String),
}

/// Outcome of [`CertificateBundle::check_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateCheck {
    pub ok: bool,
    pub message: String,
}

/// Private key, leaf certificate and chain of one tenant.
///
/// The private key never leaves the crate; only the signature engine reads it.
pub struct CertificateBundle {
    tenant_id: TenantId,
    certificate: Certificate,
    certificate_der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    private_key: RsaPrivateKey,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    digital_signature: Option<bool>,
    usage: AtomicU64,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("tenant_id", &self.tenant_id)
            .field("subject", &self.subject())
            .field("serial", &self.serial_decimal())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("usage", &self.usage_count())
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    /// Build a bundle from a DER certificate and a PKCS#8 DER RSA key.
    pub fn from_der(
        tenant_id: TenantId,
        certificate_der: &[u8],
        private_key_der: &[u8],
        chain: Vec<Vec<u8>>,
    ) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_der(certificate_der)?;
        let private_key = RsaPrivateKey::from_pkcs8_der(private_key_der)
            .map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;

        let spki_der = certificate.tbs_certificate.subject_public_key_info.to_der()?;
        let public_key = RsaPublicKey::from_public_key_der(&spki_der)
            .map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;
        if private_key.to_public_key() != public_key {
            return Err(CertificateError::KeyMismatch);
        }

        let validity = &certificate.tbs_certificate.validity;
        let not_before = to_utc(validity.not_before.to_unix_duration())?;
        let not_after = to_utc(validity.not_after.to_unix_duration())?;
        let digital_signature = digital_signature_usage(&certificate)?;

        Ok(Self {
            tenant_id,
            certificate,
            certificate_der: certificate_der.to_vec(),
            chain,
            private_key,
            not_before,
            not_after,
            digital_signature,
            usage: AtomicU64::new(0),
        })
    }

    /// Open a PKCS#12 archive.
    ///
    /// Archives issued for signing often carry several keys (signing and
    /// encryption); the one whose certificate allows digitalSignature wins,
    /// otherwise the first usable key is used. Entries that are not RSA or do
    /// not parse are skipped; their error is returned only if nothing else loads.
    pub fn from_pkcs12(
        tenant_id: TenantId,
        data: &[u8],
        passphrase: &str,
    ) -> Result<Self, CertificateError> {
        let keystore = KeyStore::from_pkcs12(data, passphrase)
            .map_err(|e| CertificateError::Pkcs12(e.to_string()))?;

        let mut fallback = None;
        let mut last_error = None;
        for (alias, entry) in keystore.entries() {
            let KeyStoreEntry::PrivateKeyChain(chain) = entry else {
                continue;
            };
            let Some((leaf, rest)) = chain.chain().split_first() else {
                continue;
            };
            let rest: Vec<Vec<u8>> = rest.iter().map(|c| c.as_der().to_vec()).collect();
            let bundle = match Self::from_der(tenant_id.clone(), leaf.as_der(), chain.key(), rest) {
                Ok(bundle) => bundle,
                Err(err) => {
                    warn!(tenant = %tenant_id, alias = %alias, error = %err, "skipping unusable PKCS#12 entry");
                    last_error = Some(err);
                    continue;
                }
            };
            if bundle.digital_signature == Some(true) {
                debug!(tenant = %tenant_id, alias = %alias, "selected signing key from PKCS#12");
                return Ok(bundle);
            }
            if fallback.is_none() {
                fallback = Some(bundle);
            }
        }
        match (fallback, last_error) {
            (Some(bundle), _) => Ok(bundle),
            (None, Some(err)) => Err(err),
            (None, None) => Err(CertificateError::NoPrivateKey),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn issuer_name(&self) -> String {
        self.certificate.tbs_certificate.issuer.to_string()
    }

    pub fn serial_decimal(&self) -> String {
        serial_bytes_to_decimal_string(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub(crate) fn record_use(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    /// Validity window and key usage at `now`.
    ///
    /// A missing key-usage extension only produces a warning.
    pub fn check_at(&self, now: DateTime<Utc>) -> CertificateCheck {
        if now < self.not_before {
            return CertificateCheck {
                ok: false,
                message: format!("certificate not valid before {}", self.not_before),
            };
        }
        if now > self.not_after {
            return CertificateCheck {
                ok: false,
                message: format!("certificate expired on {}", self.not_after),
            };
        }

        let mut notes = Vec::new();
        match self.digital_signature {
            Some(false) => {
                return CertificateCheck {
                    ok: false,
                    message: "certificate key usage does not allow digitalSignature".into(),
                };
            }
            None => {
                warn!(tenant = %self.tenant_id, "certificate has no key usage extension");
                notes.push("no key usage extension".to_string());
            }
            Some(true) => {}
        }

        let days_left = (self.not_after - now).num_days();
        if days_left <= EXPIRY_WARNING_DAYS {
            notes.push(format!("expires in {days_left} days"));
        }

        let message = if notes.is_empty() {
            "certificate valid".to_string()
        } else {
            format!("certificate valid ({})", notes.join("; "))
        };
        CertificateCheck { ok: true, message }
    }
}

fn to_utc(since_epoch: std::time::Duration) -> Result<DateTime<Utc>, CertificateError> {
    let secs = i64::try_from(since_epoch.as_secs())
        .map_err(|_| CertificateError::Invalid("validity out of range".into()))?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::Invalid("validity out of range".into()))
}

fn digital_signature_usage(certificate: &Certificate) -> Result<Option<bool>, CertificateError> {
    let Some(extensions) = &certificate.tbs_certificate.extensions else {
        return Ok(None);
    };
    for ext in extensions {
        if ext.extn_id == ID_CE_KEY_USAGE {
            let usage = KeyUsage::from_der(ext.extn_value.as_bytes())?;
            return Ok(Some(usage.digital_signature()));
        }
    }
    Ok(None)
}

/// Big-endian serial bytes as a decimal string.
pub(crate) fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    let mut digits = vec![0u8];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    while digits.len() > 1 && digits.last() == Some(&0) {
        digits.pop();
    }
    digits.iter().rev().map(|d| char::from(b'0' + d)).collect()
}

/// Per-tenant certificate cache.
///
/// Reads are concurrent; a reload swaps the `Arc` under the write lock, so
/// signers holding the previous bundle finish with it undisturbed.
#[derive(Debug, Default)]
pub struct CertificateStore {
    bundles: RwLock<HashMap<TenantId, Arc<CertificateBundle>>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a PKCS#12 archive and make it the tenant's current bundle.
    pub fn load(
        &self,
        tenant_id: &TenantId,
        bundle_bytes: &[u8],
        passphrase: &str,
    ) -> Result<Arc<CertificateBundle>, CertificateError> {
        let bundle = CertificateBundle::from_pkcs12(tenant_id.clone(), bundle_bytes, passphrase)?;
        Ok(self.insert(bundle))
    }

    pub fn load_file(
        &self,
        tenant_id: &TenantId,
        path: impl AsRef<Path>,
        passphrase: &str,
    ) -> Result<Arc<CertificateBundle>, CertificateError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| CertificateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.load(tenant_id, &bytes, passphrase)
    }

    /// Install an already parsed bundle, replacing any previous one.
    pub fn insert(&self, bundle: CertificateBundle) -> Arc<CertificateBundle> {
        let bundle = Arc::new(bundle);
        let tenant = bundle.tenant_id().clone();
        info!(
            tenant = %tenant,
            subject = %bundle.subject(),
            not_after = %bundle.not_after(),
            "certificate loaded"
        );
        self.bundles.write().insert(tenant, Arc::clone(&bundle));
        bundle
    }

    pub fn get(&self, tenant_id: &TenantId) -> Result<Arc<CertificateBundle>, CertificateError> {
        self.bundles
            .read()
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CertificateError::NotFound {
                tenant: tenant_id.clone(),
            })
    }

    /// Drop the cached bundle. Returns whether one was present.
    pub fn invalidate(&self, tenant_id: &TenantId) -> bool {
        let removed = self.bundles.write().remove(tenant_id).is_some();
        if removed {
            info!(tenant = %tenant_id, "certificate invalidated");
        }
        removed
    }

    pub fn validate(bundle: &CertificateBundle) -> CertificateCheck {
        bundle.check_at(Utc::now())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rsa::pkcs8::EncodePrivateKey;
    use std::time::Duration;
    use x509_cert::{builder::Profile, time::Validity};

    #[test]
    fn serial_to_decimal() {
        assert_eq!(serial_bytes_to_decimal_string(&[0x01, 0x02, 0x03]), "66051");
        assert_eq!(serial_bytes_to_decimal_string(&[0x00]), "0");
        assert_eq!(
            serial_bytes_to_decimal_string(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            "18446744073709551615"
        );
    }

    #[test]
    fn leaf_certificate_validates() {
        let bundle = bundle();
        let check = CertificateStore::validate(&bundle);
        assert!(check.ok, "{}", check.message);
        assert_eq!(check.message, "certificate valid");
        assert_eq!(bundle.serial_decimal(), "66051");
        assert!(bundle.issuer_name().contains("CN=AC Prueba"));
    }

    #[test]
    fn expired_and_not_yet_valid_fail() {
        let bundle = bundle();
        let past = bundle.not_before() - ChronoDuration::days(1);
        assert!(!bundle.check_at(past).ok);
        let future = bundle.not_after() + ChronoDuration::days(1);
        let check = bundle.check_at(future);
        assert!(!check.ok);
        assert!(check.message.contains("expired"));
    }

    #[test]
    fn near_expiry_is_noted() {
        let bundle = bundle();
        let check = bundle.check_at(bundle.not_after() - ChronoDuration::days(10));
        assert!(check.ok);
        assert!(check.message.contains("expires in 9 days") || check.message.contains("expires in 10 days"));
    }

    #[test]
    fn missing_key_usage_is_only_a_warning() {
        let bundle = bundle_with(
            Profile::Manual { issuer: None },
            Validity::from_now(Duration::from_secs(3600 * 24 * 90)).unwrap(),
        );
        let check = CertificateStore::validate(&bundle);
        assert!(check.ok);
        assert!(check.message.contains("no key usage extension"));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let other = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let der = certificate_der(
            rsa_key(),
            leaf_profile(),
            Validity::from_now(Duration::from_secs(3600)).unwrap(),
        );
        let key_der = other.to_pkcs8_der().unwrap();
        let err = CertificateBundle::from_der(TenantId::new("t1"), &der, key_der.as_bytes(), vec![])
            .unwrap_err();
        assert!(matches!(err, CertificateError::KeyMismatch));
    }

    #[test]
    fn store_replaces_and_invalidates() {
        let store = CertificateStore::new();
        let tenant = TenantId::new("t1");
        assert!(matches!(store.get(&tenant), Err(CertificateError::NotFound { .. })));

        let first = store.insert(bundle());
        let second = store.insert(bundle());
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&store.get(&tenant).unwrap(), &second));

        assert!(store.invalidate(&tenant));
        assert!(!store.invalidate(&tenant));
        assert!(store.get(&tenant).is_err());
    }

    #[test]
    fn usage_counter_increments() {
        let bundle = bundle();
        bundle.record_use();
        bundle.record_use();
        assert_eq!(bundle.usage_count(), 2);
    }

    fn pkcs12(entries: &[(&str, Vec<u8>, &[u8])]) -> Vec<u8> {
        let mut keystore = KeyStore::new();
        for (idx, (alias, cert_der, key_der)) in entries.iter().enumerate() {
            let cert = p12_keystore::Certificate::from_der(cert_der).unwrap();
            let chain = p12_keystore::PrivateKeyChain::new(key_der, [idx as u8 + 1], [cert]);
            keystore.add_entry(alias, KeyStoreEntry::PrivateKeyChain(chain));
        }
        keystore.writer("secreto").write().unwrap()
    }

    fn year() -> Validity {
        Validity::from_now(Duration::from_secs(365 * 24 * 3600)).unwrap()
    }

    #[test]
    fn pkcs12_prefers_signing_key() {
        let key_der = rsa_key().to_pkcs8_der().unwrap();
        let encryption = certificate_der(rsa_key(), Profile::Manual { issuer: None }, year());
        let signing = certificate_der(rsa_key(), leaf_profile(), year());
        let archive = pkcs12(&[
            ("a-encryption", encryption, key_der.as_bytes()),
            ("b-signing", signing.clone(), key_der.as_bytes()),
        ]);

        let store = CertificateStore::new();
        let bundle = store.load(&TenantId::new("t1"), &archive, "secreto").unwrap();
        assert_eq!(bundle.certificate_der(), signing.as_slice());
        assert_eq!(CertificateStore::validate(&bundle).message, "certificate valid");
    }

    #[test]
    fn pkcs12_skips_unusable_keys_and_falls_back() {
        let key_der = rsa_key().to_pkcs8_der().unwrap();
        let plain = certificate_der(rsa_key(), Profile::Manual { issuer: None }, year());
        let archive = pkcs12(&[
            ("a-ec", plain.clone(), b"not an rsa key".as_slice()),
            ("b-plain", plain.clone(), key_der.as_bytes()),
        ]);

        let bundle = CertificateBundle::from_pkcs12(TenantId::new("t1"), &archive, "secreto").unwrap();
        assert_eq!(bundle.certificate_der(), plain.as_slice());
        assert_eq!(bundle.digital_signature, None);
    }

    #[test]
    fn pkcs12_without_usable_key_reports_why() {
        let plain = certificate_der(rsa_key(), leaf_profile(), year());
        let archive = pkcs12(&[("only", plain, b"not an rsa key".as_slice())]);
        let err = CertificateBundle::from_pkcs12(TenantId::new("t1"), &archive, "secreto").unwrap_err();
        assert!(matches!(err, CertificateError::UnsupportedKey(_)));

        let err = CertificateBundle::from_pkcs12(TenantId::new("t1"), &archive, "otra").unwrap_err();
        assert!(matches!(err, CertificateError::Pkcs12(_)));
    }

    #[test]
    fn garbage_pkcs12_is_rejected() {
        let err = CertificateBundle::from_pkcs12(TenantId::new("t1"), b"not a p12", "pw").unwrap_err();
        assert!(matches!(err, CertificateError::Pkcs12(_)));
    }
}
