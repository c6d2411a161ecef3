//! Enveloped XAdES-BES signatures over SRI documents.
use crate::certificate::CertificateBundle;
use crate::document::xml::constants::{COMPROBANTE_ID, DS_NS, XADES_NS, XML_DECLARATION};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};
use quick_xml::se::Serializer as QuickXmlSerializer;
use rsa::{Pkcs1v15Sign, RsaPublicKey, traits::PublicKeyParts};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

/// Share of structural checks that must pass for a signature to be accepted.
pub const ACCEPTANCE_THRESHOLD: f64 = 0.9;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Signing error: {0}")]
    SigningError(String),
}

/// Element ids tying the signature parts together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureIds {
    suffix: u32,
}

impl SignatureIds {
    /// Derive a stable numeric suffix from the document digest.
    fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest[..4]);
        Self {
            suffix: 100_000 + u32::from_be_bytes(bytes) % 900_000,
        }
    }

    pub fn signature(&self) -> String {
        format!("Signature{}", self.suffix)
    }

    fn signed_info(&self) -> String {
        format!("Signature-SignedInfo{}", self.suffix)
    }

    fn signed_properties(&self) -> String {
        format!("Signature{0}-SignedProperties{0}", self.suffix)
    }

    fn signed_properties_ref(&self) -> String {
        format!("SignedPropertiesID{}", self.suffix)
    }

    fn document_ref(&self) -> String {
        format!("Reference-ID-{}", self.suffix)
    }

    fn signature_value(&self) -> String {
        format!("SignatureValue{}", self.suffix)
    }

    fn key_info(&self) -> String {
        format!("Certificate{}", self.suffix)
    }

    fn object(&self) -> String {
        format!("Signature{0}-Object{0}", self.suffix)
    }
}

/// Values embedded in and produced by a signature.
#[derive(Debug, Clone)]
pub struct SignedProperties {
    ids: SignatureIds,
    document_digest: String,
    signed_properties_digest: String,
    signature_value: String,
    certificate: String,
    certificate_digest: String,
    issuer: String,
    serial: String,
    modulus: String,
    exponent: String,
    signing_time: DateTime<Utc>,
}

impl SignedProperties {
    pub fn signature_id(&self) -> String {
        self.ids.signature()
    }

    pub fn document_digest(&self) -> &str {
        &self.document_digest
    }

    pub fn signed_properties_digest(&self) -> &str {
        &self.signed_properties_digest
    }

    pub fn signature_value(&self) -> &str {
        &self.signature_value
    }

    pub fn certificate_digest(&self) -> &str {
        &self.certificate_digest
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    fn signing_time_text(&self) -> String {
        self.signing_time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Result of the post-signing structural review.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureReport {
    pub passed: usize,
    pub total: usize,
    pub failures: Vec<String>,
}

impl StructureReport {
    pub fn score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total as f64
    }

    pub fn accepted(&self) -> bool {
        self.score() >= ACCEPTANCE_THRESHOLD
    }
}

/// A signed document.
#[derive(Debug, Clone)]
pub struct SignedDocument {
    xml: String,
    properties: SignedProperties,
    report: StructureReport,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn properties(&self) -> &SignedProperties {
        &self.properties
    }

    pub fn report(&self) -> &StructureReport {
        &self.report
    }

    /// The signed XML without its declaration, as sent to reception.
    pub fn body_without_declaration(&self) -> &str {
        strip_declaration(&self.xml)
    }
}

pub(crate) fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

/// Signs documents with a tenant's certificate bundle.
pub struct DocumentSigner<'a> {
    bundle: &'a CertificateBundle,
}

impl<'a> DocumentSigner<'a> {
    pub fn new(bundle: &'a CertificateBundle) -> Self {
        Self { bundle }
    }

    pub fn sign_xml(&self, xml: &str) -> Result<SignedDocument, SigningError> {
        self.sign_xml_at(xml, Utc::now())
    }

    /// Sign with an explicit signing time. Any existing signature is replaced.
    pub fn sign_xml_at(
        &self,
        xml: &str,
        signing_time: DateTime<Utc>,
    ) -> Result<SignedDocument, SigningError> {
        let mut doc = Parser::default()
            .parse_string(xml)
            .map_err(|e| SigningError::SigningError(format!("XML parse error: {e:?}")))?;
        let mut root = doc
            .get_root_element()
            .ok_or_else(|| SigningError::SigningError("document has no root element".into()))?;
        if root.get_attribute("id").as_deref() != Some(COMPROBANTE_ID) {
            return Err(SigningError::SigningError(format!(
                "root element must carry id=\"{COMPROBANTE_ID}\""
            )));
        }
        let removed = remove_signatures(&doc)?;
        if removed > 0 {
            debug!(removed, "replacing existing signature");
        }

        let document_digest_raw = document_digest(&doc)?;
        let ids = SignatureIds::from_digest(&document_digest_raw);

        let certificate_der = self.bundle.certificate_der();
        let public_key = self.bundle.private_key().to_public_key();
        let mut props = SignedProperties {
            ids,
            document_digest: Base64::encode_string(&document_digest_raw),
            signed_properties_digest: String::new(),
            signature_value: String::new(),
            certificate: Base64::encode_string(certificate_der),
            certificate_digest: Base64::encode_string(&Sha1::digest(certificate_der)),
            issuer: self.bundle.issuer_name(),
            serial: self.bundle.serial_decimal(),
            modulus: Base64::encode_string(&public_key.n().to_bytes_be()),
            exponent: Base64::encode_string(&public_key.e().to_bytes_be()),
            signing_time: signing_time.trunc_subsecs(0),
        };

        // SignedProperties are digested in the context of the document.
        let draft_xml = signature_fragment(&props)?;
        let mut draft = import_fragment(&mut doc, &draft_xml)?;
        root.add_child(&mut draft)
            .map_err(|e| SigningError::SigningError(format!("failed to attach draft: {e}")))?;
        let signed_props_c14n = canonicalize_node(
            &doc,
            &format!("//*[@Id='{}']", props.ids.signed_properties()),
        );
        draft.unlink();
        props.signed_properties_digest =
            Base64::encode_string(&Sha256::digest(signed_props_c14n?.as_bytes()));

        let final_xml = signature_fragment(&props)?;
        let fragment = Parser::default()
            .parse_string(&final_xml)
            .map_err(|e| SigningError::SigningError(format!("signature parse error: {e:?}")))?;
        let signed_info_c14n = canonicalize_node(&fragment, "/ds:Signature/ds:SignedInfo")?;
        let signed_info_digest = Sha256::digest(signed_info_c14n.as_bytes());
        let signature = self
            .bundle
            .private_key()
            .sign(Pkcs1v15Sign::new::<Sha256>(), &signed_info_digest)
            .map_err(|e| SigningError::SigningError(format!("RSA signing failed: {e}")))?;
        props.signature_value = Base64::encode_string(&signature);

        let ctx = xpath_context(&fragment)?;
        set_xpath_text(&ctx, "/ds:Signature/ds:SignatureValue", &props.signature_value)?;

        let mut signature_node = fragment
            .get_root_element()
            .ok_or_else(|| SigningError::SigningError("missing signature root".into()))?;
        signature_node.unlink();
        let mut signature_node = doc
            .import_node(&mut signature_node)
            .map_err(|_| SigningError::SigningError("failed to import signature".into()))?;
        root.add_child(&mut signature_node)
            .map_err(|e| SigningError::SigningError(format!("failed to attach signature: {e}")))?;

        normalize_base64_text(&doc)?;
        let signed_xml = format!("{XML_DECLARATION}\n{}", doc.node_to_string(&root));
        self.bundle.record_use();

        let report = review_signed_xml(&signed_xml, &public_key);
        for failure in &report.failures {
            warn!(check = %failure, "signature structure check failed");
        }
        if !report.accepted() {
            warn!(
                passed = report.passed,
                total = report.total,
                "signature structure below acceptance threshold"
            );
        }

        Ok(SignedDocument {
            xml: signed_xml,
            properties: props,
            report,
        })
    }
}

/// Exclusive C14N of the whole document, SHA-256.
fn document_digest(doc: &Document) -> Result<Vec<u8>, SigningError> {
    let canonical = doc
        .canonicalize(exclusive_c14n(), None)
        .map_err(|e| SigningError::SigningError(format!("Failed to canonicalize xml: {e:?}")))?;
    Ok(Sha256::digest(canonical.as_bytes()).to_vec())
}

fn exclusive_c14n() -> c14n::CanonicalizationOptions {
    c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

fn canonicalize_node(doc: &Document, path: &str) -> Result<String, SigningError> {
    let ctx = xpath_context(doc)?;
    let mut node = first_matching_node(&ctx, path)?
        .ok_or_else(|| SigningError::SigningError(format!("XPath target not found: {path}")))?;
    node.canonicalize(exclusive_c14n())
        .map_err(|e| SigningError::SigningError(format!("Failed to canonicalize {path}: {e:?}")))
}

fn remove_signatures(doc: &Document) -> Result<usize, SigningError> {
    let ctx = xpath_context(doc)?;
    let nodes = ctx
        .evaluate("/*/ds:Signature")
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    let count = nodes.len();
    for mut node in nodes {
        node.unlink();
    }
    Ok(count)
}

fn normalize_base64_text(doc: &Document) -> Result<(), SigningError> {
    let ctx = xpath_context(doc)?;
    let nodes = ctx
        .evaluate("//ds:DigestValue | //ds:SignatureValue | //ds:X509Certificate | //ds:Modulus")
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    for mut node in nodes {
        let content = node.get_content();
        let compact: String = content.split_whitespace().collect();
        if compact != content {
            node.set_content(&compact)
                .map_err(|e| SigningError::SigningError(e.to_string()))?;
        }
    }
    Ok(())
}

fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, SigningError> {
    let fragment = Parser::default()
        .parse_string(xml)
        .map_err(|e| SigningError::SigningError(format!("XML parse error: {e:?}")))?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| SigningError::SigningError("missing fragment root".into()))?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| SigningError::SigningError("failed to import fragment".into()))
}

fn xpath_context(doc: &Document) -> Result<xpath::Context, SigningError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("etsi", XADES_NS)
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?;
    Ok(ctx)
}

fn first_matching_node(ctx: &xpath::Context, path: &str) -> Result<Option<Node>, SigningError> {
    let nodes = ctx
        .evaluate(path)
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    Ok(nodes.into_iter().next())
}

fn set_xpath_text(ctx: &xpath::Context, path: &str, value: &str) -> Result<(), SigningError> {
    let nodes = ctx
        .evaluate(path)
        .map_err(|e| SigningError::SigningError(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    if nodes.is_empty() {
        return Err(SigningError::SigningError(format!(
            "XPath target not found: {path}"
        )));
    }
    for mut node in nodes {
        node.set_content(value)
            .map_err(|e| SigningError::SigningError(e.to_string()))?;
    }
    Ok(())
}

fn xpath_text(ctx: &xpath::Context, path: &str) -> Option<String> {
    let nodes = ctx.evaluate(path).ok()?.get_nodes_as_vec();
    let value = nodes.first()?.get_content().trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Tolerant review of a signed document. Each check is independent.
pub fn review_signed_xml(xml: &str, public_key: &RsaPublicKey) -> StructureReport {
    let mut report = StructureReport {
        passed: 0,
        total: 0,
        failures: Vec::new(),
    };
    let mut check = |name: &str, ok: bool| {
        report.total += 1;
        if ok {
            report.passed += 1;
        } else {
            report.failures.push(name.to_string());
        }
    };

    let Ok(doc) = Parser::default().parse_string(xml) else {
        check("document parses", false);
        return report;
    };
    let Ok(ctx) = xpath_context(&doc) else {
        check("xpath context", false);
        return report;
    };
    let count = |path: &str| {
        ctx.evaluate(path)
            .map(|o| o.get_nodes_as_vec().len())
            .unwrap_or(0)
    };
    let attr = |path: &str, name: &str| {
        ctx.evaluate(path)
            .ok()
            .and_then(|o| o.get_nodes_as_vec().into_iter().next())
            .and_then(|n| n.get_attribute(name))
    };
    let is_base64 = |path: &str| {
        xpath_text(&ctx, path)
            .map(|v| Base64::decode_vec(&v).is_ok())
            .unwrap_or(false)
    };

    check("declaration", xml.starts_with(XML_DECLARATION));
    check(
        "root id",
        attr("/*", "id").as_deref() == Some(COMPROBANTE_ID),
    );
    check("single signature", count("/*/ds:Signature") == 1);
    check("signed info", count("/*/ds:Signature/ds:SignedInfo") == 1);
    check(
        "canonicalization method",
        attr("//ds:SignedInfo/ds:CanonicalizationMethod", "Algorithm").as_deref()
            == Some(EXC_C14N),
    );
    check(
        "signature method",
        attr("//ds:SignedInfo/ds:SignatureMethod", "Algorithm").as_deref() == Some(RSA_SHA256),
    );
    check("two references", count("//ds:SignedInfo/ds:Reference") == 2);
    check(
        "document reference",
        count(&format!("//ds:Reference[@URI='#{COMPROBANTE_ID}']")) == 1,
    );
    check(
        "signed properties reference",
        count(&format!("//ds:Reference[@Type='{SIGNED_PROPERTIES_TYPE}']")) == 1,
    );
    check(
        "reference digests",
        count("//ds:SignedInfo/ds:Reference/ds:DigestValue") == 2
            && is_base64("(//ds:SignedInfo/ds:Reference/ds:DigestValue)[1]")
            && is_base64("(//ds:SignedInfo/ds:Reference/ds:DigestValue)[2]"),
    );
    check("signature value", is_base64("//ds:SignatureValue"));
    check("certificate", is_base64("//ds:KeyInfo/ds:X509Data/ds:X509Certificate"));
    check(
        "signing time",
        xpath_text(&ctx, "//etsi:SignedSignatureProperties/etsi:SigningTime")
            .is_some_and(|t| DateTime::parse_from_rfc3339(&t).is_ok()),
    );
    check(
        "certificate digest",
        is_base64("//etsi:SigningCertificate/etsi:Cert/etsi:CertDigest/ds:DigestValue"),
    );
    check(
        "issuer serial",
        xpath_text(&ctx, "//etsi:IssuerSerial/ds:X509IssuerName").is_some()
            && xpath_text(&ctx, "//etsi:IssuerSerial/ds:X509SerialNumber")
                .is_some_and(|s| s.bytes().all(|b| b.is_ascii_digit())),
    );
    check(
        "document digest matches",
        verify_document_digest(&doc, &ctx).unwrap_or(false),
    );
    check(
        "signature verifies",
        verify_signature(&doc, &ctx, public_key).unwrap_or(false),
    );
    report
}

fn verify_document_digest(doc: &Document, ctx: &xpath::Context) -> Option<bool> {
    let expected = xpath_text(
        ctx,
        &format!("//ds:Reference[@URI='#{COMPROBANTE_ID}']/ds:DigestValue"),
    )?;
    let copy = doc.dup().ok()?;
    remove_signatures(&copy).ok()?;
    let digest = document_digest(&copy).ok()?;
    Some(Base64::encode_string(&digest) == expected)
}

fn verify_signature(doc: &Document, ctx: &xpath::Context, key: &RsaPublicKey) -> Option<bool> {
    let signature = Base64::decode_vec(&xpath_text(ctx, "//ds:SignatureValue")?).ok()?;
    let canonical = canonicalize_node(doc, "/*/ds:Signature/ds:SignedInfo").ok()?;
    let digest = Sha256::digest(canonical.as_bytes());
    Some(
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .is_ok(),
    )
}

fn signature_fragment(props: &SignedProperties) -> Result<String, SigningError> {
    let mut buffer = String::with_capacity(4096);
    SignatureXml(props)
        .serialize(QuickXmlSerializer::new(&mut buffer))
        .map_err(|e| SigningError::SigningError(format!("signature serialization failed: {e}")))?;
    Ok(buffer)
}

/// Element carrying only an `Algorithm` attribute.
struct AlgorithmXml(&'static str);

impl Serialize for AlgorithmXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("Algorithm", 1)?;
        st.serialize_field("@Algorithm", self.0)?;
        st.end()
    }
}

struct TransformsXml(&'static [&'static str]);

impl Serialize for TransformsXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:Transforms", 0)?;
        for algorithm in self.0 {
            st.serialize_field("ds:Transform", &AlgorithmXml(algorithm))?;
        }
        st.end()
    }
}

struct ReferenceXml<'a> {
    id: String,
    kind: Option<&'static str>,
    uri: String,
    transforms: &'static [&'static str],
    digest: &'a str,
}

impl Serialize for ReferenceXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("ds:Reference", 0)?;
        st.serialize_field("@Id", &self.id)?;
        if let Some(kind) = self.kind {
            st.serialize_field("@Type", kind)?;
        }
        st.serialize_field("@URI", &self.uri)?;
        st.serialize_field("ds:Transforms", &TransformsXml(self.transforms))?;
        st.serialize_field("ds:DigestMethod", &AlgorithmXml(SHA256_URI))?;
        st.serialize_field("ds:DigestValue", self.digest)?;
        st.end()
    }
}

struct IdTextXml<'a> {
    id: String,
    text: &'a str,
}

impl Serialize for IdTextXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("IdText", 0)?;
        st.serialize_field("@Id", &self.id)?;
        st.serialize_field("$text", self.text)?;
        st.end()
    }
}

struct SignatureXml<'a>(&'a SignedProperties);

impl Serialize for SignatureXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let props = self.0;
        let ids = &props.ids;
        let mut st = s.serialize_struct("ds:Signature", 0)?;
        st.serialize_field("@xmlns:ds", DS_NS)?;
        st.serialize_field("@xmlns:etsi", XADES_NS)?;
        st.serialize_field("@Id", &ids.signature())?;
        st.serialize_field("ds:SignedInfo", &SignedInfoXml(props))?;
        st.serialize_field(
            "ds:SignatureValue",
            &IdTextXml {
                id: ids.signature_value(),
                text: &props.signature_value,
            },
        )?;
        st.serialize_field("ds:KeyInfo", &KeyInfoXml(props))?;
        st.serialize_field("ds:Object", &ObjectXml(props))?;
        st.end()
    }
}

struct SignedInfoXml<'a>(&'a SignedProperties);

impl Serialize for SignedInfoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let props = self.0;
        let ids = &props.ids;
        let mut st = s.serialize_struct("ds:SignedInfo", 0)?;
        st.serialize_field("@Id", &ids.signed_info())?;
        st.serialize_field("ds:CanonicalizationMethod", &AlgorithmXml(EXC_C14N))?;
        st.serialize_field("ds:SignatureMethod", &AlgorithmXml(RSA_SHA256))?;
        st.serialize_field(
            "ds:Reference",
            &ReferenceXml {
                id: ids.signed_properties_ref(),
                kind: Some(SIGNED_PROPERTIES_TYPE),
                uri: format!("#{}", ids.signed_properties()),
                transforms: &[EXC_C14N],
                digest: &props.signed_properties_digest,
            },
        )?;
        st.serialize_field(
            "ds:Reference",
            &ReferenceXml {
                id: ids.document_ref(),
                kind: None,
                uri: format!("#{COMPROBANTE_ID}"),
                transforms: &[ENVELOPED, EXC_C14N],
                digest: &props.document_digest,
            },
        )?;
        st.end()
    }
}

struct KeyInfoXml<'a>(&'a SignedProperties);

impl Serialize for KeyInfoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct X509DataXml<'a>(&'a str);

        impl Serialize for X509DataXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("ds:X509Data", 0)?;
                st.serialize_field("ds:X509Certificate", self.0)?;
                st.end()
            }
        }

        struct KeyValueXml<'a>(&'a SignedProperties);

        impl Serialize for KeyValueXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                struct RsaKeyValueXml<'a>(&'a SignedProperties);

                impl Serialize for RsaKeyValueXml<'_> {
                    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
                    where
                        S: Serializer,
                    {
                        let mut st = s.serialize_struct("ds:RSAKeyValue", 0)?;
                        st.serialize_field("ds:Modulus", &self.0.modulus)?;
                        st.serialize_field("ds:Exponent", &self.0.exponent)?;
                        st.end()
                    }
                }

                let mut st = s.serialize_struct("ds:KeyValue", 0)?;
                st.serialize_field("ds:RSAKeyValue", &RsaKeyValueXml(self.0))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("ds:KeyInfo", 0)?;
        st.serialize_field("@Id", &self.0.ids.key_info())?;
        st.serialize_field("ds:X509Data", &X509DataXml(&self.0.certificate))?;
        st.serialize_field("ds:KeyValue", &KeyValueXml(self.0))?;
        st.end()
    }
}

struct ObjectXml<'a>(&'a SignedProperties);

impl Serialize for ObjectXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct QualifyingPropertiesXml<'a>(&'a SignedProperties);

        impl Serialize for QualifyingPropertiesXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:QualifyingProperties", 0)?;
                st.serialize_field("@Target", &format!("#{}", self.0.ids.signature()))?;
                st.serialize_field("etsi:SignedProperties", &SignedPropertiesXml(self.0))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("ds:Object", 0)?;
        st.serialize_field("@Id", &self.0.ids.object())?;
        st.serialize_field("etsi:QualifyingProperties", &QualifyingPropertiesXml(self.0))?;
        st.end()
    }
}

struct SignedPropertiesXml<'a>(&'a SignedProperties);

impl Serialize for SignedPropertiesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let props = self.0;
        let mut st = s.serialize_struct("etsi:SignedProperties", 0)?;
        st.serialize_field("@Id", &props.ids.signed_properties())?;
        st.serialize_field(
            "etsi:SignedSignatureProperties",
            &SignedSignaturePropertiesXml(props),
        )?;
        st.serialize_field(
            "etsi:SignedDataObjectProperties",
            &SignedDataObjectPropertiesXml(props),
        )?;
        st.end()
    }
}

struct SignedSignaturePropertiesXml<'a>(&'a SignedProperties);

impl Serialize for SignedSignaturePropertiesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct CertDigestXml<'a>(&'a str);

        impl Serialize for CertDigestXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:CertDigest", 0)?;
                st.serialize_field("ds:DigestMethod", &AlgorithmXml(SHA1_URI))?;
                st.serialize_field("ds:DigestValue", self.0)?;
                st.end()
            }
        }

        struct IssuerSerialXml<'a>(&'a SignedProperties);

        impl Serialize for IssuerSerialXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:IssuerSerial", 0)?;
                st.serialize_field("ds:X509IssuerName", &self.0.issuer)?;
                st.serialize_field("ds:X509SerialNumber", &self.0.serial)?;
                st.end()
            }
        }

        struct CertXml<'a>(&'a SignedProperties);

        impl Serialize for CertXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:Cert", 0)?;
                st.serialize_field("etsi:CertDigest", &CertDigestXml(&self.0.certificate_digest))?;
                st.serialize_field("etsi:IssuerSerial", &IssuerSerialXml(self.0))?;
                st.end()
            }
        }

        struct SigningCertificateXml<'a>(&'a SignedProperties);

        impl Serialize for SigningCertificateXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:SigningCertificate", 0)?;
                st.serialize_field("etsi:Cert", &CertXml(self.0))?;
                st.end()
            }
        }

        let props = self.0;
        let mut st = s.serialize_struct("etsi:SignedSignatureProperties", 0)?;
        st.serialize_field("etsi:SigningTime", &props.signing_time_text())?;
        st.serialize_field("etsi:SigningCertificate", &SigningCertificateXml(props))?;
        st.end()
    }
}

struct SignedDataObjectPropertiesXml<'a>(&'a SignedProperties);

impl Serialize for SignedDataObjectPropertiesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct DataObjectFormatXml<'a>(&'a SignedProperties);

        impl Serialize for DataObjectFormatXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("etsi:DataObjectFormat", 0)?;
                st.serialize_field("@ObjectReference", &format!("#{}", self.0.ids.document_ref()))?;
                st.serialize_field("etsi:Description", "contenido comprobante")?;
                st.serialize_field("etsi:MimeType", "text/xml")?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("etsi:SignedDataObjectProperties", 0)?;
        st.serialize_field("etsi:DataObjectFormat", &DataObjectFormatXml(self.0))?;
        st.end()
    }
}
