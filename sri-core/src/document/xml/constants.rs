use crate::document::DocumentType;

pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// `id` carried by every document root and referenced by the signature.
pub(crate) const COMPROBANTE_ID: &str = "comprobante";
pub(crate) const CURRENCY: &str = "DOLAR";

/// Root element and schema version for a document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaInfo {
    pub root: &'static str,
    /// SRI schemas are namespace-less.
    pub namespace: Option<&'static str>,
    pub version: &'static str,
}

pub fn schema_for(document_type: DocumentType) -> SchemaInfo {
    let (root, version) = match document_type {
        DocumentType::Invoice => ("factura", "1.1.0"),
        DocumentType::PurchaseSettlement => ("liquidacionCompra", "1.1.0"),
        DocumentType::CreditNote => ("notaCredito", "1.1.0"),
        DocumentType::DebitNote => ("notaDebito", "1.0.0"),
        DocumentType::RemissionGuide => ("guiaRemision", "1.1.0"),
        DocumentType::Retention => ("comprobanteRetencion", "1.0.0"),
    };
    SchemaInfo {
        root,
        namespace: None,
        version,
    }
}
