use chrono::NaiveDate;
use httpmock::MockServer;
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rust_decimal_macros::dec;
use sha2::Sha256;
use sri_core::certificate::CertificateBundle;
use sri_core::document::{
    Counterparty, Document, DocumentBody, DocumentBuilder, EmissionPoint, IdentificationType,
    Issuer, LineItem, Payment, RequiredDocumentFields, TenantId,
};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

#[allow(dead_code)]
pub const TENANT: &str = "acme";

#[allow(dead_code)]
pub const SAMPLE_KEY: &str = "1501202401179173740900110010010000000011234567814";

#[allow(dead_code)]
pub fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
}

#[allow(dead_code)]
pub fn certificate_bundle(tenant: &str) -> CertificateBundle {
    let key = rsa_key();
    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
    let profile = Profile::Leaf {
        issuer: Name::from_str("CN=AC Prueba,O=Autoridad,C=EC").expect("issuer"),
        enable_key_agreement: false,
        enable_key_encipherment: false,
        include_subject_key_identifier: true,
    };
    let der = CertificateBuilder::new(
        profile,
        SerialNumber::new(&[0x0a, 0x0b]).expect("serial"),
        Validity::from_now(Duration::from_secs(90 * 24 * 3600)).expect("validity"),
        Name::from_str("CN=Firma Prueba,O=ACME S.A.,C=EC").expect("subject"),
        SubjectPublicKeyInfoOwned::from_key(key.to_public_key()).expect("spki"),
        &signer,
    )
    .expect("builder")
    .build::<rsa::pkcs1v15::Signature>()
    .expect("certificate")
    .to_der()
    .expect("der");
    let key_der = key.to_pkcs8_der().expect("pkcs8");
    CertificateBundle::from_der(TenantId::new(tenant), &der, key_der.as_bytes(), vec![])
        .expect("bundle")
}

#[allow(dead_code)]
pub fn sample_invoice(tenant: &str) -> Document {
    sample_builder(tenant).build().expect("build sample invoice")
}

#[allow(dead_code)]
/// Two units at 15.00 with a 3.00 discount, default VAT: total 31.05.
pub fn sample_builder(tenant: &str) -> DocumentBuilder {
    DocumentBuilder::new(RequiredDocumentFields {
        tenant_id: TenantId::new(tenant),
        issuer: Issuer {
            ruc: "1791737409001".into(),
            legal_name: "ACME S.A.".into(),
            trade_name: Some("ACME".into()),
            head_office_address: "Av. Amazonas N1".into(),
            establishment_address: "Av. Amazonas N1".into(),
            special_taxpayer: None,
            accounting_required: true,
        },
        emission_point: EmissionPoint::new("001", "001"),
        issue_date: NaiveDate::from_ymd_opt(2024, 1, 15).expect("date"),
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
        address: Some("Quito".into()),
        email: Some("juan@example.com".into()),
        phone: None,
    })
    .item(LineItem::new("P001", "Servicio de soporte", dec!(2), dec!(15)).with_discount(dec!(3)))
}

#[allow(dead_code)]
pub fn try_start_server() -> Option<MockServer> {
    std::panic::catch_unwind(MockServer::start).ok()
}

#[allow(dead_code)]
pub fn reception_body(state: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion"><RespuestaRecepcionComprobante><estado>{state}</estado><comprobantes/></RespuestaRecepcionComprobante></ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}

#[allow(dead_code)]
pub fn authorized_body(access_key: &str, authorized_at: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion"><RespuestaAutorizacionComprobante><claveAccesoConsultada>{access_key}</claveAccesoConsultada><numeroComprobantes>1</numeroComprobantes><autorizaciones><autorizacion><estado>AUTORIZADO</estado><numeroAutorizacion>{access_key}</numeroAutorizacion><fechaAutorizacion>{authorized_at}</fechaAutorizacion><ambiente>PRUEBAS</ambiente><mensajes/></autorizacion></autorizaciones></RespuestaAutorizacionComprobante></ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}
