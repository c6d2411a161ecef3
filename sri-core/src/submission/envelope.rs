//! SOAP request bodies and WSDL discovery.
use libxml::{parser::Parser, xpath};
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
pub const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";

/// The two operations the SRI offline services expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoapOperation {
    ValidarComprobante,
    AutorizacionComprobante,
}

impl SoapOperation {
    pub fn name(&self) -> &'static str {
        match self {
            SoapOperation::ValidarComprobante => "validarComprobante",
            SoapOperation::AutorizacionComprobante => "autorizacionComprobante",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            SoapOperation::ValidarComprobante => RECEPTION_NS,
            SoapOperation::AutorizacionComprobante => AUTHORIZATION_NS,
        }
    }
}

/// Payload of one SOAP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoapRequest {
    /// Base64 of the signed XML, declaration removed.
    Reception { xml_base64: String },
    Authorization { access_key: String },
}

impl SoapRequest {
    pub fn operation(&self) -> SoapOperation {
        match self {
            SoapRequest::Reception { .. } => SoapOperation::ValidarComprobante,
            SoapRequest::Authorization { .. } => SoapOperation::AutorizacionComprobante,
        }
    }
}

/// Hand-built envelope used by the raw HTTP strategy.
pub fn raw_envelope(request: &SoapRequest) -> String {
    match request {
        SoapRequest::Reception { xml_base64 } => format!(
            r#"<soap:Envelope xmlns:soap="{SOAP_ENV_NS}" xmlns:ser="{RECEPTION_NS}"><soap:Body><ser:validarComprobante><xml>{xml_base64}</xml></ser:validarComprobante></soap:Body></soap:Envelope>"#
        ),
        SoapRequest::Authorization { access_key } => format!(
            r#"<soap:Envelope xmlns:soap="{SOAP_ENV_NS}"><soap:Body><autorizacionComprobante xmlns="{AUTHORIZATION_NS}"><claveAccesoComprobante xmlns="">{access_key}</claveAccesoComprobante></autorizacionComprobante></soap:Body></soap:Envelope>"#
        ),
    }
}

/// Envelope serialized from typed request structs, used by the WSDL binding.
pub fn typed_envelope(request: &SoapRequest) -> Result<String, SeError> {
    let mut buffer = String::with_capacity(256);
    EnvelopeXml(request).serialize(QuickXmlSerializer::new(&mut buffer))?;
    Ok(buffer)
}

struct EnvelopeXml<'a>(&'a SoapRequest);

impl Serialize for EnvelopeXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("soapenv:Envelope", 3)?;
        st.serialize_field("@xmlns:soapenv", SOAP_ENV_NS)?;
        st.serialize_field("@xmlns:ser", self.0.operation().namespace())?;
        st.serialize_field("soapenv:Header", "")?;
        st.serialize_field("soapenv:Body", &BodyXml(self.0))?;
        st.end()
    }
}

struct BodyXml<'a>(&'a SoapRequest);

impl Serialize for BodyXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("soapenv:Body", 1)?;
        match self.0 {
            SoapRequest::Reception { xml_base64 } => {
                st.serialize_field("ser:validarComprobante", &ValidarComprobante { xml: xml_base64 })?;
            }
            SoapRequest::Authorization { access_key } => {
                st.serialize_field(
                    "ser:autorizacionComprobante",
                    &AutorizacionComprobante {
                        clave_acceso_comprobante: access_key,
                    },
                )?;
            }
        }
        st.end()
    }
}

#[derive(serde::Serialize)]
struct ValidarComprobante<'a> {
    xml: &'a str,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct AutorizacionComprobante<'a> {
    clave_acceso_comprobante: &'a str,
}

/// What the binding learned from a service WSDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsdlBinding {
    pub address: String,
    pub operations: Vec<String>,
}

impl WsdlBinding {
    pub fn supports(&self, operation: SoapOperation) -> bool {
        self.operations.iter().any(|o| o == operation.name())
    }
}

/// Read the SOAP address and operation names from a WSDL document.
pub fn parse_wsdl(body: &str) -> Option<WsdlBinding> {
    let doc = Parser::default().parse_string(body).ok()?;
    let ctx = xpath::Context::new(&doc).ok()?;
    let address = ctx
        .evaluate("//*[local-name()='service']//*[local-name()='address']")
        .ok()?
        .get_nodes_as_vec()
        .into_iter()
        .find_map(|n| n.get_attribute("location"))?;
    let mut operations: Vec<String> = ctx
        .evaluate("//*[local-name()='portType']/*[local-name()='operation']")
        .ok()?
        .get_nodes_as_vec()
        .into_iter()
        .filter_map(|n| n.get_attribute("name"))
        .collect();
    operations.dedup();
    Some(WsdlBinding { address, operations })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEPTION_WSDL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://schemas.xmlsoap.org/wsdl/" xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/" name="RecepcionComprobantesOfflineService">
  <portType name="RecepcionComprobantesOffline">
    <operation name="validarComprobante"/>
  </portType>
  <service name="RecepcionComprobantesOfflineService">
    <port name="RecepcionComprobantesOfflinePort" binding="tns:RecepcionComprobantesOfflinePortBinding">
      <soap:address location="https://celcer.sri.gob.ec:443/comprobantes-electronicos-ws/RecepcionComprobantesOffline"/>
    </port>
  </service>
</definitions>"#;

    #[test]
    fn raw_authorization_envelope_clears_namespace_on_key() {
        let xml = raw_envelope(&SoapRequest::Authorization {
            access_key: "123".into(),
        });
        assert!(xml.contains(
            r#"<autorizacionComprobante xmlns="http://ec.gob.sri.ws.autorizacion"><claveAccesoComprobante xmlns="">123</claveAccesoComprobante>"#
        ));
    }

    #[test]
    fn typed_envelope_carries_operation_namespace() {
        let xml = typed_envelope(&SoapRequest::Reception {
            xml_base64: "PGZhY3R1cmEvPg==".into(),
        })
        .unwrap();
        assert!(xml.starts_with("<soapenv:Envelope"));
        assert!(xml.contains(r#"xmlns:ser="http://ec.gob.sri.ws.recepcion""#));
        assert!(xml.contains(
            "<ser:validarComprobante><xml>PGZhY3R1cmEvPg==</xml></ser:validarComprobante>"
        ));

        let auth = typed_envelope(&SoapRequest::Authorization {
            access_key: "42".into(),
        })
        .unwrap();
        assert!(auth.contains(
            "<ser:autorizacionComprobante><claveAccesoComprobante>42</claveAccesoComprobante></ser:autorizacionComprobante>"
        ));
    }

    #[test]
    fn wsdl_yields_address_and_operations() {
        let binding = parse_wsdl(RECEPTION_WSDL).unwrap();
        assert_eq!(
            binding.address,
            "https://celcer.sri.gob.ec:443/comprobantes-electronicos-ws/RecepcionComprobantesOffline"
        );
        assert!(binding.supports(SoapOperation::ValidarComprobante));
        assert!(!binding.supports(SoapOperation::AutorizacionComprobante));
        assert!(parse_wsdl("<definitions/>").is_none());
    }
}
