//! XML serialization for SRI documents.
pub mod constants;

use super::{
    AdditionalField, Counterparty, Document, DocumentBody, DocumentReference, DocumentTotals,
    LineItem, Payment, Recipient, ShippedItem, Shipment, TaxGroup, TaxLine, TaxRule, Withholding,
};
use crate::access_key::AccessKey;
use constants::{COMPROBANTE_ID, CURRENCY, XML_DECLARATION, schema_for};
use helpers::{date, money, quantity, yes_no};
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// XML serialization error.
#[derive(Debug, Error)]
pub enum DocumentXmlError {
    #[error("failed to serialize document to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
    #[error("document has no access key")]
    MissingAccessKey,
    #[error("document has no sequence number")]
    MissingSequence,
    #[error("totals do not reconcile: {subtotal} + {tax} != {total}")]
    TotalsMismatch {
        subtotal: Decimal,
        tax: Decimal,
        total: Decimal,
    },
}

/// XML formatting options.
#[derive(Debug, Clone, Copy, Default)]
pub enum XmlFormat {
    #[default]
    Compact,
    Pretty {
        indent_char: char,
        indent_size: usize,
    },
}

mod helpers {
    use crate::document::round_to;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    pub(super) struct FixedPrecision {
        value: Decimal,
        precision: u32,
    }

    impl FixedPrecision {
        pub(super) fn new(value: Decimal, precision: u32) -> Self {
            Self { value, precision }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{}", round_to(self.value, self.precision))
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    pub(super) fn money(value: Decimal) -> FixedPrecision {
        FixedPrecision::new(value, 2)
    }

    pub(super) fn quantity(value: Decimal) -> FixedPrecision {
        FixedPrecision::new(value, 6)
    }

    pub(super) fn date(value: NaiveDate) -> String {
        value.format("%d/%m/%Y").to_string()
    }

    pub(super) fn yes_no(value: bool) -> &'static str {
        if value { "SI" } else { "NO" }
    }
}

/// Everything the element writers need, resolved once.
struct RenderContext<'a> {
    doc: &'a Document,
    key: &'a AccessKey,
    sequence: u64,
    totals: DocumentTotals,
    default_tax: &'a TaxRule,
}

/// Wrapper for serializing a document to its SRI schema.
pub struct DocumentXml<'a> {
    document: &'a Document,
    default_tax: &'a TaxRule,
}

impl<'a> DocumentXml<'a> {
    pub fn new(document: &'a Document, default_tax: &'a TaxRule) -> Self {
        Self {
            document,
            default_tax,
        }
    }

    fn context(&self) -> Result<RenderContext<'a>, DocumentXmlError> {
        let key = self
            .document
            .access_key()
            .ok_or(DocumentXmlError::MissingAccessKey)?;
        let sequence = self
            .document
            .sequence()
            .ok_or(DocumentXmlError::MissingSequence)?;
        let totals = self
            .document
            .compute_totals(self.default_tax)
            .unwrap_or_else(|| DocumentTotals::compute(&[], self.default_tax));
        if !totals.reconciles() {
            return Err(DocumentXmlError::TotalsMismatch {
                subtotal: totals.subtotal,
                tax: totals.total_tax,
                total: totals.total,
            });
        }
        Ok(RenderContext {
            doc: self.document,
            key,
            sequence,
            totals,
            default_tax: self.default_tax,
        })
    }
}

/// XML serialization entry points.
///
/// # Examples
/// ```rust,ignore
/// use sri_core::document::xml::{DocumentXml, ToXml};
///
/// let xml = DocumentXml::new(&document, config.default_tax()).to_xml()?;
/// assert!(xml.starts_with("<?xml"));
/// ```
pub trait ToXml {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError>;

    fn to_xml(&self) -> Result<String, DocumentXmlError> {
        self.to_xml_with_format(XmlFormat::Compact)
    }

    fn to_xml_pretty(&self) -> Result<String, DocumentXmlError> {
        self.to_xml_with_format(XmlFormat::Pretty {
            indent_char: ' ',
            indent_size: 2,
        })
    }
}

impl ToXml for DocumentXml<'_> {
    fn to_xml_with_format(&self, format: XmlFormat) -> Result<String, DocumentXmlError> {
        let ctx = self.context()?;
        let mut buffer = String::with_capacity(4096);
        buffer.push_str(XML_DECLARATION);
        buffer.push('\n');

        {
            let mut serializer = QuickXmlSerializer::new(&mut buffer);
            if let XmlFormat::Pretty {
                indent_char,
                indent_size,
            } = format
            {
                serializer.indent(indent_char, indent_size);
            }
            RootXml(&ctx).serialize(serializer)?;
        }

        Ok(buffer)
    }
}

struct RootXml<'a>(&'a RenderContext<'a>);

impl Serialize for RootXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.0;
        let schema = schema_for(ctx.doc.document_type());
        let mut st = s.serialize_struct(schema.root, 0)?;
        st.serialize_field("@id", COMPROBANTE_ID)?;
        st.serialize_field("@version", schema.version)?;
        st.serialize_field("infoTributaria", &InfoTributariaXml(ctx))?;

        match ctx.doc.body() {
            DocumentBody::Invoice { payments } => {
                st.serialize_field("infoFactura", &InfoFacturaXml { ctx, payments })?;
                st.serialize_field("detalles", &DetallesXml::sales(ctx))?;
            }
            DocumentBody::PurchaseSettlement { payments } => {
                st.serialize_field(
                    "infoLiquidacionCompra",
                    &InfoLiquidacionXml { ctx, payments },
                )?;
                st.serialize_field("detalles", &DetallesXml::sales(ctx))?;
            }
            DocumentBody::CreditNote { modified, reason } => {
                st.serialize_field(
                    "infoNotaCredito",
                    &InfoNotaCreditoXml {
                        ctx,
                        modified,
                        reason,
                    },
                )?;
                st.serialize_field("detalles", &DetallesXml::credit_note(ctx))?;
            }
            DocumentBody::DebitNote { modified, payments } => {
                st.serialize_field(
                    "infoNotaDebito",
                    &InfoNotaDebitoXml {
                        ctx,
                        modified,
                        payments,
                    },
                )?;
                st.serialize_field("motivos", &MotivosXml(ctx.doc.items()))?;
            }
            DocumentBody::Retention {
                fiscal_period,
                withholdings,
            } => {
                st.serialize_field(
                    "infoCompRetencion",
                    &InfoRetencionXml { ctx, fiscal_period },
                )?;
                st.serialize_field("impuestos", &RetencionImpuestosXml(withholdings))?;
            }
            DocumentBody::RemissionGuide(shipment) => {
                st.serialize_field("infoGuiaRemision", &InfoGuiaXml { ctx, shipment })?;
                st.serialize_field("destinatarios", &DestinatariosXml(&shipment.recipients))?;
            }
        }

        let extra = InfoAdicionalXml::collect(ctx.doc);
        if !extra.fields.is_empty() {
            st.serialize_field("infoAdicional", &extra)?;
        }
        st.end()
    }
}

struct InfoTributariaXml<'a>(&'a RenderContext<'a>);

impl Serialize for InfoTributariaXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.0;
        let key = ctx.key.as_str();
        let issuer = ctx.doc.issuer();
        let point = ctx.doc.emission_point();
        let mut st = s.serialize_struct("infoTributaria", 0)?;
        st.serialize_field("ambiente", &key[23..24])?;
        st.serialize_field("tipoEmision", &key[47..48])?;
        st.serialize_field("razonSocial", &issuer.legal_name)?;
        if let Some(trade_name) = &issuer.trade_name {
            st.serialize_field("nombreComercial", trade_name)?;
        }
        st.serialize_field("ruc", &issuer.ruc)?;
        st.serialize_field("claveAcceso", key)?;
        st.serialize_field("codDoc", ctx.doc.document_type().code())?;
        st.serialize_field("estab", &point.establishment)?;
        st.serialize_field("ptoEmi", &point.point)?;
        st.serialize_field("secuencial", &format!("{:09}", ctx.sequence))?;
        st.serialize_field("dirMatriz", &issuer.head_office_address)?;
        st.end()
    }
}

/// Counterparty fields under a role suffix (`Comprador`, `Proveedor`, `SujetoRetenido`).
fn serialize_counterparty<M: SerializeStruct>(
    st: &mut M,
    party: Option<&Counterparty>,
    role: &'static str,
) -> Result<(), M::Error> {
    let Some(party) = party else {
        return Ok(());
    };
    let (id_type, name, id) = match role {
        "Proveedor" => (
            "tipoIdentificacionProveedor",
            "razonSocialProveedor",
            "identificacionProveedor",
        ),
        "SujetoRetenido" => (
            "tipoIdentificacionSujetoRetenido",
            "razonSocialSujetoRetenido",
            "identificacionSujetoRetenido",
        ),
        _ => (
            "tipoIdentificacionComprador",
            "razonSocialComprador",
            "identificacionComprador",
        ),
    };
    st.serialize_field(id_type, party.identification_type.code())?;
    st.serialize_field(name, &party.name)?;
    st.serialize_field(id, &party.identification)?;
    Ok(())
}

fn serialize_special_taxpayer<M: SerializeStruct>(
    st: &mut M,
    ctx: &RenderContext<'_>,
) -> Result<(), M::Error> {
    if let Some(special) = &ctx.doc.issuer().special_taxpayer {
        st.serialize_field("contribuyenteEspecial", special)?;
    }
    Ok(())
}

struct InfoFacturaXml<'a> {
    ctx: &'a RenderContext<'a>,
    payments: &'a [Payment],
}

impl Serialize for InfoFacturaXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.ctx;
        let totals = &ctx.totals;
        let mut st = s.serialize_struct("infoFactura", 0)?;
        st.serialize_field("fechaEmision", &date(ctx.doc.issue_date()))?;
        st.serialize_field("dirEstablecimiento", &ctx.doc.issuer().establishment_address)?;
        serialize_special_taxpayer(&mut st, ctx)?;
        st.serialize_field(
            "obligadoContabilidad",
            yes_no(ctx.doc.issuer().accounting_required),
        )?;
        serialize_counterparty(&mut st, ctx.doc.counterparty(), "Comprador")?;
        if let Some(address) = ctx.doc.counterparty().and_then(|p| p.address.as_ref()) {
            st.serialize_field("direccionComprador", address)?;
        }
        st.serialize_field("totalSinImpuestos", &money(totals.subtotal))?;
        st.serialize_field("totalDescuento", &money(totals.total_discount))?;
        st.serialize_field("totalConImpuestos", &TotalConImpuestosXml::with_rate(totals))?;
        st.serialize_field("propina", &money(totals.tip))?;
        st.serialize_field("importeTotal", &money(totals.total))?;
        st.serialize_field("moneda", CURRENCY)?;
        if !self.payments.is_empty() {
            st.serialize_field("pagos", &PagosXml(self.payments))?;
        }
        st.end()
    }
}

struct InfoLiquidacionXml<'a> {
    ctx: &'a RenderContext<'a>,
    payments: &'a [Payment],
}

impl Serialize for InfoLiquidacionXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.ctx;
        let totals = &ctx.totals;
        let mut st = s.serialize_struct("infoLiquidacionCompra", 0)?;
        st.serialize_field("fechaEmision", &date(ctx.doc.issue_date()))?;
        st.serialize_field("dirEstablecimiento", &ctx.doc.issuer().establishment_address)?;
        serialize_special_taxpayer(&mut st, ctx)?;
        st.serialize_field(
            "obligadoContabilidad",
            yes_no(ctx.doc.issuer().accounting_required),
        )?;
        serialize_counterparty(&mut st, ctx.doc.counterparty(), "Proveedor")?;
        if let Some(address) = ctx.doc.counterparty().and_then(|p| p.address.as_ref()) {
            st.serialize_field("direccionProveedor", address)?;
        }
        st.serialize_field("totalSinImpuestos", &money(totals.subtotal))?;
        st.serialize_field("totalDescuento", &money(totals.total_discount))?;
        st.serialize_field("totalConImpuestos", &TotalConImpuestosXml::with_rate(totals))?;
        st.serialize_field("importeTotal", &money(totals.total))?;
        st.serialize_field("moneda", CURRENCY)?;
        if !self.payments.is_empty() {
            st.serialize_field("pagos", &PagosXml(self.payments))?;
        }
        st.end()
    }
}

struct InfoNotaCreditoXml<'a> {
    ctx: &'a RenderContext<'a>,
    modified: &'a DocumentReference,
    reason: &'a str,
}

impl Serialize for InfoNotaCreditoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.ctx;
        let totals = &ctx.totals;
        let mut st = s.serialize_struct("infoNotaCredito", 0)?;
        st.serialize_field("fechaEmision", &date(ctx.doc.issue_date()))?;
        st.serialize_field("dirEstablecimiento", &ctx.doc.issuer().establishment_address)?;
        serialize_counterparty(&mut st, ctx.doc.counterparty(), "Comprador")?;
        serialize_special_taxpayer(&mut st, ctx)?;
        st.serialize_field(
            "obligadoContabilidad",
            yes_no(ctx.doc.issuer().accounting_required),
        )?;
        st.serialize_field("codDocModificado", self.modified.document_type.code())?;
        st.serialize_field("numDocModificado", &self.modified.number)?;
        st.serialize_field("fechaEmisionDocSustento", &date(self.modified.issue_date))?;
        st.serialize_field("totalSinImpuestos", &money(totals.subtotal))?;
        st.serialize_field("valorModificacion", &money(totals.total))?;
        st.serialize_field("moneda", CURRENCY)?;
        st.serialize_field("totalConImpuestos", &TotalConImpuestosXml::without_rate(totals))?;
        st.serialize_field("motivo", self.reason)?;
        st.end()
    }
}

struct InfoNotaDebitoXml<'a> {
    ctx: &'a RenderContext<'a>,
    modified: &'a DocumentReference,
    payments: &'a [Payment],
}

impl Serialize for InfoNotaDebitoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.ctx;
        let totals = &ctx.totals;
        let mut st = s.serialize_struct("infoNotaDebito", 0)?;
        st.serialize_field("fechaEmision", &date(ctx.doc.issue_date()))?;
        st.serialize_field("dirEstablecimiento", &ctx.doc.issuer().establishment_address)?;
        serialize_counterparty(&mut st, ctx.doc.counterparty(), "Comprador")?;
        serialize_special_taxpayer(&mut st, ctx)?;
        st.serialize_field(
            "obligadoContabilidad",
            yes_no(ctx.doc.issuer().accounting_required),
        )?;
        st.serialize_field("codDocModificado", self.modified.document_type.code())?;
        st.serialize_field("numDocModificado", &self.modified.number)?;
        st.serialize_field("fechaEmisionDocSustento", &date(self.modified.issue_date))?;
        st.serialize_field("totalSinImpuestos", &money(totals.subtotal))?;
        st.serialize_field("impuestos", &GroupImpuestosXml(&totals.tax_groups))?;
        st.serialize_field("valorTotal", &money(totals.total))?;
        if !self.payments.is_empty() {
            st.serialize_field("pagos", &PagosXml(self.payments))?;
        }
        st.end()
    }
}

struct InfoRetencionXml<'a> {
    ctx: &'a RenderContext<'a>,
    fiscal_period: &'a str,
}

impl Serialize for InfoRetencionXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ctx = self.ctx;
        let mut st = s.serialize_struct("infoCompRetencion", 0)?;
        st.serialize_field("fechaEmision", &date(ctx.doc.issue_date()))?;
        st.serialize_field("dirEstablecimiento", &ctx.doc.issuer().establishment_address)?;
        serialize_special_taxpayer(&mut st, ctx)?;
        st.serialize_field(
            "obligadoContabilidad",
            yes_no(ctx.doc.issuer().accounting_required),
        )?;
        serialize_counterparty(&mut st, ctx.doc.counterparty(), "SujetoRetenido")?;
        st.serialize_field("periodoFiscal", self.fiscal_period)?;
        st.end()
    }
}

struct InfoGuiaXml<'a> {
    ctx: &'a RenderContext<'a>,
    shipment: &'a Shipment,
}

impl Serialize for InfoGuiaXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let issuer = self.ctx.doc.issuer();
        let shipment = self.shipment;
        let mut st = s.serialize_struct("infoGuiaRemision", 0)?;
        st.serialize_field("dirEstablecimiento", &issuer.establishment_address)?;
        st.serialize_field("dirPartida", &shipment.departure_address)?;
        st.serialize_field("razonSocialTransportista", &shipment.carrier.name)?;
        st.serialize_field(
            "tipoIdentificacionTransportista",
            shipment.carrier.identification_type.code(),
        )?;
        st.serialize_field("rucTransportista", &shipment.carrier.identification)?;
        st.serialize_field("obligadoContabilidad", yes_no(issuer.accounting_required))?;
        serialize_special_taxpayer(&mut st, self.ctx)?;
        st.serialize_field("fechaIniTransporte", &date(shipment.start_date))?;
        st.serialize_field("fechaFinTransporte", &date(shipment.end_date))?;
        st.serialize_field("placa", &shipment.plate)?;
        st.end()
    }
}

/// `totalConImpuestos`; invoices and settlements carry `tarifa`, credit notes do not.
struct TotalConImpuestosXml<'a> {
    groups: &'a [TaxGroup],
    include_rate: bool,
}

impl<'a> TotalConImpuestosXml<'a> {
    fn with_rate(totals: &'a DocumentTotals) -> Self {
        Self {
            groups: &totals.tax_groups,
            include_rate: true,
        }
    }

    fn without_rate(totals: &'a DocumentTotals) -> Self {
        Self {
            groups: &totals.tax_groups,
            include_rate: false,
        }
    }
}

impl Serialize for TotalConImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct TotalImpuestoXml<'a>(&'a TaxGroup, bool);

        impl Serialize for TotalImpuestoXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let group = self.0;
                let mut st = s.serialize_struct("totalImpuesto", 0)?;
                st.serialize_field("codigo", group.code.code())?;
                st.serialize_field("codigoPorcentaje", &group.rate_code)?;
                st.serialize_field("baseImponible", &money(group.base))?;
                if self.1 {
                    st.serialize_field("tarifa", &money(group.rate))?;
                }
                st.serialize_field("valor", &money(group.value))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("totalConImpuestos", 0)?;
        for group in self.groups {
            st.serialize_field("totalImpuesto", &TotalImpuestoXml(group, self.include_rate))?;
        }
        st.end()
    }
}

/// Document-level `impuestos` of a debit note.
struct GroupImpuestosXml<'a>(&'a [TaxGroup]);

impl Serialize for GroupImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("impuestos", 0)?;
        for group in self.0 {
            st.serialize_field(
                "impuesto",
                &ImpuestoXml(&TaxLine {
                    code: group.code,
                    rate_code: group.rate_code.clone(),
                    rate: group.rate,
                    base: group.base,
                    value: group.value,
                }),
            )?;
        }
        st.end()
    }
}

struct ImpuestoXml<'a>(&'a TaxLine);

impl Serialize for ImpuestoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let line = self.0;
        let mut st = s.serialize_struct("impuesto", 0)?;
        st.serialize_field("codigo", line.code.code())?;
        st.serialize_field("codigoPorcentaje", &line.rate_code)?;
        st.serialize_field("tarifa", &money(line.rate))?;
        st.serialize_field("baseImponible", &money(line.base))?;
        st.serialize_field("valor", &money(line.value))?;
        st.end()
    }
}

struct PagosXml<'a>(&'a [Payment]);

impl Serialize for PagosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct PagoXml<'a>(&'a Payment);

        impl Serialize for PagoXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("pago", 0)?;
                st.serialize_field("formaPago", &self.0.method)?;
                st.serialize_field("total", &money(self.0.total))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("pagos", 0)?;
        for payment in self.0 {
            st.serialize_field("pago", &PagoXml(payment))?;
        }
        st.end()
    }
}

/// Line code element names differ between sales documents and credit notes.
struct DetallesXml<'a> {
    ctx: &'a RenderContext<'a>,
    main_tag: &'static str,
    auxiliary_tag: &'static str,
}

impl<'a> DetallesXml<'a> {
    fn sales(ctx: &'a RenderContext<'a>) -> Self {
        Self {
            ctx,
            main_tag: "codigoPrincipal",
            auxiliary_tag: "codigoAuxiliar",
        }
    }

    fn credit_note(ctx: &'a RenderContext<'a>) -> Self {
        Self {
            ctx,
            main_tag: "codigoInterno",
            auxiliary_tag: "codigoAdicional",
        }
    }
}

impl Serialize for DetallesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("detalles", 0)?;
        for item in self.ctx.doc.items() {
            st.serialize_field(
                "detalle",
                &DetalleXml {
                    item,
                    taxes: item.tax_lines(self.ctx.default_tax),
                    main_tag: self.main_tag,
                    auxiliary_tag: self.auxiliary_tag,
                },
            )?;
        }
        st.end()
    }
}

struct DetalleXml<'a> {
    item: &'a LineItem,
    taxes: Vec<TaxLine>,
    main_tag: &'static str,
    auxiliary_tag: &'static str,
}

impl Serialize for DetalleXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let item = self.item;
        let mut st = s.serialize_struct("detalle", 0)?;
        st.serialize_field(self.main_tag, &item.main_code)?;
        if let Some(aux) = &item.auxiliary_code {
            st.serialize_field(self.auxiliary_tag, aux)?;
        }
        st.serialize_field("descripcion", &item.description)?;
        st.serialize_field("cantidad", &quantity(item.quantity))?;
        st.serialize_field("precioUnitario", &quantity(item.unit_price))?;
        st.serialize_field("descuento", &money(item.discount))?;
        st.serialize_field("precioTotalSinImpuesto", &money(item.subtotal()))?;
        if !item.details.is_empty() {
            st.serialize_field("detallesAdicionales", &DetallesAdicionalesXml(&item.details))?;
        }
        st.serialize_field("impuestos", &LineImpuestosXml(&self.taxes))?;
        st.end()
    }
}

struct LineImpuestosXml<'a>(&'a [TaxLine]);

impl Serialize for LineImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("impuestos", 0)?;
        for line in self.0 {
            st.serialize_field("impuesto", &ImpuestoXml(line))?;
        }
        st.end()
    }
}

struct DetallesAdicionalesXml<'a>(&'a [AdditionalField]);

impl Serialize for DetallesAdicionalesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct DetAdicionalXml<'a>(&'a AdditionalField);

        impl Serialize for DetAdicionalXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("detAdicional", 0)?;
                st.serialize_field("@nombre", &self.0.name)?;
                st.serialize_field("@valor", &self.0.value)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("detallesAdicionales", 0)?;
        for detail in self.0 {
            st.serialize_field("detAdicional", &DetAdicionalXml(detail))?;
        }
        st.end()
    }
}

/// Debit note reasons: one `motivo` per line.
struct MotivosXml<'a>(&'a [LineItem]);

impl Serialize for MotivosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct MotivoXml<'a>(&'a LineItem);

        impl Serialize for MotivoXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("motivo", 0)?;
                st.serialize_field("razon", &self.0.description)?;
                st.serialize_field("valor", &money(self.0.subtotal()))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("motivos", 0)?;
        for item in self.0 {
            st.serialize_field("motivo", &MotivoXml(item))?;
        }
        st.end()
    }
}

struct RetencionImpuestosXml<'a>(&'a [Withholding]);

impl Serialize for RetencionImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct RetencionXml<'a>(&'a Withholding);

        impl Serialize for RetencionXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let w = self.0;
                let mut st = s.serialize_struct("impuesto", 0)?;
                st.serialize_field("codigo", w.tax.code())?;
                st.serialize_field("codigoRetencion", &w.retention_code)?;
                st.serialize_field("baseImponible", &money(w.base))?;
                st.serialize_field("porcentajeRetener", &money(w.percentage))?;
                st.serialize_field("valorRetenido", &money(w.withheld()))?;
                st.serialize_field("codDocSustento", w.support.document_type.code())?;
                st.serialize_field("numDocSustento", &w.support.number.replace('-', ""))?;
                st.serialize_field("fechaEmisionDocSustento", &date(w.support.issue_date))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("impuestos", 0)?;
        for withholding in self.0 {
            st.serialize_field("impuesto", &RetencionXml(withholding))?;
        }
        st.end()
    }
}

struct DestinatariosXml<'a>(&'a [Recipient]);

impl Serialize for DestinatariosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct DestinatarioXml<'a>(&'a Recipient);

        impl Serialize for DestinatarioXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let r = self.0;
                let mut st = s.serialize_struct("destinatario", 0)?;
                st.serialize_field("identificacionDestinatario", &r.identification)?;
                st.serialize_field("razonSocialDestinatario", &r.name)?;
                st.serialize_field("dirDestinatario", &r.address)?;
                st.serialize_field("motivoTraslado", &r.reason)?;
                if let Some(support) = &r.support {
                    st.serialize_field("codDocSustento", support.document_type.code())?;
                    st.serialize_field("numDocSustento", &support.number)?;
                    if let Some(auth) = &r.support_authorization {
                        st.serialize_field("numAutDocSustento", auth)?;
                    }
                    st.serialize_field("fechaEmisionDocSustento", &date(support.issue_date))?;
                }
                st.serialize_field("detalles", &GuiaDetallesXml(r))?;
                st.end()
            }
        }

        struct GuiaDetallesXml<'a>(&'a Recipient);

        impl Serialize for GuiaDetallesXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("detalles", 0)?;
                for item in &self.0.items {
                    st.serialize_field("detalle", &GuiaDetalleXml(item))?;
                }
                st.end()
            }
        }

        struct GuiaDetalleXml<'a>(&'a ShippedItem);

        impl Serialize for GuiaDetalleXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("detalle", 0)?;
                st.serialize_field("codigoInterno", &self.0.code)?;
                st.serialize_field("descripcion", &self.0.description)?;
                st.serialize_field("cantidad", &quantity(self.0.quantity))?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("destinatarios", 0)?;
        for recipient in self.0 {
            st.serialize_field("destinatario", &DestinatarioXml(recipient))?;
        }
        st.end()
    }
}

/// Free-form fields plus the counterparty's EMAIL and TELEFONO.
struct InfoAdicionalXml {
    fields: Vec<AdditionalField>,
}

impl InfoAdicionalXml {
    fn collect(doc: &Document) -> Self {
        let mut fields: Vec<AdditionalField> = doc.additional_fields().to_vec();
        if let Some(party) = doc.counterparty() {
            let has = |name: &str| fields.iter().any(|f| f.name.eq_ignore_ascii_case(name));
            let email = party
                .email
                .as_ref()
                .filter(|v| !v.trim().is_empty() && !has("EMAIL"))
                .map(|v| AdditionalField::new("EMAIL", v.trim()));
            let phone = party
                .phone
                .as_ref()
                .filter(|v| !v.trim().is_empty() && !has("TELEFONO"))
                .map(|v| AdditionalField::new("TELEFONO", v.trim()));
            fields.extend(email);
            fields.extend(phone);
        }
        Self { fields }
    }
}

impl Serialize for InfoAdicionalXml {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct CampoXml<'a>(&'a AdditionalField);

        impl Serialize for CampoXml<'_> {
            fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let mut st = s.serialize_struct("campoAdicional", 0)?;
                st.serialize_field("@nombre", &self.0.name)?;
                st.serialize_field("$text", &self.0.value)?;
                st.end()
            }
        }

        let mut st = s.serialize_struct("infoAdicional", 0)?;
        for field in &self.fields {
            st.serialize_field("campoAdicional", &CampoXml(field))?;
        }
        st.end()
    }
}
