//! Tax document domain types and builders.
mod builder;
pub mod sign;
pub mod xml;
pub use builder::{DocumentBuilder, RequiredDocumentFields};

use crate::access_key::AccessKey;
use bitflags::bitflags;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Round half away from zero and pin the scale, so `27` renders as `27.00`.
pub fn round_to(value: Decimal, dp: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(dp);
    rounded
}

pub fn round2(value: Decimal) -> Decimal {
    round_to(value, 2)
}

/// Largest amount the SRI schemas accept (14 digits, 2 of them decimals).
pub fn max_amount() -> Decimal {
    Decimal::new(99_999_999_999_999, 2)
}

/// Structured validation error with field-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("document validation failed: {}", summarize(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| match issue.line_item_index {
            Some(idx) => format!("{:?} {:?} (line {idx})", issue.field, issue.kind),
            None => format!("{:?} {:?}", issue.field, issue.kind),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }
}

/// Single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: DocumentField,
    pub kind: ValidationKind,
    pub line_item_index: Option<usize>,
}

impl ValidationIssue {
    fn new(field: DocumentField, kind: ValidationKind) -> Self {
        Self {
            field,
            kind,
            line_item_index: None,
        }
    }

    fn at(field: DocumentField, kind: ValidationKind, idx: usize) -> Self {
        Self {
            field,
            kind,
            line_item_index: Some(idx),
        }
    }
}

#[non_exhaustive]
/// Field associated with a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentField {
    IssuerRuc,
    IssuerLegalName,
    HeadOfficeAddress,
    Establishment,
    EmissionPoint,
    Counterparty,
    CounterpartyIdentification,
    CounterpartyName,
    LineItems,
    LineItemDescription,
    LineItemQuantity,
    LineItemUnitPrice,
    LineItemDiscount,
    LineItemTaxRate,
    ModifiedDocument,
    Reason,
    Withholdings,
    FiscalPeriod,
    Carrier,
    TransportDates,
    Plate,
    Recipients,
    AdditionalField,
    Payments,
}

#[non_exhaustive]
/// Classification of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Missing,
    Empty,
    InvalidFormat,
    OutOfRange,
    Mismatch,
}

/// Opaque document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Business tenant reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

bitflags! {
    /// What a document type carries and allows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DocumentCapabilities: u8 {
        const HAS_LINE_ITEMS = 0b0000_0001;
        const HAS_MONETARY_TOTALS = 0b0000_0010;
        const REFERENCES_MODIFIED_DOCUMENT = 0b0000_0100;
        const SUPPORTS_CANCELLATION = 0b0000_1000;
        const HAS_PAYMENTS = 0b0001_0000;
    }
}

/// Document types accepted by the SRI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Invoice,
    PurchaseSettlement,
    CreditNote,
    DebitNote,
    RemissionGuide,
    Retention,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::Invoice,
        DocumentType::PurchaseSettlement,
        DocumentType::CreditNote,
        DocumentType::DebitNote,
        DocumentType::RemissionGuide,
        DocumentType::Retention,
    ];

    /// Two-digit `codDoc`.
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "01",
            DocumentType::PurchaseSettlement => "03",
            DocumentType::CreditNote => "04",
            DocumentType::DebitNote => "05",
            DocumentType::RemissionGuide => "06",
            DocumentType::Retention => "07",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "INVOICE",
            DocumentType::PurchaseSettlement => "PURCHASE_SETTLEMENT",
            DocumentType::CreditNote => "CREDIT_NOTE",
            DocumentType::DebitNote => "DEBIT_NOTE",
            DocumentType::RemissionGuide => "REMISSION_GUIDE",
            DocumentType::Retention => "RETENTION",
        }
    }

    pub fn capabilities(&self) -> DocumentCapabilities {
        use DocumentCapabilities as C;
        match self {
            DocumentType::Invoice => {
                C::HAS_LINE_ITEMS | C::HAS_MONETARY_TOTALS | C::HAS_PAYMENTS | C::SUPPORTS_CANCELLATION
            }
            DocumentType::PurchaseSettlement => {
                C::HAS_LINE_ITEMS | C::HAS_MONETARY_TOTALS | C::HAS_PAYMENTS
            }
            DocumentType::CreditNote => {
                C::HAS_LINE_ITEMS | C::HAS_MONETARY_TOTALS | C::REFERENCES_MODIFIED_DOCUMENT
            }
            DocumentType::DebitNote => {
                C::HAS_LINE_ITEMS | C::HAS_MONETARY_TOTALS | C::REFERENCES_MODIFIED_DOCUMENT
            }
            DocumentType::RemissionGuide => C::empty(),
            DocumentType::Retention => C::HAS_MONETARY_TOTALS,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = UnknownDocumentType;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == upper || t.code() == upper)
            .ok_or_else(|| UnknownDocumentType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown document type: {0}")]
pub struct UnknownDocumentType(pub String);

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Draft,
    Generated,
    Signed,
    Sent,
    Authorized,
    Rejected,
    Error,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "DRAFT",
            DocumentStatus::Generated => "GENERATED",
            DocumentStatus::Signed => "SIGNED",
            DocumentStatus::Sent => "SENT",
            DocumentStatus::Authorized => "AUTHORIZED",
            DocumentStatus::Rejected => "REJECTED",
            DocumentStatus::Error => "ERROR",
            DocumentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Progress along the happy path; `Error` sits at the bottom.
    pub fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Error => 0,
            DocumentStatus::Draft => 1,
            DocumentStatus::Generated => 2,
            DocumentStatus::Signed => 3,
            DocumentStatus::Sent => 4,
            DocumentStatus::Authorized | DocumentStatus::Rejected => 5,
            DocumentStatus::Cancelled => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Authorized | DocumentStatus::Rejected | DocumentStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Draft, Generated)
                | (Draft, Error)
                | (Generated, Signed)
                | (Generated, Error)
                | (Signed, Sent)
                | (Signed, Error)
                | (Sent, Authorized)
                | (Sent, Rejected)
                | (Authorized, Cancelled)
        )
    }

    /// States `reprocess` may reset back to `Generated`.
    pub fn can_reprocess(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft
                | DocumentStatus::Generated
                | DocumentStatus::Signed
                | DocumentStatus::Error
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move document from {from} to {to}")]
pub struct TransitionError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

/// Buyer, supplier or carrier identification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationType {
    Ruc,
    Cedula,
    Passport,
    FinalConsumer,
    Foreign,
}

impl IdentificationType {
    pub fn code(&self) -> &'static str {
        match self {
            IdentificationType::Ruc => "04",
            IdentificationType::Cedula => "05",
            IdentificationType::Passport => "06",
            IdentificationType::FinalConsumer => "07",
            IdentificationType::Foreign => "08",
        }
    }

    fn accepts(&self, identification: &str) -> bool {
        let digits = identification.bytes().all(|b| b.is_ascii_digit());
        match self {
            IdentificationType::Ruc => digits && identification.len() == 13,
            IdentificationType::Cedula => digits && identification.len() == 10,
            IdentificationType::FinalConsumer => identification == FINAL_CONSUMER_ID,
            IdentificationType::Passport | IdentificationType::Foreign => true,
        }
    }
}

pub const FINAL_CONSUMER_ID: &str = "9999999999999";

/// Tax family (`codigo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCode {
    Iva,
    Ice,
    Irbpnr,
}

impl TaxCode {
    pub fn code(&self) -> &'static str {
        match self {
            TaxCode::Iva => "2",
            TaxCode::Ice => "3",
            TaxCode::Irbpnr => "5",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "2" => Some(TaxCode::Iva),
            "3" => Some(TaxCode::Ice),
            "5" => Some(TaxCode::Irbpnr),
            _ => None,
        }
    }
}

/// A tax applied to a line: family, rate code (`codigoPorcentaje`) and percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRule {
    pub code: TaxCode,
    pub rate_code: String,
    pub rate: Decimal,
}

impl TaxRule {
    pub fn new(code: TaxCode, rate_code: impl Into<String>, rate: Decimal) -> Self {
        Self {
            code,
            rate_code: rate_code.into(),
            rate,
        }
    }

    /// `round2(base * rate / 100)`.
    pub fn tax_on(&self, base: Decimal) -> Decimal {
        round2(base.saturating_mul(self.rate) / Decimal::ONE_HUNDRED)
    }
}

impl Default for TaxRule {
    /// IVA 15%.
    fn default() -> Self {
        Self::new(TaxCode::Iva, "4", Decimal::from(15))
    }
}

/// Computed tax for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxLine {
    pub code: TaxCode,
    pub rate_code: String,
    pub rate: Decimal,
    pub base: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub name: String,
    pub value: String,
}

impl AdditionalField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Goods or service line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub main_code: String,
    #[serde(default)]
    pub auxiliary_code: Option<String>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub details: Vec<AdditionalField>,
    #[serde(default)]
    pub taxes: Vec<TaxRule>,
}

impl LineItem {
    pub fn new(
        main_code: impl Into<String>,
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Self {
        Self {
            main_code: main_code.into(),
            auxiliary_code: None,
            description: description.into(),
            quantity,
            unit_price,
            discount: Decimal::ZERO,
            details: Vec::new(),
            taxes: Vec::new(),
        }
    }

    pub fn with_discount(mut self, discount: Decimal) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_tax(mut self, tax: TaxRule) -> Self {
        self.taxes.push(tax);
        self
    }

    /// `round2(quantity * unit_price - discount)`, saturating on overflow.
    pub fn subtotal(&self) -> Decimal {
        round2(
            self.quantity
                .saturating_mul(self.unit_price)
                .saturating_sub(self.discount),
        )
    }

    /// [`LineItem::subtotal`], or `None` when the amounts overflow.
    pub fn checked_subtotal(&self) -> Option<Decimal> {
        self.quantity
            .checked_mul(self.unit_price)?
            .checked_sub(self.discount)
            .map(round2)
    }

    /// Taxes on this line, falling back to `default_tax` when none are set.
    pub fn tax_lines(&self, default_tax: &TaxRule) -> Vec<TaxLine> {
        let base = self.subtotal();
        let rules = if self.taxes.is_empty() {
            std::slice::from_ref(default_tax)
        } else {
            self.taxes.as_slice()
        };
        rules
            .iter()
            .map(|rule| TaxLine {
                code: rule.code,
                rate_code: rule.rate_code.clone(),
                rate: rule.rate,
                base,
                value: rule.tax_on(base),
            })
            .collect()
    }
}

/// Issuing taxpayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuer {
    pub ruc: String,
    pub legal_name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    pub head_office_address: String,
    pub establishment_address: String,
    #[serde(default)]
    pub special_taxpayer: Option<String>,
    #[serde(default)]
    pub accounting_required: bool,
}

/// Buyer, supplier or withheld subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub identification_type: IdentificationType,
    pub identification: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Counterparty {
    pub fn final_consumer() -> Self {
        Self {
            identification_type: IdentificationType::FinalConsumer,
            identification: FINAL_CONSUMER_ID.to_string(),
            name: "CONSUMIDOR FINAL".to_string(),
            address: None,
            email: None,
            phone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionPoint {
    pub establishment: String,
    pub point: String,
}

impl EmissionPoint {
    pub fn new(establishment: impl Into<String>, point: impl Into<String>) -> Self {
        Self {
            establishment: establishment.into(),
            point: point.into(),
        }
    }
}

/// Reference to a previously issued document (`EEE-PPP-NNNNNNNNN`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReference {
    pub document_type: DocumentType,
    pub number: String,
    pub issue_date: NaiveDate,
}

impl DocumentReference {
    pub fn has_valid_number(&self) -> bool {
        let parts: Vec<&str> = self.number.split('-').collect();
        matches!(parts.as_slice(), [e, p, s]
            if e.len() == 3 && p.len() == 3 && s.len() == 9
                && parts.iter().all(|part| part.bytes().all(|b| b.is_ascii_digit())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// `formaPago` code, e.g. `01` cash or `20` other with financial system.
    pub method: String,
    pub total: Decimal,
}

/// Withheld tax family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithholdingTax {
    Renta,
    Iva,
    Isd,
}

impl WithholdingTax {
    pub fn code(&self) -> &'static str {
        match self {
            WithholdingTax::Renta => "1",
            WithholdingTax::Iva => "2",
            WithholdingTax::Isd => "6",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withholding {
    pub tax: WithholdingTax,
    pub retention_code: String,
    pub base: Decimal,
    pub percentage: Decimal,
    pub support: DocumentReference,
}

impl Withholding {
    pub fn withheld(&self) -> Decimal {
        round2(self.base.saturating_mul(self.percentage) / Decimal::ONE_HUNDRED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedItem {
    pub code: String,
    pub description: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub identification: String,
    pub name: String,
    pub address: String,
    pub reason: String,
    #[serde(default)]
    pub support: Option<DocumentReference>,
    #[serde(default)]
    pub support_authorization: Option<String>,
    pub items: Vec<ShippedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Carrier {
    pub identification_type: IdentificationType,
    pub identification: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub departure_address: String,
    pub carrier: Carrier,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub plate: String,
    pub recipients: Vec<Recipient>,
}

/// Type-specific content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentBody {
    Invoice {
        #[serde(default)]
        payments: Vec<Payment>,
    },
    PurchaseSettlement {
        #[serde(default)]
        payments: Vec<Payment>,
    },
    CreditNote {
        modified: DocumentReference,
        reason: String,
    },
    DebitNote {
        modified: DocumentReference,
        #[serde(default)]
        payments: Vec<Payment>,
    },
    RemissionGuide(Shipment),
    Retention {
        /// `mm/yyyy`.
        fiscal_period: String,
        withholdings: Vec<Withholding>,
    },
}

impl DocumentBody {
    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentBody::Invoice { .. } => DocumentType::Invoice,
            DocumentBody::PurchaseSettlement { .. } => DocumentType::PurchaseSettlement,
            DocumentBody::CreditNote { .. } => DocumentType::CreditNote,
            DocumentBody::DebitNote { .. } => DocumentType::DebitNote,
            DocumentBody::RemissionGuide(_) => DocumentType::RemissionGuide,
            DocumentBody::Retention { .. } => DocumentType::Retention,
        }
    }
}

/// Aggregated tax by `(code, rate_code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxGroup {
    pub code: TaxCode,
    pub rate_code: String,
    pub rate: Decimal,
    pub base: Decimal,
    pub value: Decimal,
}

/// Monetary totals, all at 2 decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub tax_groups: Vec<TaxGroup>,
    pub total_tax: Decimal,
    pub tip: Decimal,
    pub total: Decimal,
}

impl DocumentTotals {
    /// Totals for line items, grouping taxes by `(code, rate_code)`.
    ///
    /// # Examples
    /// ```rust
    /// use rust_decimal::Decimal;
    /// use sri_core::document::{DocumentTotals, LineItem, TaxRule};
    ///
    /// let item = LineItem::new("P1", "Widget", Decimal::new(2, 0), Decimal::new(15, 0))
    ///     .with_discount(Decimal::new(3, 0));
    /// let totals = DocumentTotals::compute(&[item], &TaxRule::default());
    /// assert_eq!(totals.subtotal.to_string(), "27.00");
    /// assert_eq!(totals.total_tax.to_string(), "4.05");
    /// assert_eq!(totals.total.to_string(), "31.05");
    /// ```
    pub fn compute(items: &[LineItem], default_tax: &TaxRule) -> Self {
        let mut groups: Vec<TaxGroup> = Vec::new();
        let mut subtotal = Decimal::ZERO;
        let mut total_discount = Decimal::ZERO;

        for item in items {
            subtotal = subtotal.saturating_add(item.subtotal());
            total_discount = total_discount.saturating_add(item.discount);
            for line in item.tax_lines(default_tax) {
                match groups
                    .iter_mut()
                    .find(|g| g.code == line.code && g.rate_code == line.rate_code)
                {
                    Some(group) => {
                        group.base = group.base.saturating_add(line.base);
                        group.value = group.value.saturating_add(line.value);
                    }
                    None => groups.push(TaxGroup {
                        code: line.code,
                        rate_code: line.rate_code,
                        rate: line.rate,
                        base: line.base,
                        value: line.value,
                    }),
                }
            }
        }

        for group in &mut groups {
            group.base = round2(group.base);
            group.value = round2(group.value);
        }
        let total_tax = round2(
            groups
                .iter()
                .fold(Decimal::ZERO, |sum, g| sum.saturating_add(g.value)),
        );
        let subtotal = round2(subtotal);
        Self {
            subtotal,
            total_discount: round2(total_discount),
            tax_groups: groups,
            total_tax,
            tip: round2(Decimal::ZERO),
            total: round2(subtotal.saturating_add(total_tax)),
        }
    }

    /// `subtotal + tax + tip == total` at 2 decimals.
    pub fn reconciles(&self) -> bool {
        round2(self.subtotal + self.total_tax + self.tip) == round2(self.total)
    }
}

/// Locators of artifacts held by the artifact store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub xml: Option<String>,
    pub signed_xml: Option<String>,
    pub pdf: Option<String>,
}

/// Authorization granted by the SRI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub number: String,
    pub authorized_at: Option<DateTime<FixedOffset>>,
}

/// A tax document and its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    tenant_id: TenantId,
    issuer: Issuer,
    emission_point: EmissionPoint,
    issue_date: NaiveDate,
    counterparty: Option<Counterparty>,
    items: Vec<LineItem>,
    body: DocumentBody,
    additional_fields: Vec<AdditionalField>,
    sequence: Option<u64>,
    access_key: Option<AccessKey>,
    status: DocumentStatus,
    totals: Option<DocumentTotals>,
    artifacts: ArtifactRefs,
    authorization: Option<Authorization>,
    last_error: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Document {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn document_type(&self) -> DocumentType {
        self.body.document_type()
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn emission_point(&self) -> &EmissionPoint {
        &self.emission_point
    }

    pub fn issue_date(&self) -> NaiveDate {
        self.issue_date
    }

    pub fn counterparty(&self) -> Option<&Counterparty> {
        self.counterparty.as_ref()
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn body(&self) -> &DocumentBody {
        &self.body
    }

    pub fn additional_fields(&self) -> &[AdditionalField] {
        &self.additional_fields
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// `EEE-PPP-NNNNNNNNN` once a sequence is assigned.
    pub fn document_number(&self) -> Option<String> {
        self.sequence.map(|seq| {
            format!(
                "{}-{}-{seq:09}",
                self.emission_point.establishment, self.emission_point.point
            )
        })
    }

    pub fn access_key(&self) -> Option<&AccessKey> {
        self.access_key.as_ref()
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn totals(&self) -> Option<&DocumentTotals> {
        self.totals.as_ref()
    }

    pub fn artifacts(&self) -> &ArtifactRefs {
        &self.artifacts
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Structural checks run before generation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        use DocumentField as F;
        use ValidationKind as K;
        let mut issues = Vec::new();
        let caps = self.document_type().capabilities();

        if !is_digits(&self.issuer.ruc, 13) {
            issues.push(ValidationIssue::new(F::IssuerRuc, K::InvalidFormat));
        }
        if self.issuer.legal_name.trim().is_empty() {
            issues.push(ValidationIssue::new(F::IssuerLegalName, K::Empty));
        }
        if self.issuer.head_office_address.trim().is_empty() {
            issues.push(ValidationIssue::new(F::HeadOfficeAddress, K::Empty));
        }
        if !is_digits(&self.emission_point.establishment, 3) {
            issues.push(ValidationIssue::new(F::Establishment, K::InvalidFormat));
        }
        if !is_digits(&self.emission_point.point, 3) {
            issues.push(ValidationIssue::new(F::EmissionPoint, K::InvalidFormat));
        }

        match (&self.counterparty, self.document_type()) {
            (None, DocumentType::RemissionGuide) => {}
            (None, _) => issues.push(ValidationIssue::new(F::Counterparty, K::Missing)),
            (Some(party), _) => {
                if party.identification.trim().is_empty() {
                    issues.push(ValidationIssue::new(F::CounterpartyIdentification, K::Empty));
                } else if !party.identification_type.accepts(&party.identification) {
                    issues.push(ValidationIssue::new(
                        F::CounterpartyIdentification,
                        K::InvalidFormat,
                    ));
                }
                if party.name.trim().is_empty() {
                    issues.push(ValidationIssue::new(F::CounterpartyName, K::Empty));
                }
            }
        }

        if caps.contains(DocumentCapabilities::HAS_LINE_ITEMS) {
            if self.items.is_empty() {
                issues.push(ValidationIssue::new(F::LineItems, K::Empty));
            }
            let mut lines_total = Some(Decimal::ZERO);
            for (idx, item) in self.items.iter().enumerate() {
                if item.description.trim().is_empty() {
                    issues.push(ValidationIssue::at(F::LineItemDescription, K::Empty, idx));
                }
                if item.quantity <= Decimal::ZERO {
                    issues.push(ValidationIssue::at(F::LineItemQuantity, K::OutOfRange, idx));
                }
                if item.unit_price < Decimal::ZERO {
                    issues.push(ValidationIssue::at(F::LineItemUnitPrice, K::OutOfRange, idx));
                }
                match item
                    .quantity
                    .checked_mul(item.unit_price)
                    .filter(|gross| gross.abs() <= max_amount())
                {
                    None => {
                        issues.push(ValidationIssue::at(F::LineItemUnitPrice, K::OutOfRange, idx))
                    }
                    Some(gross) => {
                        if item.discount < Decimal::ZERO || item.discount > gross {
                            issues.push(ValidationIssue::at(
                                F::LineItemDiscount,
                                K::OutOfRange,
                                idx,
                            ));
                        }
                    }
                }
                if item
                    .taxes
                    .iter()
                    .any(|t| t.rate < Decimal::ZERO || t.rate > Decimal::ONE_HUNDRED)
                {
                    issues.push(ValidationIssue::at(F::LineItemTaxRate, K::OutOfRange, idx));
                }
                lines_total = lines_total
                    .zip(item.checked_subtotal())
                    .and_then(|(sum, line)| sum.checked_add(line));
            }
            if !lines_total.is_some_and(|total| total <= max_amount()) {
                issues.push(ValidationIssue::new(F::LineItems, K::OutOfRange));
            }
        }

        match &self.body {
            DocumentBody::CreditNote { modified, reason } => {
                if !modified.has_valid_number() {
                    issues.push(ValidationIssue::new(F::ModifiedDocument, K::InvalidFormat));
                }
                if reason.trim().is_empty() {
                    issues.push(ValidationIssue::new(F::Reason, K::Empty));
                }
            }
            DocumentBody::DebitNote { modified, .. } => {
                if !modified.has_valid_number() {
                    issues.push(ValidationIssue::new(F::ModifiedDocument, K::InvalidFormat));
                }
            }
            DocumentBody::Retention {
                fiscal_period,
                withholdings,
            } => {
                if !is_fiscal_period(fiscal_period) {
                    issues.push(ValidationIssue::new(F::FiscalPeriod, K::InvalidFormat));
                }
                if withholdings.is_empty() {
                    issues.push(ValidationIssue::new(F::Withholdings, K::Empty));
                }
                for (idx, w) in withholdings.iter().enumerate() {
                    if w.base < Decimal::ZERO
                        || w.base > max_amount()
                        || w.percentage < Decimal::ZERO
                        || w.percentage > Decimal::ONE_HUNDRED
                    {
                        issues.push(ValidationIssue::at(F::Withholdings, K::OutOfRange, idx));
                    }
                    if !w.support.has_valid_number() {
                        issues.push(ValidationIssue::at(F::ModifiedDocument, K::InvalidFormat, idx));
                    }
                }
            }
            DocumentBody::RemissionGuide(shipment) => {
                if !shipment
                    .carrier
                    .identification_type
                    .accepts(&shipment.carrier.identification)
                {
                    issues.push(ValidationIssue::new(F::Carrier, K::InvalidFormat));
                }
                if shipment.end_date < shipment.start_date {
                    issues.push(ValidationIssue::new(F::TransportDates, K::OutOfRange));
                }
                if shipment.plate.trim().is_empty() {
                    issues.push(ValidationIssue::new(F::Plate, K::Empty));
                }
                if shipment.recipients.is_empty() {
                    issues.push(ValidationIssue::new(F::Recipients, K::Empty));
                }
                for (idx, r) in shipment.recipients.iter().enumerate() {
                    if r.items.is_empty() {
                        issues.push(ValidationIssue::at(F::Recipients, K::Empty, idx));
                    }
                }
            }
            DocumentBody::Invoice { payments } | DocumentBody::PurchaseSettlement { payments } => {
                if payments.iter().any(|p| p.total < Decimal::ZERO) {
                    issues.push(ValidationIssue::new(F::Payments, K::OutOfRange));
                }
            }
        }

        for (idx, field) in self.additional_fields.iter().enumerate() {
            if field.name.trim().is_empty() || field.value.trim().is_empty() {
                issues.push(ValidationIssue::at(F::AdditionalField, K::Empty, idx));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(issues))
        }
    }

    /// Totals computed from the lines, or `None` for types without amounts.
    pub fn compute_totals(&self, default_tax: &TaxRule) -> Option<DocumentTotals> {
        let caps = self.document_type().capabilities();
        if caps.contains(DocumentCapabilities::HAS_LINE_ITEMS) {
            return Some(DocumentTotals::compute(&self.items, default_tax));
        }
        if let DocumentBody::Retention { withholdings, .. } = &self.body {
            let withheld = round2(withholdings.iter().map(Withholding::withheld).sum());
            return Some(DocumentTotals {
                subtotal: withheld,
                total_discount: round2(Decimal::ZERO),
                tax_groups: Vec::new(),
                total_tax: round2(Decimal::ZERO),
                tip: round2(Decimal::ZERO),
                total: withheld,
            });
        }
        None
    }

    pub(crate) fn transition_to(&mut self, next: DocumentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        if next == DocumentStatus::Sent {
            self.sent_at = Some(Utc::now());
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Mark the document failed, keeping the message.
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        if self.status.can_transition_to(DocumentStatus::Error) {
            self.status = DocumentStatus::Error;
        }
        self.touch();
    }

    /// Put back a status lost to an ambiguous outcome. Never moves backwards.
    pub(crate) fn restore_status(&mut self, status: DocumentStatus) -> bool {
        if status.rank() > self.status.rank() {
            self.status = status;
            self.touch();
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_for_reprocess(&mut self) -> Result<(), TransitionError> {
        if !self.status.can_reprocess() {
            return Err(TransitionError {
                from: self.status,
                to: DocumentStatus::Generated,
            });
        }
        self.status = DocumentStatus::Generated;
        self.last_error = None;
        self.artifacts.signed_xml = None;
        self.touch();
        Ok(())
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    pub(crate) fn set_access_key(&mut self, key: AccessKey) {
        self.access_key = Some(key);
    }

    pub(crate) fn set_totals(&mut self, totals: Option<DocumentTotals>) {
        self.totals = totals;
    }

    pub(crate) fn artifacts_mut(&mut self) -> &mut ArtifactRefs {
        &mut self.artifacts
    }

    pub(crate) fn set_authorization(&mut self, authorization: Authorization) {
        self.authorization = Some(authorization);
    }

    pub(crate) fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn is_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_fiscal_period(value: &str) -> bool {
    match value.split_once('/') {
        Some((month, year)) => {
            is_digits(month, 2)
                && is_digits(year, 4)
                && month.parse::<u32>().is_ok_and(|m| (1..=12).contains(&m))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounding_is_half_up_with_fixed_scale() {
        assert_eq!(round2(dec!(2.345)).to_string(), "2.35");
        assert_eq!(round2(dec!(-2.345)).to_string(), "-2.35");
        assert_eq!(round2(dec!(27)).to_string(), "27.00");
        assert_eq!(round_to(dec!(2), 6).to_string(), "2.000000");
    }

    #[test]
    fn totals_group_by_code_and_rate() {
        let zero = TaxRule::new(TaxCode::Iva, "0", dec!(0));
        let items = vec![
            LineItem::new("A", "a", dec!(1), dec!(10)),
            LineItem::new("B", "b", dec!(3), dec!(1.10)),
            LineItem::new("C", "c", dec!(1), dec!(5)).with_tax(zero),
        ];
        let totals = DocumentTotals::compute(&items, &TaxRule::default());
        assert_eq!(totals.tax_groups.len(), 2);
        let iva15 = &totals.tax_groups[0];
        assert_eq!(iva15.base, dec!(13.30));
        assert_eq!(iva15.value, dec!(2.00));
        assert_eq!(totals.tax_groups[1].value.to_string(), "0.00");
        assert_eq!(totals.subtotal, dec!(18.30));
        assert_eq!(totals.total, dec!(20.30));
        assert!(totals.reconciles());
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use DocumentStatus::*;
        assert!(Draft.can_transition_to(Generated));
        assert!(Sent.can_transition_to(Authorized));
        assert!(Authorized.can_transition_to(Cancelled));
        assert!(!Sent.can_transition_to(Generated));
        assert!(!Rejected.can_transition_to(Sent));
        assert!(!Authorized.can_transition_to(Error));
        assert!(Error.can_reprocess());
        assert!(!Sent.can_reprocess());
    }

    #[test]
    fn capabilities_reflect_type() {
        assert!(DocumentType::Invoice
            .capabilities()
            .contains(DocumentCapabilities::SUPPORTS_CANCELLATION));
        assert!(!DocumentType::CreditNote
            .capabilities()
            .contains(DocumentCapabilities::SUPPORTS_CANCELLATION));
        assert!(DocumentType::RemissionGuide.capabilities().is_empty());
    }

    #[test]
    fn document_type_parses_names_and_codes() {
        assert_eq!("credit-note".parse::<DocumentType>().unwrap(), DocumentType::CreditNote);
        assert_eq!("07".parse::<DocumentType>().unwrap(), DocumentType::Retention);
        assert!("99".parse::<DocumentType>().is_err());
    }

    #[test]
    fn reference_number_format() {
        let mut reference = DocumentReference {
            document_type: DocumentType::Invoice,
            number: "001-002-000000123".into(),
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        };
        assert!(reference.has_valid_number());
        reference.number = "001-002-123".into();
        assert!(!reference.has_valid_number());
    }

    #[test]
    fn fiscal_period_format() {
        assert!(is_fiscal_period("01/2024"));
        assert!(!is_fiscal_period("13/2024"));
        assert!(!is_fiscal_period("1/2024"));
    }
}
