use super::{
    AdditionalField, ArtifactRefs, Counterparty, Document, DocumentBody, DocumentId,
    DocumentStatus, EmissionPoint, Issuer, LineItem, TenantId, ValidationError,
};
use crate::access_key::AccessKey;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

/// Fields every document needs.
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredDocumentFields {
    pub tenant_id: TenantId,
    pub issuer: Issuer,
    pub emission_point: EmissionPoint,
    pub issue_date: NaiveDate,
    pub body: DocumentBody,
}

/// Assembles a [`Document`] in `DRAFT`.
///
/// Also deserializable from JSON, which is how the CLI reads documents.
///
/// # Examples
/// ```rust
/// use chrono::NaiveDate;
/// use rust_decimal::Decimal;
/// use sri_core::document::{
///     Counterparty, DocumentBody, DocumentBuilder, DocumentStatus, EmissionPoint, Issuer,
///     LineItem, RequiredDocumentFields, TenantId,
/// };
///
/// let doc = DocumentBuilder::new(RequiredDocumentFields {
///     tenant_id: TenantId::new("acme"),
///     issuer: Issuer {
///         ruc: "1791737409001".into(),
///         legal_name: "ACME S.A.".into(),
///         trade_name: None,
///         head_office_address: "Av. Amazonas".into(),
///         establishment_address: "Av. Amazonas".into(),
///         special_taxpayer: None,
///         accounting_required: true,
///     },
///     emission_point: EmissionPoint::new("001", "001"),
///     issue_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
///     body: DocumentBody::Invoice { payments: vec![] },
/// })
/// .counterparty(Counterparty::final_consumer())
/// .item(LineItem::new("P1", "Widget", Decimal::ONE, Decimal::TEN))
/// .build()?;
/// assert_eq!(doc.status(), DocumentStatus::Draft);
/// # Ok::<(), sri_core::document::ValidationError>(())
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentBuilder {
    #[serde(flatten)]
    required: RequiredDocumentFields,
    #[serde(default)]
    counterparty: Option<Counterparty>,
    #[serde(default)]
    items: Vec<LineItem>,
    #[serde(default)]
    additional_fields: Vec<AdditionalField>,
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(default)]
    access_key: Option<AccessKey>,
}

impl DocumentBuilder {
    pub fn new(required: RequiredDocumentFields) -> Self {
        Self {
            required,
            counterparty: None,
            items: Vec::new(),
            additional_fields: Vec::new(),
            sequence: None,
            access_key: None,
        }
    }

    pub fn counterparty(mut self, counterparty: Counterparty) -> Self {
        self.counterparty = Some(counterparty);
        self
    }

    pub fn item(mut self, item: LineItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn items(mut self, items: impl IntoIterator<Item = LineItem>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn additional_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_fields.push(AdditionalField::new(name, value));
        self
    }

    /// Pre-assigned sequence. Left empty, the pipeline allocates one.
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Pre-assigned access key. Left empty, the pipeline generates one.
    pub fn access_key(mut self, key: AccessKey) -> Self {
        self.access_key = Some(key);
        self
    }

    /// Validate and produce a `DRAFT` document with a fresh id.
    pub fn build(self) -> Result<Document, ValidationError> {
        let now = Utc::now();
        let RequiredDocumentFields {
            tenant_id,
            issuer,
            emission_point,
            issue_date,
            body,
        } = self.required;
        let document = Document {
            id: DocumentId::new(),
            tenant_id,
            issuer,
            emission_point,
            issue_date,
            counterparty: self.counterparty,
            items: self.items,
            body,
            additional_fields: self.additional_fields,
            sequence: self.sequence,
            access_key: self.access_key,
            status: DocumentStatus::Draft,
            totals: None,
            artifacts: ArtifactRefs::default(),
            authorization: None,
            last_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        document.validate()?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentField, IdentificationType, TaxCode, TaxRule, ValidationKind};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn required() -> RequiredDocumentFields {
        RequiredDocumentFields {
            tenant_id: TenantId::new("t1"),
            issuer: Issuer {
                ruc: "1791737409001".into(),
                legal_name: "ACME".into(),
                trade_name: None,
                head_office_address: "Quito".into(),
                establishment_address: "Quito".into(),
                special_taxpayer: None,
                accounting_required: false,
            },
            emission_point: EmissionPoint::new("001", "001"),
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            body: DocumentBody::Invoice { payments: vec![] },
        }
    }

    #[test]
    fn build_collects_all_issues() {
        let err = DocumentBuilder::new(required())
            .counterparty(Counterparty {
                identification_type: IdentificationType::Cedula,
                identification: "123".into(),
                name: "".into(),
                address: None,
                email: None,
                phone: None,
            })
            .item(LineItem::new("A", "", dec!(0), dec!(1)))
            .build()
            .unwrap_err();

        let has = |field, kind, idx| {
            err.issues
                .iter()
                .any(|i| i.field == field && i.kind == kind && i.line_item_index == idx)
        };
        assert!(has(
            DocumentField::CounterpartyIdentification,
            ValidationKind::InvalidFormat,
            None
        ));
        assert!(has(DocumentField::CounterpartyName, ValidationKind::Empty, None));
        assert!(has(DocumentField::LineItemDescription, ValidationKind::Empty, Some(0)));
        assert!(has(DocumentField::LineItemQuantity, ValidationKind::OutOfRange, Some(0)));
    }

    #[test]
    fn invoice_requires_counterparty_and_items() {
        let err = DocumentBuilder::new(required()).build().unwrap_err();
        let fields: Vec<_> = err.issues.iter().map(|i| i.field).collect();
        assert!(fields.contains(&DocumentField::Counterparty));
        assert!(fields.contains(&DocumentField::LineItems));
    }

    fn consumer() -> Counterparty {
        Counterparty::final_consumer()
    }

    #[test]
    fn oversized_amounts_are_rejected_not_computed() {
        let err = DocumentBuilder::new(required())
            .counterparty(consumer())
            .item(LineItem::new("A", "Huge", Decimal::MAX, Decimal::MAX))
            .build()
            .unwrap_err();
        assert!(err.issues.iter().any(|i| {
            i.field == DocumentField::LineItemUnitPrice
                && i.kind == ValidationKind::OutOfRange
                && i.line_item_index == Some(0)
        }));
        assert_eq!(
            LineItem::new("A", "Huge", Decimal::MAX, Decimal::MAX).checked_subtotal(),
            None
        );
    }

    #[test]
    fn lines_may_not_add_up_past_schema_limit() {
        let line = || LineItem::new("A", "Big", dec!(1), dec!(600000000000));
        let err = DocumentBuilder::new(required())
            .counterparty(consumer())
            .item(line())
            .item(line())
            .build()
            .unwrap_err();
        assert!(err.issues.iter().any(|i| {
            i.field == DocumentField::LineItems && i.kind == ValidationKind::OutOfRange
        }));

        let ok = DocumentBuilder::new(required())
            .counterparty(consumer())
            .item(line())
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn tax_rate_above_hundred_is_out_of_range() {
        let err = DocumentBuilder::new(required())
            .counterparty(consumer())
            .item(
                LineItem::new("A", "Widget", dec!(1), dec!(10))
                    .with_tax(TaxRule::new(TaxCode::Iva, "4", dec!(1500))),
            )
            .build()
            .unwrap_err();
        assert!(err.issues.iter().any(|i| {
            i.field == DocumentField::LineItemTaxRate && i.line_item_index == Some(0)
        }));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "tenant_id": "t1",
            "issuer": {
                "ruc": "1791737409001",
                "legal_name": "ACME",
                "head_office_address": "Quito",
                "establishment_address": "Quito"
            },
            "emission_point": {"establishment": "001", "point": "002"},
            "issue_date": "2024-01-15",
            "body": {"type": "INVOICE"},
            "counterparty": {
                "identification_type": "final_consumer",
                "identification": "9999999999999",
                "name": "CONSUMIDOR FINAL"
            },
            "items": [
                {"main_code": "P1", "description": "Widget", "quantity": "2", "unit_price": "15", "discount": "3"}
            ]
        }"#;
        let doc = serde_json::from_str::<DocumentBuilder>(json)
            .unwrap()
            .sequence(7)
            .build()
            .unwrap();
        assert_eq!(doc.document_number().as_deref(), Some("001-002-000000007"));
        assert_eq!(doc.items()[0].subtotal(), dec!(27.00));
    }
}
