//! 49-digit access keys (`claveAcceso`).
//!
//! Layout: `[ddmmyyyy][type:2][ruc:13][env:1][estab:3][point:3][seq:9][numeric:8][emission:1][check:1]`.
use crate::config::Environment;
use crate::document::DocumentType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const ACCESS_KEY_LEN: usize = 49;
const BODY_LEN: usize = ACCESS_KEY_LEN - 1;
const WEIGHTS: [u32; 6] = [2, 3, 4, 5, 6, 7];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key body must be {expected} digits, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("non-digit character at position {position}")]
    NonDigit { position: usize },
    #[error("{field} does not fit in {width} digits: {value}")]
    FieldOverflow {
        field: &'static str,
        width: usize,
        value: String,
    },
    #[error("check digit mismatch: expected {expected}, found {found}")]
    CheckDigit { expected: u8, found: u8 },
    #[error("unknown document type code {0}")]
    UnknownDocumentType(String),
    #[error("invalid date segment {0}")]
    InvalidDate(String),
}

/// Modulo-11 check digit over a 48-digit body.
///
/// Weights 2..=7 cycle from the rightmost digit. With `r = sum % 11`, the
/// digit is `r` when `r < 2`, otherwise `11 - r`.
///
/// # Examples
/// ```rust
/// use sri_core::access_key::check_digit;
///
/// let body = "211020110117921467390011002001000000001123456781";
/// assert_eq!(check_digit(body)?, 3);
/// # Ok::<(), sri_core::access_key::AccessKeyError>(())
/// ```
pub fn check_digit(body: &str) -> Result<u8, AccessKeyError> {
    if body.len() != BODY_LEN {
        return Err(AccessKeyError::InvalidLength {
            expected: BODY_LEN,
            actual: body.len(),
        });
    }
    let mut sum = 0u32;
    for (i, byte) in body.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return Err(AccessKeyError::NonDigit {
                position: BODY_LEN - 1 - i,
            });
        }
        sum += u32::from(byte - b'0') * WEIGHTS[i % WEIGHTS.len()];
    }
    let r = sum % 11;
    let digit = if r < 2 { r } else { 11 - r };
    Ok(digit as u8)
}

/// Inputs to an access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyParts {
    pub issue_date: NaiveDate,
    pub document_type: DocumentType,
    pub tax_id: String,
    pub environment: Environment,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: u64,
    pub numeric_code: String,
    pub emission_type: String,
}

impl AccessKeyParts {
    /// Build the 48-digit body and append its check digit.
    pub fn generate(&self) -> Result<AccessKey, AccessKeyError> {
        let mut body = String::with_capacity(ACCESS_KEY_LEN);
        body.push_str(&self.issue_date.format("%d%m%Y").to_string());
        body.push_str(self.document_type.code());
        body.push_str(&padded("tax_id", &self.tax_id, 13)?);
        body.push(self.environment.digit());
        body.push_str(&padded("establishment", &self.establishment, 3)?);
        body.push_str(&padded("emission_point", &self.emission_point, 3)?);
        body.push_str(&padded("sequence", &self.sequence.to_string(), 9)?);
        body.push_str(&padded("numeric_code", &self.numeric_code, 8)?);
        body.push_str(&padded("emission_type", &self.emission_type, 1)?);

        let digit = check_digit(&body)?;
        body.push(char::from(b'0' + digit));
        Ok(AccessKey(body))
    }
}

fn padded(field: &'static str, value: &str, width: usize) -> Result<String, AccessKeyError> {
    let value = value.trim();
    if let Some(position) = value.bytes().position(|b| !b.is_ascii_digit()) {
        return Err(AccessKeyError::NonDigit { position });
    }
    if value.len() > width {
        return Err(AccessKeyError::FieldOverflow {
            field,
            width,
            value: value.to_string(),
        });
    }
    Ok(format!("{value:0>width$}"))
}

/// A verified 49-digit access key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Validate length, digits and check digit.
    pub fn parse(value: &str) -> Result<Self, AccessKeyError> {
        let value = value.trim();
        if value.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::InvalidLength {
                expected: ACCESS_KEY_LEN,
                actual: value.len(),
            });
        }
        if let Some(position) = value.bytes().position(|b| !b.is_ascii_digit()) {
            return Err(AccessKeyError::NonDigit { position });
        }
        let expected = check_digit(&value[..BODY_LEN])?;
        let found = value.as_bytes()[BODY_LEN] - b'0';
        if expected != found {
            return Err(AccessKeyError::CheckDigit { expected, found });
        }
        Ok(Self(value.to_string()))
    }

    pub fn verify(value: &str) -> bool {
        Self::parse(value).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the key back into its segments.
    pub fn parts(&self) -> Result<AccessKeyParts, AccessKeyError> {
        let s = &self.0;
        let issue_date = NaiveDate::parse_from_str(&s[0..8], "%d%m%Y")
            .map_err(|_| AccessKeyError::InvalidDate(s[0..8].to_string()))?;
        let document_type = DocumentType::from_code(&s[8..10])
            .ok_or_else(|| AccessKeyError::UnknownDocumentType(s[8..10].to_string()))?;
        let environment = match &s[23..24] {
            "2" => Environment::Production,
            _ => Environment::Test,
        };
        let sequence = s[30..39]
            .parse()
            .map_err(|_| AccessKeyError::NonDigit { position: 30 })?;
        Ok(AccessKeyParts {
            issue_date,
            document_type,
            tax_id: s[10..23].to_string(),
            environment,
            establishment: s[24..27].to_string(),
            emission_point: s[27..30].to_string(),
            sequence,
            numeric_code: s[39..47].to_string(),
            emission_type: s[47..48].to_string(),
        })
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(value: AccessKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> AccessKeyParts {
        AccessKeyParts {
            issue_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            document_type: DocumentType::Invoice,
            tax_id: "1791737409001".into(),
            environment: Environment::Test,
            establishment: "001".into(),
            emission_point: "001".into(),
            sequence: 1,
            numeric_code: "12345678".into(),
            emission_type: "1".into(),
        }
    }

    #[test]
    fn generates_known_key() {
        let key = parts().generate().unwrap();
        assert_eq!(
            key.as_str(),
            "1501202401179173740900110010010000000011234567814"
        );
        assert!(AccessKey::verify(key.as_str()));
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(parts().generate().unwrap(), parts().generate().unwrap());
    }

    #[test]
    fn remainders_zero_and_one_map_to_themselves() {
        let mut p = parts();
        p.sequence = 4;
        assert_eq!(p.generate().unwrap().as_str().as_bytes()[48], b'0');
        p.sequence = 2;
        assert_eq!(p.generate().unwrap().as_str().as_bytes()[48], b'1');
    }

    #[test]
    fn pads_short_fields() {
        let mut p = parts();
        p.establishment = "2".into();
        p.emission_point = "3".into();
        p.sequence = 42;
        p.document_type = DocumentType::CreditNote;
        p.environment = Environment::Production;
        let key = p.generate().unwrap();
        assert_eq!(
            key.as_str(),
            "1501202404179173740900120020030000000421234567817"
        );
    }

    #[test]
    fn rejects_overflowing_sequence() {
        let mut p = parts();
        p.sequence = 1_000_000_000;
        assert!(matches!(
            p.generate(),
            Err(AccessKeyError::FieldOverflow { field: "sequence", .. })
        ));
    }

    #[test]
    fn rejects_non_digit_tax_id() {
        let mut p = parts();
        p.tax_id = "17917A7409001".into();
        assert!(matches!(p.generate(), Err(AccessKeyError::NonDigit { .. })));
    }

    #[test]
    fn parse_detects_tampering() {
        let err = AccessKey::parse("1501202401179173740900110010010000000011234567815").unwrap_err();
        assert_eq!(
            err,
            AccessKeyError::CheckDigit {
                expected: 4,
                found: 5
            }
        );
        assert!(matches!(
            AccessKey::parse("123"),
            Err(AccessKeyError::InvalidLength { actual: 3, .. })
        ));
    }

    #[test]
    fn parse_rejects_multibyte_input_of_key_length() {
        let value = format!("{}é", "1".repeat(47));
        assert_eq!(value.len(), ACCESS_KEY_LEN);
        assert_eq!(
            AccessKey::parse(&value).unwrap_err(),
            AccessKeyError::NonDigit { position: 47 }
        );
        assert!(serde_json::from_str::<AccessKey>(&format!("\"{value}\"")).is_err());
    }

    #[test]
    fn parts_round_trip() {
        let key = parts().generate().unwrap();
        assert_eq!(key.parts().unwrap(), parts());
    }
}
