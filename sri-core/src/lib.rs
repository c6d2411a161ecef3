//! Electronic document pipeline for Ecuador's SRI: access keys, XML generation,
//! XAdES-BES signing, SOAP submission and authorization polling.
//!
//! # Examples
//! ```rust
//! use sri_core::config::{Config, Environment};
//!
//! let config = Config::new(Environment::Test);
//! assert_eq!(config.env().digit(), '1');
//! ```
pub mod access_key;
pub mod certificate;
pub mod config;
pub mod document;
pub mod pipeline;
pub mod poller;
pub mod response_log;
pub mod submission;

use thiserror::Error;

pub use access_key::{AccessKey, AccessKeyError};
pub use certificate::{CertificateBundle, CertificateError, CertificateStore};
pub use config::{Config, ConfigError, Environment};
pub use document::sign::SigningError;
pub use document::xml::DocumentXmlError;
pub use document::{Document, DocumentBuilder, DocumentStatus, DocumentType, ValidationError};
pub use pipeline::{Pipeline, PipelineError, Principal, ProcessFailure, StatusSnapshot};
pub use submission::{SriClient, SubmissionError};

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Xml(#[from] DocumentXmlError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
