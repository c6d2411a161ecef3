use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use sri_core::access_key::{AccessKey, AccessKeyParts};
use sri_core::certificate::{CertificateBundle, CertificateStore};
use sri_core::document::sign::DocumentSigner;
use sri_core::document::xml::{DocumentXml, ToXml, XmlFormat};
use sri_core::document::{Document, DocumentBuilder, DocumentType, TenantId};
use sri_core::pipeline::{Collaborators, Pipeline};
use sri_core::submission::{ReceptionOutcome, SriService};
use sri_core::{Config, SriClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sri")]
#[command(about = "Electronic documents for Ecuador's SRI")]
struct Cli {
    /// Java properties file with `sri.*` settings. Defaults to `SRI_*` variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a 49-digit access key.
    AccessKey {
        #[arg(long)]
        ruc: String,
        #[arg(long)]
        date: NaiveDate,
        /// Type name (`invoice`) or SRI code (`01`).
        #[arg(long, default_value = "01")]
        document_type: DocumentType,
        #[arg(long, default_value = "001")]
        establishment: String,
        #[arg(long, default_value = "001")]
        point: String,
        #[arg(long)]
        sequence: u64,
    },
    /// Check an access key's length, digits and check digit.
    VerifyKey { key: String },
    /// Render a JSON document to unsigned XML.
    Render {
        #[arg(long)]
        document: PathBuf,
        /// Sequence used when the document carries none.
        #[arg(long, default_value_t = 1)]
        sequence: u64,
        #[arg(long)]
        pretty: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Sign an XML document with XAdES-BES.
    Sign {
        #[arg(long)]
        xml: PathBuf,
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Send a signed XML document to the reception service.
    Submit {
        #[arg(long)]
        xml: PathBuf,
    },
    /// Ask the authorization service about an access key.
    Authorize {
        #[arg(long)]
        access_key: AccessKey,
    },
    /// Check whether both SRI services answer.
    Status,
    /// Generate, sign and submit a JSON document, optionally waiting for authorization.
    Process {
        #[arg(long)]
        document: PathBuf,
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        wait: bool,
    },
}

/// Signing material: a PKCS#12 archive, or a DER certificate with a PKCS#8 key.
#[derive(Args)]
struct Credentials {
    #[arg(long, conflicts_with_all = ["cert", "key"])]
    p12: Option<PathBuf>,
    #[arg(long, default_value = "")]
    password: String,
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

impl Credentials {
    fn bundle(&self, tenant: TenantId) -> Result<CertificateBundle> {
        match (&self.p12, &self.cert, &self.key) {
            (Some(p12), _, _) => {
                let bytes = read(p12)?;
                Ok(CertificateBundle::from_pkcs12(tenant, &bytes, &self.password)?)
            }
            (None, Some(cert), Some(key)) => Ok(CertificateBundle::from_der(
                tenant,
                &read(cert)?,
                &read(key)?,
                Vec::new(),
            )?),
            _ => bail!("either --p12 or --cert with --key is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = load_config(cli.config.as_deref())?;
    debug!(env = config.env().as_str(), reception = %config.endpoints().reception, "configuration loaded");

    match cli.command {
        Commands::AccessKey {
            ruc,
            date,
            document_type,
            establishment,
            point,
            sequence,
        } => {
            let key = AccessKeyParts {
                issue_date: date,
                document_type,
                tax_id: ruc,
                environment: config.env(),
                establishment,
                emission_point: point,
                sequence,
                numeric_code: config.numeric_code().to_string(),
                emission_type: config.emission_type().to_string(),
            }
            .generate()?;
            println!("{}", key.as_str());
        }
        Commands::VerifyKey { key } => {
            AccessKey::parse(&key).with_context(|| format!("invalid access key {key}"))?;
            println!("valid");
        }
        Commands::Render {
            document,
            sequence,
            pretty,
            out,
        } => {
            let doc = keyed_document(&config, &document, sequence)?;
            let format = if pretty {
                XmlFormat::Pretty {
                    indent_char: ' ',
                    indent_size: 2,
                }
            } else {
                XmlFormat::Compact
            };
            let xml = DocumentXml::new(&doc, config.default_tax()).to_xml_with_format(format)?;
            emit(out.as_deref(), &xml)?;
        }
        Commands::Sign {
            xml,
            credentials,
            out,
        } => {
            let bundle = credentials.bundle(TenantId::new("cli"))?;
            let check = CertificateStore::validate(&bundle);
            if !check.ok {
                bail!("certificate rejected: {}", check.message);
            }
            let signed = DocumentSigner::new(&bundle).sign_xml(&read_string(&xml)?)?;
            info!(
                passed = signed.report().passed,
                total = signed.report().total,
                "signature reviewed"
            );
            emit(out.as_deref(), signed.xml())?;
        }
        Commands::Submit { xml } => {
            let client = SriClient::new(&config)?;
            let exchange = client.submit_for_reception(&read_string(&xml)?).await?;
            println!("{}", exchange.outcome.code());
            for message in exchange.outcome.messages() {
                println!("{message}");
            }
            if let ReceptionOutcome::Rejected { .. } = exchange.outcome {
                std::process::exit(2);
            }
        }
        Commands::Authorize { access_key } => {
            let client = SriClient::new(&config)?;
            let exchange = client.query_authorization(&access_key).await?;
            println!("{}: {}", exchange.outcome.code(), exchange.outcome.message());
        }
        Commands::Status => {
            let client = SriClient::new(&config)?;
            let status = client.service_status().await;
            println!(
                "reception: {}\nauthorization: {}",
                online(status.reception),
                online(status.authorization)
            );
            if !status.is_online() {
                std::process::exit(1);
            }
        }
        Commands::Process {
            document,
            credentials,
            wait,
        } => {
            let doc = DocumentBuilder::build(parse_builder(&document)?)?;
            let certificates = Arc::new(CertificateStore::new());
            certificates.insert(credentials.bundle(doc.tenant_id().clone())?);
            let client = SriClient::new(&config)?;
            let pipeline = Pipeline::new(
                config,
                certificates,
                Arc::new(client),
                Collaborators::in_memory(),
            )
            .without_auto_poll();

            let id = pipeline.create_draft(doc)?;
            let mut snapshot = pipeline.process(id).await?;
            if wait {
                info!(document_id = %id, "waiting for authorization");
                snapshot = pipeline.wait_for_authorization(id).await?;
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_properties_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

fn parse_builder(path: &Path) -> Result<DocumentBuilder> {
    let json = read_string(path)?;
    serde_json::from_str(&json).with_context(|| format!("invalid document {}", path.display()))
}

/// Build the document, filling in the sequence and access key if it lacks them.
fn keyed_document(config: &Config, path: &Path, sequence: u64) -> Result<Document> {
    let builder = parse_builder(path)?;
    let draft = builder.clone().build()?;
    if draft.access_key().is_some() {
        return Ok(draft);
    }
    let sequence = draft.sequence().unwrap_or(sequence);
    let key = AccessKeyParts {
        issue_date: draft.issue_date(),
        document_type: draft.document_type(),
        tax_id: draft.issuer().ruc.clone(),
        environment: config.env(),
        establishment: draft.emission_point().establishment.clone(),
        emission_point: draft.emission_point().point.clone(),
        sequence,
        numeric_code: config.numeric_code().to_string(),
        emission_type: config.emission_type().to_string(),
    }
    .generate()?;
    Ok(builder.sequence(sequence).access_key(key).build()?)
}

fn online(up: bool) -> &'static str {
    if up { "online" } else { "offline" }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn emit(out: Option<&Path>, contents: &str) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}
