//! Configuration and environment selection.
use crate::document::{TaxCode, TaxRule};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

/// Path of the reception web service, relative to the environment host.
pub const RECEPTION_PATH: &str = "/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
/// Path of the authorization web service, relative to the environment host.
pub const AUTHORIZATION_PATH: &str =
    "/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";

/// SRI environment selection.
///
/// Determines which host the submission client talks to and the `ambiente`
/// digit embedded in access keys and XML.
/// - Test: the "pruebas" environment (`celcer.sri.gob.ec`).
/// - Production: the live environment (`cel.sri.gob.ec`).
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use sri_core::config::Environment;
///
/// let env = Environment::from_str("pruebas")?;
/// assert_eq!(env, Environment::Test);
/// assert_eq!(env.digit(), '1');
/// # Ok::<(), sri_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Production,
}

/// Error returned when parsing an [`Environment`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment: {input}")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "test" | "pruebas" | "1" => Ok(Environment::Test),
            "production" | "produccion" | "producción" | "2" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }

    /// Digit used for `ambiente` in access keys and `infoTributaria`.
    pub fn digit(&self) -> char {
        match self {
            Environment::Test => '1',
            Environment::Production => '2',
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Test => "https://celcer.sri.gob.ec",
            Environment::Production => "https://cel.sri.gob.ec",
        }
    }
}

/// Fully resolved web service URLs for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub reception: String,
    pub authorization: String,
}

impl Endpoints {
    pub fn for_base(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            reception: format!("{base}{RECEPTION_PATH}"),
            authorization: format!("{base}{AUTHORIZATION_PATH}"),
        }
    }
}

/// How the submission client reaches the SRI services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStrategy {
    /// Use the WSDL-resolved binding and fall back to the raw envelope when
    /// the binding is unavailable or fails transiently.
    #[default]
    TypedFirst,
    TypedOnly,
    RawOnly,
}

impl FromStr for SubmissionStrategy {
    type Err = ConfigError;
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "typed_first" | "typed" => Ok(SubmissionStrategy::TypedFirst),
            "typed_only" => Ok(SubmissionStrategy::TypedOnly),
            "raw_only" | "raw" => Ok(SubmissionStrategy::RawOnly),
            _ => Err(ConfigError::InvalidValue {
                key: "submission.strategy".into(),
                value: value.into(),
                message: "expected typed_first, typed_only or raw_only".into(),
            }),
        }
    }
}

/// Bounded retry for transient transport failures inside one SOAP call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_secs: Vec<u64>,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). The last step repeats.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_secs: vec![0],
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![3, 7, 15, 30, 60, 120, 300],
        }
    }
}

/// Authorization polling schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: u32,
    /// Wait after attempts `1..=short_tier_until`.
    pub short_delay_secs: u64,
    pub short_tier_until: u32,
    /// Wait after attempts up to `medium_tier_until`.
    pub medium_delay_secs: u64,
    pub medium_tier_until: u32,
    /// Wait after every later attempt.
    pub long_delay_secs: u64,
    /// Hard ceiling measured from the moment the document was sent.
    pub ceiling_secs: u64,
}

impl PollPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let secs = if attempt <= self.short_tier_until {
            self.short_delay_secs
        } else if attempt <= self.medium_tier_until {
            self.medium_delay_secs
        } else {
            self.long_delay_secs
        };
        Duration::from_secs(secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            short_delay_secs: 120,
            short_tier_until: 3,
            medium_delay_secs: 300,
            medium_tier_until: 7,
            long_delay_secs: 600,
            ceiling_secs: 24 * 60 * 60,
        }
    }
}

/// Error raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read properties: {0}")]
    Properties(#[from] java_properties::PropertiesError),
    #[error("invalid value {value:?} for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
}

/// Configuration for document generation and the SRI clients.
///
/// # Examples
/// ```rust
/// use sri_core::config::{Config, Environment};
///
/// let config = Config::new(Environment::Test);
/// assert_eq!(config.numeric_code(), "12345678");
/// assert!(config.endpoints().reception.starts_with("https://celcer.sri.gob.ec"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    env: Environment,
    base_url: Option<String>,
    default_tax: TaxRule,
    numeric_code: String,
    emission_type: String,
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
    retry: RetryPolicy,
    poll: PollPolicy,
    strategy: SubmissionStrategy,
}

impl Config {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(self.env.base_url())
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::for_base(self.base_url())
    }

    pub fn default_tax(&self) -> &TaxRule {
        &self.default_tax
    }

    pub fn numeric_code(&self) -> &str {
        &self.numeric_code
    }

    pub fn emission_type(&self) -> &str {
        &self.emission_type
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn poll(&self) -> &PollPolicy {
        &self.poll
    }

    pub fn strategy(&self) -> SubmissionStrategy {
        self.strategy
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_default_tax(mut self, rule: TaxRule) -> Self {
        self.default_tax = rule;
        self
    }

    pub fn with_numeric_code(mut self, code: impl Into<String>) -> Self {
        self.numeric_code = code.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout_secs = connect.as_secs();
        self.request_timeout_secs = request.as_secs();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_strategy(mut self, strategy: SubmissionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Load settings from a Java `.properties` file (`sri.environment`,
    /// `sri.base.url`, `sri.tax.default.code`, ...). Missing keys keep their defaults.
    pub fn from_properties_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let props = java_properties::read(BufReader::new(file))?;
        Self::from_lookup(|key| props.get(key).cloned())
    }

    /// Load settings from `SRI_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| {
            let var = format!("SRI_{}", key.trim_start_matches("sri.").replace('.', "_"))
                .to_ascii_uppercase();
            std::env::var(var).ok()
        })
    }

    /// Build a config from flat `sri.*` keys.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(env) = lookup("sri.environment") {
            config.env = env.parse()?;
        }
        if let Some(url) = lookup("sri.base.url").filter(|v| !v.trim().is_empty()) {
            config.base_url = Some(url.trim().to_string());
        }
        if let Some(code) = lookup("sri.tax.default.code") {
            config.default_tax.code = TaxCode::from_code(code.trim())
                .ok_or_else(|| invalid("sri.tax.default.code", &code, "expected 2, 3 or 5"))?;
        }
        if let Some(rate_code) = lookup("sri.tax.default.rate.code") {
            config.default_tax.rate_code = rate_code.trim().to_string();
        }
        if let Some(rate) = lookup("sri.tax.default.rate") {
            config.default_tax.rate = Decimal::from_str(rate.trim())
                .map_err(|e| invalid("sri.tax.default.rate", &rate, e.to_string()))?;
        }
        if let Some(code) = lookup("sri.numeric.code") {
            if code.len() != 8 || !code.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("sri.numeric.code", &code, "expected 8 digits"));
            }
            config.numeric_code = code;
        }
        if let Some(secs) = lookup("sri.connect.timeout") {
            config.connect_timeout_secs = parse_num("sri.connect.timeout", &secs)?;
        }
        if let Some(secs) = lookup("sri.request.timeout") {
            config.request_timeout_secs = parse_num("sri.request.timeout", &secs)?;
        }
        if let Some(n) = lookup("sri.retry.max.attempts") {
            config.retry.max_attempts = parse_num("sri.retry.max.attempts", &n)?;
        }
        if let Some(list) = lookup("sri.retry.backoff") {
            config.retry.backoff_secs = list
                .split(',')
                .map(|part| parse_num("sri.retry.backoff", part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(n) = lookup("sri.poll.max.attempts") {
            config.poll.max_attempts = parse_num("sri.poll.max.attempts", &n)?;
        }
        if let Some(secs) = lookup("sri.poll.ceiling") {
            config.poll.ceiling_secs = parse_num("sri.poll.ceiling", &secs)?;
        }
        if let Some(strategy) = lookup("sri.submission.strategy") {
            config.strategy = strategy.parse()?;
        }
        Ok(config)
    }
}

fn invalid(key: &str, value: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        message: message.into(),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a non-negative integer"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: Environment::Test,
            base_url: None,
            default_tax: TaxRule::default(),
            numeric_code: "12345678".to_string(),
            emission_type: "1".to_string(),
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            strategy: SubmissionStrategy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn environment_parses_aliases() {
        assert_eq!("TEST".parse::<Environment>().unwrap(), Environment::Test);
        assert_eq!("2".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(
            "produccion".parse::<Environment>().unwrap(),
            Environment::Production
        );
        let err = "staging".parse::<Environment>().unwrap_err();
        assert_eq!(
            err,
            EnvironmentParseError::Invalid {
                input: "staging".into()
            }
        );
    }

    #[test]
    fn endpoints_follow_environment_and_override() {
        let prod = Config::new(Environment::Production).endpoints();
        assert_eq!(
            prod.authorization,
            "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline"
        );

        let local = Config::default().with_base_url("http://127.0.0.1:9000/").endpoints();
        assert_eq!(
            local.reception,
            "http://127.0.0.1:9000/comprobantes-electronicos-ws/RecepcionComprobantesOffline"
        );
    }

    #[test]
    fn poll_tiers_match_schedule() {
        let poll = PollPolicy::default();
        assert_eq!(poll.delay_after(1), Duration::from_secs(120));
        assert_eq!(poll.delay_after(3), Duration::from_secs(120));
        assert_eq!(poll.delay_after(4), Duration::from_secs(300));
        assert_eq!(poll.delay_after(7), Duration::from_secs(300));
        assert_eq!(poll.delay_after(8), Duration::from_secs(600));
        assert_eq!(poll.ceiling(), Duration::from_secs(86_400));
    }

    #[test]
    fn retry_delay_repeats_last_step() {
        let retry = RetryPolicy {
            max_attempts: 5,
            backoff_secs: vec![3, 7],
        };
        assert_eq!(retry.delay_for(1), Duration::from_secs(3));
        assert_eq!(retry.delay_for(2), Duration::from_secs(7));
        assert_eq!(retry.delay_for(9), Duration::from_secs(7));
    }

    #[test]
    fn properties_file_overrides_defaults() {
        let mut path = std::env::temp_dir();
        path.push(format!("sri-config-{}.properties", uuid::Uuid::new_v4()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "sri.environment=production").unwrap();
        writeln!(file, "sri.tax.default.rate.code=2").unwrap();
        writeln!(file, "sri.tax.default.rate=12").unwrap();
        writeln!(file, "sri.retry.backoff=1, 2, 4").unwrap();
        writeln!(file, "sri.submission.strategy=raw_only").unwrap();
        drop(file);

        let config = Config::from_properties_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.env(), Environment::Production);
        assert_eq!(config.default_tax().rate_code, "2");
        assert_eq!(config.default_tax().rate, Decimal::from(12));
        assert_eq!(config.retry().backoff_secs, vec![1, 2, 4]);
        assert_eq!(config.strategy(), SubmissionStrategy::RawOnly);
        assert_eq!(config.numeric_code(), "12345678");
    }

    #[test]
    fn rejects_bad_numeric_code() {
        let mut values = HashMap::new();
        values.insert("sri.numeric.code".to_string(), "12ab".to_string());
        let err = Config::from_map(&values).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "sri.numeric.code"));
    }
}
