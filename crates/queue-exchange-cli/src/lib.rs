//! # Queue Exchange CLI
//!
//! Command-line interface over the queue-exchange library.
//!
//! This module provides CLI commands for:
//! - Issuing shared access tokens and connection strings
//! - Inspecting and verifying tokens and connection strings
//! - Running a scripted exchange against the in-memory broker
//! - Validating the resolved configuration

use clap::{Args, CommandFactory, Parser, Subcommand};
use queue_exchange::config::SHARED_KEY_ENV;
use queue_exchange::{
    BlockingExchange, Clock, ConfigurationError, ConnectionFactory, ConnectionString, Credential,
    CredentialError, EntityAddress, ExchangeConfig, ExchangeError, InMemoryBroker, InMemoryConfig,
    LockModeReceiver, ManualClock, OutboundMessage, SharedKey, SignedToken, SystemClock,
    Timestamp, TokenIssuer, TransactionalSender,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Key the simulated broker accepts
const SIMULATION_KEY: &str = "c2ltdWxhdGlvbi1rZXk=";

/// Namespace used by `simulate` when none is configured
const SIMULATION_NAMESPACE: &str = "simulation";

/// How long a simulated receive waits for the first message
const SIMULATION_RECEIVE_WAIT: Duration = Duration::from_millis(250);

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue Exchange CLI - shared access tokens and transactional queue exchange
#[derive(Parser, Debug)]
#[command(name = "queue-exchange")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Issue shared access tokens and exercise transactional queue exchanges")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_EXCHANGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (overridden by RUST_LOG)
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue a shared access token for an entity
    Token {
        #[command(flatten)]
        scope: ScopeArgs,

        #[command(flatten)]
        signing: SigningArgs,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Issue a token and print it as a connection string
    ConnectionString {
        #[command(flatten)]
        scope: ScopeArgs,

        #[command(flatten)]
        signing: SigningArgs,
    },

    /// Parse a token or connection string and optionally verify its signature
    Inspect {
        /// Token (`SharedAccessSignature ...`) or connection string (`Endpoint=...`)
        value: String,

        /// Shared key to verify the signature with
        #[arg(long, env = "QUEUE_EXCHANGE_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Evaluate expiry at this epoch second instead of now
        #[arg(long)]
        at: Option<i64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a send then receive exchange against the in-memory broker
    Simulate {
        /// Queue to send to and receive from
        #[arg(short, long, default_value = "orders")]
        queue: String,

        /// Message bodies, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "a,b,c")]
        messages: Vec<String>,

        /// Inject an enqueue failure at this 1-based message position
        #[arg(long)]
        fail_at: Option<usize>,

        /// Forward received messages to this queue instead of completing them
        #[arg(long)]
        forward_to: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate the resolved configuration
    Config {
        /// Print the resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Format for the printed configuration
        #[arg(short = 'f', long, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Where a token is scoped
#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    /// Entity path (`orders`, `events/subscriptions/audit`)
    #[arg(short, long)]
    pub entity: String,

    /// Broker namespace (defaults to the configured one)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Broker domain (defaults to the configured one)
    #[arg(long)]
    pub broker_domain: Option<String>,
}

/// How a token is signed
#[derive(Args, Debug, Clone)]
pub struct SigningArgs {
    /// Shared access policy name (defaults to the configured one)
    #[arg(long)]
    pub key_name: Option<String>,

    /// Shared key
    #[arg(long, env = "QUEUE_EXCHANGE_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Token lifetime in seconds (defaults to the configured one)
    #[arg(long)]
    pub validity_secs: Option<u64>,

    /// Issue as if the current time were this epoch second
    #[arg(long)]
    pub issued_at: Option<i64>,
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI error types
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Exchange(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Credential(_) => 6,
        }
    }
}

fn render_failed(e: impl std::fmt::Display) -> CliError {
    CliError::CommandFailed {
        message: format!("failed to render output: {}", e),
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Issued token as printed by `token`
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub resource_uri: String,
    pub key_name: String,
    pub expiry: i64,
    pub expires_at: Option<String>,
}

/// Parsed token as printed by `inspect`
#[derive(Debug, Serialize)]
pub struct TokenReport {
    pub endpoint: Option<String>,
    pub resource_uri: String,
    pub key_name: String,
    pub expiry: i64,
    pub expires_at: Option<String>,
    pub expired: bool,
    pub signature: SignatureCheck,
}

/// Result of checking a token signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    NotChecked,
    Valid,
    Invalid,
}

impl std::fmt::Display for SignatureCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotChecked => write!(f, "not checked"),
            Self::Valid => write!(f, "valid"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Outcome of `simulate`
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub queue: String,
    pub sent: usize,
    pub send_error: Option<String>,
    pub queued: usize,
    pub received: Vec<String>,
    pub forwarded_to: Option<String>,
    pub forwarded: usize,
    pub remaining: usize,
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Install the tracing subscriber on stderr
///
/// `RUST_LOG` takes precedence over `log_level` when set.
pub fn initialize_logging(log_level: &str, json: bool) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| CliError::CommandFailed {
        message: format!("failed to install log subscriber: {}", e),
    })
}

/// Execute a parsed command, writing its output to `out`
pub fn run(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "queue-exchange", out);
        return Ok(());
    }

    let config = ExchangeConfig::load(cli.config.as_deref())?;
    debug!(config_file = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Token {
            scope,
            signing,
            format,
        } => execute_token_command(config, &scope, &signing, format, out),
        Commands::ConnectionString { scope, signing } => {
            execute_connection_string_command(config, &scope, &signing, out)
        }
        Commands::Inspect {
            value,
            key,
            at,
            format,
        } => execute_inspect_command(&value, key, at, format, out),
        Commands::Simulate {
            queue,
            messages,
            fail_at,
            forward_to,
            format,
        } => execute_simulate_command(
            config, &queue, &messages, fail_at, forward_to, format, out,
        ),
        Commands::Config { show, format } => execute_config_command(&config, show, format, out),
        Commands::Completions { .. } => Ok(()),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Resolve the shared key from the flag or `QUEUE_EXCHANGE_KEY`
fn shared_key(key: Option<String>) -> Result<SharedKey, CliError> {
    match key {
        Some(key) if !key.is_empty() => Ok(SharedKey::from_string(key)),
        _ => Err(CliError::InvalidArgument {
            arg: "--key".to_string(),
            message: format!("supply --key or set {}", SHARED_KEY_ENV),
        }),
    }
}

fn clock_at(arg: &str, epoch_seconds: Option<i64>) -> Result<Arc<dyn Clock>, CliError> {
    match epoch_seconds {
        None => Ok(Arc::new(SystemClock)),
        Some(seconds) => {
            let start = Timestamp::from_epoch_seconds(seconds).ok_or_else(|| {
                CliError::InvalidArgument {
                    arg: arg.to_string(),
                    message: format!("{} is not a representable epoch second", seconds),
                }
            })?;
            Ok(Arc::new(ManualClock::new(start)))
        }
    }
}

/// Apply command-line overrides, validate and issue a token for the scope
fn issue_token(
    mut config: ExchangeConfig,
    scope: &ScopeArgs,
    signing: &SigningArgs,
) -> Result<(Credential, ExchangeConfig, SignedToken), CliError> {
    if let Some(namespace) = &scope.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(domain) = &scope.broker_domain {
        config.broker_domain = domain.clone();
    }
    if let Some(key_name) = &signing.key_name {
        config.key_name = key_name.clone();
    }
    if let Some(validity) = signing.validity_secs {
        config.token_validity_secs = validity;
    }
    config.validate()?;

    let credential = Credential::new(
        config.key_name.clone(),
        shared_key(signing.key.clone())?,
        config.namespace.clone(),
        scope.entity.clone(),
    )?;
    let issuer = TokenIssuer::new(clock_at("--issued-at", signing.issued_at)?)
        .with_validity(config.token_validity());
    let token = issuer.issue_for(&credential, &config.broker_domain)?;

    info!(
        resource = %token.resource_uri(),
        key_name = %token.key_name(),
        expiry = token.expiry(),
        "Token issued"
    );
    Ok((credential, config, token))
}

fn execute_token_command(
    config: ExchangeConfig,
    scope: &ScopeArgs,
    signing: &SigningArgs,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let (_, _, token) = issue_token(config, scope, signing)?;

    match format {
        OutputFormat::Text => writeln!(out, "{}", token)?,
        OutputFormat::Json => {
            let issued = IssuedToken {
                token: token.to_wire(),
                resource_uri: token.resource_uri().to_string(),
                key_name: token.key_name().to_string(),
                expiry: token.expiry(),
                expires_at: rfc3339(&token),
            };
            let rendered = serde_json::to_string_pretty(&issued).map_err(render_failed)?;
            writeln!(out, "{}", rendered)?;
        }
    }
    Ok(())
}

fn execute_connection_string_command(
    config: ExchangeConfig,
    scope: &ScopeArgs,
    signing: &SigningArgs,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let (credential, config, token) = issue_token(config, scope, signing)?;
    let connection_string =
        ConnectionString::new(credential.endpoint(&config.broker_domain), token);

    writeln!(out, "{}", connection_string)?;
    Ok(())
}

fn rfc3339(token: &SignedToken) -> Option<String> {
    token
        .expires_at()
        .map(|t| t.as_datetime().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

/// Build the report for a token or connection string
pub fn inspect(
    value: &str,
    key: Option<&SharedKey>,
    now: Timestamp,
) -> Result<TokenReport, CliError> {
    let (endpoint, token) = if value.trim_start().starts_with("Endpoint=") {
        let parsed = ConnectionString::parse(value)?;
        (Some(parsed.endpoint().to_string()), parsed.token().clone())
    } else {
        (None, SignedToken::parse(value)?)
    };

    let signature = match key {
        None => SignatureCheck::NotChecked,
        Some(key) => match token.verify(key, now) {
            Ok(()) | Err(CredentialError::Expired { .. }) => SignatureCheck::Valid,
            Err(CredentialError::SignatureMismatch) => SignatureCheck::Invalid,
            Err(e) => return Err(e.into()),
        },
    };

    Ok(TokenReport {
        endpoint,
        resource_uri: token.resource_uri().to_string(),
        key_name: token.key_name().to_string(),
        expiry: token.expiry(),
        expires_at: rfc3339(&token),
        expired: token.is_expired_at(now),
        signature,
    })
}

fn execute_inspect_command(
    value: &str,
    key: Option<String>,
    at: Option<i64>,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let key = key.filter(|k| !k.is_empty()).map(SharedKey::from_string);
    let now = clock_at("--at", at)?.now();
    let report = inspect(value, key.as_ref(), now)?;

    match format {
        OutputFormat::Text => {
            if let Some(endpoint) = &report.endpoint {
                writeln!(out, "endpoint:   {}", endpoint)?;
            }
            writeln!(out, "resource:   {}", report.resource_uri)?;
            writeln!(out, "key name:   {}", report.key_name)?;
            writeln!(
                out,
                "expires:    {} ({})",
                report.expires_at.as_deref().unwrap_or("out of range"),
                report.expiry
            )?;
            writeln!(out, "expired:    {}", if report.expired { "yes" } else { "no" })?;
            writeln!(out, "signature:  {}", report.signature)?;
        }
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&report).map_err(render_failed)?;
            writeln!(out, "{}", rendered)?;
        }
    }

    // A supplied key turns the inspection into a verification
    if report.signature == SignatureCheck::Invalid {
        return Err(CliError::CommandFailed {
            message: "signature does not match the shared key".to_string(),
        });
    }
    if report.signature == SignatureCheck::Valid && report.expired {
        return Err(CliError::CommandFailed {
            message: format!("token expired at epoch second {}", report.expiry),
        });
    }
    Ok(())
}

/// Run a send and a receive against a fresh in-memory broker
pub fn simulate(
    mut config: ExchangeConfig,
    queue: &str,
    messages: &[String],
    fail_at: Option<usize>,
    forward_to: Option<&str>,
) -> Result<SimulationReport, CliError> {
    if config.namespace.trim().is_empty() {
        config.namespace = SIMULATION_NAMESPACE.to_string();
    }
    config.validate()?;

    let key = SharedKey::from_string(SIMULATION_KEY.to_string());
    let broker = InMemoryBroker::new(config.endpoint(), InMemoryConfig::default());
    broker.authorize_key(config.key_name.clone(), key.clone());
    let factory = Arc::new(ConnectionFactory::from_config(
        Arc::new(broker.clone()),
        &config,
    ));

    let credential = |entity: &str| {
        Credential::new(
            config.key_name.clone(),
            key.clone(),
            config.namespace.clone(),
            entity,
        )
    };
    let source = EntityAddress::queue(queue).map_err(ExchangeError::from)?;
    let sender = TransactionalSender::from_config(
        factory.clone(),
        credential(queue)?,
        source.clone(),
        &config,
    )?;
    let receiver =
        LockModeReceiver::from_config(factory.clone(), credential(queue)?, source, &config)?;

    if let Some(position) = fail_at {
        broker.fail_enqueue_at(position);
    }

    let exchange = BlockingExchange::from_config(1, &config)?;
    let batch: Vec<OutboundMessage> = messages
        .iter()
        .map(|m| OutboundMessage::from_text(m))
        .collect();

    let (sent, send_error) = match exchange.send(&sender, &batch) {
        Ok(result) => (result.message_ids.len(), None),
        Err(e) => {
            warn!(queue = %queue, error = %e, "Simulated send rolled back");
            (0, Some(e.to_string()))
        }
    };
    let queued = broker.message_count(queue);

    let outcome = match forward_to {
        Some(destination) => {
            let target = TransactionalSender::from_config(
                factory.clone(),
                credential(destination)?,
                EntityAddress::queue(destination).map_err(ExchangeError::from)?,
                &config,
            )?;
            exchange.receive_and_forward(
                &receiver,
                &target,
                config.receive.max_count,
                SIMULATION_RECEIVE_WAIT,
            )?
        }
        None => exchange.receive_and_complete(
            &receiver,
            config.receive.max_count,
            SIMULATION_RECEIVE_WAIT,
        )?,
    };

    let report = SimulationReport {
        queue: queue.to_string(),
        sent,
        send_error,
        queued,
        received: outcome.texts(),
        forwarded_to: forward_to.map(str::to_string),
        forwarded: forward_to.map_or(0, |d| broker.message_count(d)),
        remaining: broker.message_count(queue),
    };

    info!(
        queue = %queue,
        sent = report.sent,
        received = report.received.len(),
        remaining = report.remaining,
        "Simulation finished"
    );
    Ok(report)
}

fn execute_simulate_command(
    config: ExchangeConfig,
    queue: &str,
    messages: &[String],
    fail_at: Option<usize>,
    forward_to: Option<String>,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let report = simulate(config, queue, messages, fail_at, forward_to.as_deref())?;

    match format {
        OutputFormat::Text => {
            writeln!(out, "queue:      {}", report.queue)?;
            match &report.send_error {
                None => writeln!(out, "sent:       {} (committed)", report.sent)?,
                Some(e) => writeln!(out, "sent:       0 (rolled back: {})", e)?,
            }
            writeln!(out, "queued:     {}", report.queued)?;
            writeln!(out, "received:   {}", report.received.join(", "))?;
            if let Some(destination) = &report.forwarded_to {
                writeln!(out, "forwarded:  {} to {}", report.forwarded, destination)?;
            }
            writeln!(out, "remaining:  {}", report.remaining)?;
        }
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&report).map_err(render_failed)?;
            writeln!(out, "{}", rendered)?;
        }
    }
    Ok(())
}

fn execute_config_command(
    config: &ExchangeConfig,
    show: bool,
    format: ConfigFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if show {
        let rendered = match format {
            ConfigFormat::Toml => toml::to_string_pretty(config).map_err(render_failed)?,
            ConfigFormat::Json => serde_json::to_string_pretty(config).map_err(render_failed)?,
        };
        writeln!(out, "{}", rendered.trim_end())?;
    }

    config.validate()?;
    writeln!(out, "configuration is valid")?;
    Ok(())
}
