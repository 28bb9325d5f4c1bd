//! # Queue Bridge Configuration Validator
//!
//! Command-line tool for checking bridge configuration before starting a
//! service. Loads the same sources the library does, validates them, and
//! prints a summary per section.

use clap::{Parser, Subcommand};
use queue_bridge::config::{BridgeConfig, ConfigLoader, ENV_PREFIX};
use queue_bridge::logging::{init_structured_logging_with_level, redact_address};
use queue_bridge::messaging::{Credentials, ProviderKind};
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate queue-bridge configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: config/queue-bridge.{toml,yaml,json})
    #[arg(short, long)]
    file: Option<String>,

    /// Environment variable prefix
    #[arg(long, default_value = ENV_PREFIX)]
    env_prefix: String,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate all configuration sections
    All,

    /// Validate one section (connection, exchange, long_poll, backoff)
    Component {
        name: String,
    },

    /// Print the merged configuration as JSON, secrets redacted
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    init_structured_logging_with_level(Some(level));

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Show) => show_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut loader = ConfigLoader::new().with_env_prefix(&cli.env_prefix);
    if let Some(file) = &cli.file {
        loader = loader.with_file(file);
    }
    match loader.load() {
        Ok(config) => {
            println!("✅ Configuration loaded and validated");
            Ok(config)
        }
        Err(e) => {
            println!("❌ Failed to load configuration: {e}");
            Err(e.into())
        }
    }
}

fn validate_all_config(cli: &Cli) -> anyhow::Result<()> {
    println!("🔧 Validating Queue Bridge Configuration");
    if let Some(file) = &cli.file {
        println!("Config File: {file}");
    }
    println!();

    let config = load(cli)?;
    validate_connection_config(&config);
    validate_exchange_config(&config);
    validate_long_poll_config(&config);
    validate_backoff_config(&config);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, component_name: &str) -> anyhow::Result<()> {
    println!("🔧 Validating Component: {component_name}");
    let config = load(cli)?;

    match component_name.to_lowercase().as_str() {
        "connection" => validate_connection_config(&config),
        "exchange" => validate_exchange_config(&config),
        "long_poll" | "long-poll" => validate_long_poll_config(&config),
        "backoff" => validate_backoff_config(&config),
        _ => anyhow::bail!("Unknown component: {component_name}"),
    }

    println!("✅ Component '{component_name}' validation passed!");
    Ok(())
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load(cli)?;
    config.credentials = config.credentials.map(|credentials| match credentials {
        Credentials::Plain { username, .. } => Credentials::Plain {
            username,
            password: "<redacted>".to_string(),
        },
        Credentials::AccessKey { access_key, .. } => Credentials::AccessKey {
            access_key,
            secret_key: "<redacted>".to_string(),
            security_token: None,
        },
    });
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn validate_connection_config(config: &BridgeConfig) {
    println!("🔌 Connection");
    println!("   ✅ Provider: {}", config.provider);
    if config.addresses.is_empty() {
        println!("   ℹ️  No addresses configured (provider default is used)");
    }
    for address in &config.addresses {
        println!("   ✅ Address: {}", redact_address(address));
    }
    println!("   ✅ Secure: {}", config.secure);
    match &config.credentials {
        Some(Credentials::Plain { username, .. }) => println!("   ✅ Plain credentials for {username}"),
        Some(Credentials::AccessKey { .. }) => println!("   ✅ Access key credentials"),
        None => println!("   ℹ️  No credentials configured"),
    }
}

fn validate_exchange_config(config: &BridgeConfig) {
    println!("🔀 Exchange");
    if config.provider != ProviderKind::Amqp {
        println!("   ℹ️  Not used by the {} provider", config.provider);
        return;
    }
    println!(
        "   ✅ {} (durable: {})",
        config.exchange.name, config.exchange.durable
    );
    println!(
        "   ✅ Prefetch: {} (global: {})",
        config.prefetch_count, config.prefetch_global
    );
}

fn validate_long_poll_config(config: &BridgeConfig) {
    println!("⏳ Long Poll");
    let poll = &config.long_poll;
    if config.provider != ProviderKind::LongPoll {
        println!("   ℹ️  Not used by the {} provider", config.provider);
        return;
    }
    match &poll.default_group {
        Some(group) => println!("   ✅ Default group: {group}"),
        None => println!("   ⚠️  No default group: every subscription must name a queue"),
    }
    println!(
        "   ✅ Batch {} / wait {}ms / local timeout {}ms / cooldown {}ms",
        poll.batch_size, poll.poll_wait_ms, poll.local_timeout_ms, poll.error_cooldown_ms
    );
}

fn validate_backoff_config(config: &BridgeConfig) {
    println!("🔁 Backoff");
    let backoff = &config.backoff;
    println!(
        "   ✅ {}ms x{} up to {}ms",
        backoff.initial_delay_ms, backoff.multiplier, backoff.max_delay_ms
    );
}
