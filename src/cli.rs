//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Per-resource-server secret issuance
#[derive(Parser, Debug)]
#[command(name = "sts-secrets")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "STS_SECRETS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "STS_SECRETS_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "STS_SECRETS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Output format for command results
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// JSON document
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Issue sealed secrets for a principal
    Issue {
        /// Principal to issue for
        #[arg(short, long, required = true)]
        principal: String,

        /// Audience hint (repeatable)
        #[arg(short, long = "audience")]
        audiences: Vec<String>,

        /// Resource endpoint hint (repeatable)
        #[arg(short, long = "resource")]
        resources: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List configured resource servers
    Servers,

    /// Resolve a resource server's current encryption key
    Key {
        /// Audience of the resource server
        #[arg(short, long, required = true)]
        audience: String,
    },

    /// Drop a principal's secret for one resource server
    Rotate {
        /// Principal owning the secret
        #[arg(short, long, required = true)]
        principal: String,

        /// Audience of the resource server
        #[arg(short, long, required = true)]
        audience: String,
    },
}
