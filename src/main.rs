//! `sts-secrets` - operator CLI for per-resource-server secret issuance.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sts_resource_secrets::{
    algorithm::select_header,
    cli::{Cli, Command, OutputFormat},
    config::Config,
    issuance::{CandidateEntry, IssuedSecret, SecretIssuer, secret_claims},
    secret_store::Principal,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let issuer = match SecretIssuer::from_config(&config) {
        Ok(issuer) => issuer,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Issue {
            principal,
            audiences,
            resources,
            format,
        } => run_issue(&issuer, &principal, &audiences, &resources, format).await,
        Command::Servers => run_servers(&issuer),
        Command::Key { audience } => run_key(&issuer, &audience).await,
        Command::Rotate {
            principal,
            audience,
        } => run_rotate(&issuer, &principal, &audience).await,
    }
}

/// Issue secrets and print them
async fn run_issue(
    issuer: &SecretIssuer,
    principal: &str,
    audiences: &[String],
    resources: &[String],
    format: OutputFormat,
) -> ExitCode {
    let principal = Principal::new(principal);
    let cancel = CancellationToken::new();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling issuance");
            on_interrupt.cancel();
        }
    });

    let entries = match issuer
        .issue_with_cancellation(Some(audiences), Some(resources), &principal, &cancel)
        .await
    {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("❌ Issuance failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match format {
        OutputFormat::Json => {
            let issued: Vec<IssuedSecret> = entries.iter().map(CandidateEntry::to_issued).collect();
            let document = serde_json::json!({
                "secrets": issued,
                "claims": secret_claims(&entries),
            });
            match serde_json::to_string_pretty(&document) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("❌ Failed to serialize to JSON: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No resource servers matched.");
            }
            for entry in &entries {
                match entry.envelope() {
                    Some(envelope) => {
                        println!("✅ {} ({})", entry.audience(), envelope.algorithms());
                        println!("   {envelope}");
                    }
                    None => {
                        let reason = entry
                            .outcome()
                            .map_or_else(|| "not attempted".to_string(), ToString::to_string);
                        println!("⚠️  {} - {reason}", entry.audience());
                    }
                }
            }
        }
    }

    ExitCode::SUCCESS
}

/// List the registry
fn run_servers(issuer: &SecretIssuer) -> ExitCode {
    let registry = issuer.registry();
    if registry.is_empty() {
        println!("No resource servers configured.");
        return ExitCode::SUCCESS;
    }

    println!("{} resource server(s):\n", registry.len());
    for server in registry.iter() {
        println!("📦 {}", server.display_name());
        println!("   Audience: {}", server.audience);
        if !server.endpoints.is_empty() {
            println!("   Endpoints: {}", server.endpoints.join(", "));
        }
        println!("   Key set: {}", server.jwks_url);
        println!();
    }
    ExitCode::SUCCESS
}

/// Resolve and describe one server's encryption key
async fn run_key(issuer: &SecretIssuer, audience: &str) -> ExitCode {
    let Some(server) = issuer.registry().get(audience) else {
        eprintln!("❌ Unknown audience: {audience}");
        return ExitCode::FAILURE;
    };

    match issuer.key_resolver().resolve_encryption_key(server).await {
        Ok(Some(key)) => {
            println!("🔑 {}", server.display_name());
            println!("   Key type: {}", key.key_type());
            println!("   Key id: {}", key.kid.as_deref().unwrap_or("-"));
            if let Some(crv) = &key.crv {
                println!("   Curve: {crv}");
            }
            match select_header(&key) {
                Some(algorithms) => {
                    println!("   Algorithms: {algorithms}");
                    ExitCode::SUCCESS
                }
                None => {
                    println!("   Algorithms: unsupported key type");
                    ExitCode::FAILURE
                }
            }
        }
        Ok(None) => {
            eprintln!("❌ {} publishes no encryption key", server.jwks_url);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Failed to resolve key: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Drop a stored secret
async fn run_rotate(issuer: &SecretIssuer, principal: &str, audience: &str) -> ExitCode {
    if !issuer.secrets().has_store() {
        eprintln!("❌ No credential store configured");
        return ExitCode::FAILURE;
    }

    match issuer
        .secrets()
        .rotate_secret(&Principal::new(principal), audience)
        .await
    {
        Ok(true) => {
            println!("✅ Secret for {audience} dropped; the next issuance creates a new one");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("No secret stored for {audience}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Rotation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
