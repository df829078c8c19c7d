//! portraitd_init - One-time database initialization tool
//!
//! Creates a fresh database with an admin account, an initial credit grant
//! and, optionally, persisted provider API keys.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use portraitd::catalog::ProviderKind;
use portraitd::init::{init_database, InitOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// portraitd database initialization tool
#[derive(Parser, Debug)]
#[command(
    name = "portraitd_init",
    version,
    about = "Initialize a new portraitd database"
)]
struct Args {
    /// Path to SQLite database file to create (must not exist)
    #[arg(short, long)]
    database: PathBuf,

    /// Credits granted to the admin account
    #[arg(long, default_value_t = 1000)]
    credits: i64,

    /// Persist provider keys found in the environment into the database
    #[arg(long)]
    store_provider_keys: bool,
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portraitd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let admin_username = required_env("PORTRAITD_ADMIN_USERNAME")?;
    let admin_password = required_env("PORTRAITD_ADMIN_PASSWORD")?;

    let mut provider_keys = Vec::new();
    if args.store_provider_keys {
        for provider in [ProviderKind::Novita, ProviderKind::OpenAiCompat] {
            match std::env::var(provider.env_var()) {
                Ok(key) if !key.trim().is_empty() => {
                    provider_keys.push((provider, key.trim().to_string()))
                }
                _ => tracing::warn!("{} not set; skipping", provider.env_var()),
            }
        }
    }

    let options = InitOptions {
        admin_credits: args.credits,
        provider_keys,
    };

    let report = init_database(&args.database, &admin_username, &admin_password, options).await?;
    println!(
        "Created {} with admin {} ({} credits, {} provider keys)",
        args.database.display(),
        report.admin_id,
        report.balance,
        report.providers.len()
    );

    Ok(())
}
