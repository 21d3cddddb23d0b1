//! Operator tooling for a quota-relay deployment.
//!
//! - `price` shows the pricing resolved for a model and the quota reserved
//!   for a given token count.
//! - `topup` credits a user through the ledger so cached balances stay
//!   coherent.
//! - `logs` exports consume logs as JSON lines.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quota_relay::{PriceData, QuotaLedger, RelaySettings, SqliteStore};

#[derive(Parser)]
#[command(name = "quota-relay-admin")]
#[command(about = "Pricing, balance and audit-log tooling for quota-relay")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve pricing for a model and estimate the reservation for N tokens
    Price {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value = quota_relay::settings::DEFAULT_GROUP)]
        group: String,
        #[arg(long)]
        tokens: Option<u32>,
    },
    /// Credit (or with a negative amount, debit) a user's balance
    Topup {
        #[arg(long)]
        sqlite: PathBuf,
        #[arg(long)]
        user: i64,
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
        /// Keep this Redis cache coherent with the change
        #[arg(long)]
        redis: Option<String>,
        #[arg(long, default_value = "quota-relay")]
        prefix: String,
    },
    /// Export consume logs, newest first, as JSON lines
    Logs {
        #[arg(long)]
        sqlite: PathBuf,
        #[arg(long)]
        user: Option<i64>,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    quota_relay::observability::init_tracing(cli.json_logs)?;

    match cli.command {
        Commands::Price {
            config,
            model,
            group,
            tokens,
        } => {
            let settings = RelaySettings::load(&config).await?;
            let price = PriceData::resolve(&settings, &model, &group)?;
            let tokens = tokens.unwrap_or(settings.pre_consumed_quota);
            let estimate = price.estimate(tokens, settings.quota_per_unit);
            let out = serde_json::json!({
                "model": model,
                "group": group,
                "pricing": price,
                "description": price.describe(),
                "tokens": tokens,
                "estimate": estimate,
                "estimate_display": settings.format_quota(estimate),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Topup {
            sqlite,
            user,
            amount,
            redis,
            prefix,
        } => {
            let store = SqliteStore::new(sqlite);
            store.init().await?;
            let mut ledger = QuotaLedger::new(Arc::new(store));
            if let Some(url) = redis {
                let cache = quota_relay::RedisCache::new(&url)?;
                cache.ping().await?;
                let settings = quota_relay::settings::CacheSettings {
                    enabled: true,
                    redis_url: Some(url),
                    prefix,
                    ..Default::default()
                };
                ledger = ledger.with_cache(Arc::new(cache), &settings);
            }
            let quota = ledger.adjust_user_quota(user, amount).await?;
            tracing::info!(user_id = user, delta = amount, quota, "user quota adjusted");
            println!("{quota}");
        }
        Commands::Logs {
            sqlite,
            user,
            limit,
        } => {
            let store = SqliteStore::new(sqlite);
            store.init().await?;
            let logs = quota_relay::QuotaStore::list_consume_logs(&store, user, limit).await?;
            let mut stdout = std::io::stdout().lock();
            for log in &logs {
                serde_json::to_writer(&mut stdout, log)?;
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
            eprintln!("exported {} consume logs", logs.len());
        }
    }
    Ok(())
}
