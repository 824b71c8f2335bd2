use std::{collections::HashSet, fs, path::Path, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};

use models::payments::PaymentProvider;
use repositories::{
    identity::HostedAuth, memory::MemoryLedgerStore, postgres::PgLedgerStore,
    providers::build_gateways, LedgerStore,
};
use services::{
    http::{AppState, WebhookConfig},
    users::UserRequestHandler,
    Policies,
};

mod models;
mod repositories;
mod services;
mod settings;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Overrides `server.listen`.
    #[arg(short, long)]
    listen: Option<String>,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
    /// Keep all state in process memory instead of Postgres.
    #[arg(long)]
    memory_store: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Gives an existing account the admin role.
    GrantAdmin {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    let settings = settings::Settings::new(&args.config).expect("Failed to load settings.");

    init_logging(&args.log4rs).expect("Failed to initialize logging.");
    log::info!("Starting education ledger.");

    let store: Arc<dyn LedgerStore> = if args.memory_store {
        log::warn!("Using the in-memory store, nothing will be persisted.");
        Arc::new(MemoryLedgerStore::new())
    } else {
        Arc::new(
            PgLedgerStore::connect(&settings.postgres.url, settings.postgres.max_connections)
                .await?,
        )
    };

    if let Some(Command::GrantAdmin { email }) = args.command {
        let user = UserRequestHandler::new(store)
            .grant_admin(&email)
            .await
            .map_err(|e| anyhow::anyhow!("Could not grant admin role: {}", e))?;
        println!("[*] {} is now an admin.", user.email);
        return Ok(());
    }

    let gateways = build_gateways(&settings);
    for gateway in gateways.values() {
        log::info!(
            "Payment provider enabled: {} ({}).",
            gateway.provider(),
            gateway.currency()
        );
    }

    let mut log_only = HashSet::new();
    if settings
        .monobank
        .as_ref()
        .is_some_and(|monobank| !monobank.apply_payments)
    {
        log::warn!("Monobank payments are logged but not applied.");
        log_only.insert(PaymentProvider::Monobank);
    }

    let webhooks = WebhookConfig::from_settings(&settings);
    let channels = services::start_services(
        store,
        gateways,
        Policies {
            withdrawals: settings.withdrawals,
            referrals: settings.referrals,
            courses: settings.courses,
            log_only,
        },
    );

    let state = AppState {
        identity: Arc::new(HostedAuth::new(settings.auth.url, settings.auth.api_key)),
        channels,
        webhooks: Arc::new(webhooks),
    };

    let listen = args.listen.unwrap_or(settings.server.listen);
    services::http::start_http_server(state, &listen).await
}

fn init_logging(path: &str) -> Result<(), anyhow::Error> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => {
            println!("[*] Logging initialized successfully.");
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] Failed to initialize logging: {}", e);
            Err(anyhow::anyhow!("Could not initialize logging: {}", e))
        }
    }
}
