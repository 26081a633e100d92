use std::sync::Arc;

use clap::Parser;
use stonechat_core::auth::AuthManager;
use stonechat_core::ringcentral::RcClient;
use stonechat_core::StonechatConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use stonechat_server::http::{self, HttpState};
use stonechat_server::subsystems::relay::MessageRelay;
use stonechat_server::subsystems::subscription::{self, SubscriptionManager};
use stonechat_server::subsystems::sweep;
use stonechat_server::subsystems::webhook::WebhookIngester;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "stonechat.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match StonechatConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match stonechat_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match stonechat_core::db::health_check(&pool).await {
            Ok(v) => println!("PostgreSQL connected: {}", v),
            Err(e) => {
                println!("PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("Stonechat DB health check passed");
        return Ok(());
    }

    if let Err(e) = stonechat_core::db::run_migrations(&pool).await {
        eprintln!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    let client = match RcClient::new(&config.ringcentral) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build RingCentral client: {}", e);
            std::process::exit(1);
        }
    };
    let auth = Arc::new(AuthManager::new(
        pool.clone(),
        client.clone(),
        config.ringcentral.clone(),
    ));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to listen for Ctrl+C");
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn subscription renewal loop; the first tick reconciles at startup
    let renewal_manager = Arc::new(SubscriptionManager::new(
        pool.clone(),
        client.clone(),
        auth.clone(),
        config.subscription.clone(),
    ));
    let renewal_shutdown = tx.subscribe();
    tokio::spawn(subscription::run_renewal_loop(
        renewal_manager,
        renewal_shutdown,
    ));

    // Spawn idle/stale session sweep
    let sweep_pool = pool.clone();
    let sweep_chat = config.chat.clone();
    let sweep_shutdown = tx.subscribe();
    tokio::spawn(sweep::run_sweep_loop(sweep_pool, sweep_chat, sweep_shutdown));

    // HTTP API in the foreground
    let state = Arc::new(HttpState {
        relay: MessageRelay::new(
            pool.clone(),
            client.clone(),
            auth.clone(),
            config.chat.clone(),
        ),
        ingester: WebhookIngester::new(pool.clone(), config.chat.clone()),
        subscriptions: SubscriptionManager::new(
            pool.clone(),
            client,
            auth,
            config.subscription.clone(),
        ),
        pool,
        config,
    });
    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
