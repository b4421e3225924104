// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod ledger;
mod models;
mod quote;
mod views;

use crate::api::AppContext;
use crate::config::Config;
use crate::quote::{AlphaVantage, QuoteSource, StaticQuotes};
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let pool = match db::init(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    match db::count_users(&pool).await {
        Ok(count) => info!("Connected to database with {} registered users...", count),
        Err(e) => warn!("Could not count users: {}", e),
    }

    match ledger::audit(&pool).await {
        Ok(drifted) if drifted.is_empty() => info!("All cash balances match the transaction log"),
        Ok(drifted) => warn!("{} account(s) disagree with the transaction log", drifted.len()),
        Err(e) => warn!("Could not audit cash balances: {}", e),
    }

    let quotes: Arc<dyn QuoteSource> = match &config.alphavantage_api_key {
        Some(api_key) => match AlphaVantage::new(api_key.clone(), config.quote_timeout) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                error!("Failed to build quote client: {}", e);
                return;
            }
        },
        None => {
            warn!("ALPHAVANTAGE_API_KEY is not set; serving fixed demo prices");
            Arc::new(StaticQuotes::demo())
        }
    };

    let routes = api::routes(AppContext {
        pool,
        quotes,
        config: config.clone(),
    });

    info!("Starting the paper trader on http://{}", config.bind_addr);
    warp::serve(routes).run(config.bind_addr).await;
}
