//! BROski Rewards Server
//!
//! Feature gating and BROski$ rewards for the HyperCode IDE

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use broski_rewards::chain::{parse_contract, read_provider, wallet_provider};
use broski_rewards::server::AppState;
use broski_rewards::{
    ChainClient, Config, EvmFeatureGate, EvmToken, FeatureAccessChecker, LeaderboardAggregator,
    PayoutWorker, PgStorage, QuestBoard, RewardDisperser, RewardLedger, RewardStore,
    SqliteStorage,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting BROski Rewards Server");

    let config_path =
        std::env::var("BROSKI_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load_from(&config_path)?;

    // PostgreSQL when DATABASE_URL is set, local SQLite otherwise
    let store: Arc<dyn RewardStore> = match config.database_url() {
        Some(url) => {
            let storage = PgStorage::new(&url).await?;
            info!("PostgreSQL storage initialized");
            Arc::new(storage)
        }
        None => {
            let storage = SqliteStorage::new(&config.database.sqlite_path)?;
            info!("SQLite storage initialized at {}", config.database.sqlite_path);
            Arc::new(storage)
        }
    };

    let rpc_url = config.rpc_url();
    let provider = read_provider(&rpc_url)?;
    let chain = ChainClient::new(provider.clone(), config.chain.request_timeout());

    let gate_address = config.feature_gate_address().ok_or_else(|| {
        error!("FEATURE_GATE_ADDRESS is required");
        anyhow::anyhow!("FEATURE_GATE_ADDRESS not set")
    })?;
    let gate = EvmFeatureGate::new(provider, parse_contract("FeatureGate", &gate_address)?);
    let access = Arc::new(
        FeatureAccessChecker::new(Arc::new(gate), config.chain.request_timeout())
            .with_cache(config.chain.access_cache_ttl()),
    );
    info!("Feature gate at {}", gate_address);

    let ledger = Arc::new(
        RewardLedger::new(store.clone(), config.rewards.clone())
            .with_approver(config.admin_address()),
    );

    let payouts = match (config.token_address(), config.treasury_private_key()) {
        (Some(token_address), Some(key)) => {
            let (signer, treasury) = wallet_provider(&rpc_url, &key)?;
            let token = EvmToken::new(
                signer,
                parse_contract("BROski$ token", &token_address)?,
                treasury,
            );
            match token.decimals().await {
                Ok(decimals) if decimals != config.chain.token_decimals => warn!(
                    "Token reports {} decimals, config says {}",
                    decimals, config.chain.token_decimals
                ),
                Ok(_) => {}
                Err(e) => warn!("Could not read token decimals: {}", e),
            }

            let disperser = Arc::new(RewardDisperser::new(Arc::new(token), &config.chain));
            info!("Payouts enabled from treasury {}", treasury);
            Some(Arc::new(PayoutWorker::new(
                store.clone(),
                disperser,
                config.payout.clone(),
            )))
        }
        _ => {
            warn!("BROSKI_TOKEN_ADDRESS or REWARD_WALLET_PRIVATE_KEY not set, payouts disabled");
            None
        }
    };

    // Background outbox worker
    if let Some(worker) = &payouts {
        let interval = Duration::from_secs(config.payout.interval_secs);
        tokio::spawn(worker.clone().run(interval));
    }

    if config.admin_token().is_none() {
        warn!("ADMIN_TOKEN not set, contribution approval is closed");
    }

    let state = Arc::new(AppState {
        access,
        leaderboard: LeaderboardAggregator::new(store.clone()),
        quests: QuestBoard::new(config.quests.clone(), ledger.clone()),
        ledger,
        payouts,
        chain: Some(chain),
        admin_token: config.admin_token(),
        started_at: Instant::now(),
    });

    broski_rewards::server::run_server(&config.host(), config.port(), state)
        .await
        .context("Server failed")?;

    Ok(())
}
