use alphatrader::audit::{AuditStore, CycleQuery, MemoryAuditStore, PostgresAuditStore};
use alphatrader::config::AppConfig;
use alphatrader::exchange::{BinanceFutures, Exchange, PaperExchange};
use alphatrader::execution::{EngineEvent, ExecutionEngine};
use alphatrader::market::{BinanceMarketData, IngestionTask, MarketDataCache};
use alphatrader::models::{Action, Timeframe};
use alphatrader::oracle;
use alphatrader::orchestrator::{DecisionOrchestrator, RunState};
use alphatrader::persistence::BarArchive;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

#[derive(Parser)]
#[command(name = "alphatrader", about = "Automated futures trading loop")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop until Ctrl+C
    Run {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Trade against the in-process paper exchange
        #[arg(long)]
        dry_run: bool,
    },
    /// Query persisted decision cycles, newest first
    Audit {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        symbol: Option<String>,

        /// e.g. OPEN_LONG, HOLD
        #[arg(long)]
        action: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    match Cli::parse().command {
        Command::Run { config, dry_run } => run(config, dry_run).await,
        Command::Audit {
            config,
            symbol,
            action,
            limit,
            offset,
        } => {
            let query = CycleQuery {
                symbol,
                action: action.map(|a| Action::from(a.to_uppercase())),
                limit,
                offset,
                ..Default::default()
            };
            audit(config, query).await
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("alphatrader=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    AppConfig::load(path.as_deref()).context("loading configuration")
}

async fn connect_audit(config: &AppConfig) -> Result<Arc<dyn AuditStore>> {
    match &config.audit.database_url {
        Some(url) => {
            let store = PostgresAuditStore::connect(url)
                .await
                .context("connecting to the audit database")?;
            tracing::info!("Audit store: PostgreSQL");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("audit.database_url not set, cycles are kept in memory only");
            Ok(Arc::new(MemoryAuditStore::default()))
        }
    }
}

async fn connect_archive(config: &AppConfig) -> Option<BarArchive> {
    let url = config.market.redis_url.as_deref()?;
    match BarArchive::connect(url).await {
        Ok(archive) => {
            tracing::info!("Bar archive enabled");
            Some(archive)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bar archive unavailable, warming up from REST only");
            None
        }
    }
}

fn create_exchange(config: &AppConfig, cache: &MarketDataCache, dry_run: bool) -> Result<Arc<dyn Exchange>> {
    if dry_run {
        let timeframe = config
            .market
            .timeframes
            .iter()
            .min()
            .copied()
            .unwrap_or(Timeframe::M1);
        tracing::info!(balance = config.exchange.paper_balance, "Dry run on the paper exchange");
        let paper = PaperExchange::new(config.exchange.paper_balance, config.execution.taker_fee_rate)
            .with_market(cache.clone(), timeframe);
        return Ok(Arc::new(paper));
    }

    let live = BinanceFutures::new(&config.exchange).context("creating the exchange client")?;
    tracing::info!(url = %config.exchange.rest_url, "Live trading on Binance USD-M futures");
    Ok(Arc::new(live))
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config_path: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        symbols = ?config.market.symbols,
        timeframes = ?config.market.timeframes,
        oracle = ?config.oracle.provider,
        "alphatrader starting"
    );

    let cache = MarketDataCache::new(config.market.buffer_capacity, config.market.max_silence());
    let audit = connect_audit(&config).await?;
    let exchange = create_exchange(&config, &cache, dry_run)?;
    let oracle = oracle::from_config(&config.oracle).map_err(|e| anyhow!("creating the oracle: {e}"))?;

    let engine = Arc::new(
        ExecutionEngine::new(
            exchange,
            config.execution.clone(),
            config.risk.leverage,
            config.market.symbols.clone(),
        )
        .with_audit(audit.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let binance = Arc::new(
        BinanceMarketData::new(&config.exchange.rest_url, &config.market.ws_url)
            .context("creating the market data client")?,
    );
    let mut ingestion = IngestionTask::new(cache.clone(), binance.clone(), binance, config.market.clone());
    if let Some(archive) = connect_archive(&config).await {
        ingestion = ingestion.with_archive(archive);
    }
    let ingestion_task = tokio::spawn(ingestion.run(shutdown_rx));

    let events_task = {
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Engine events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    EngineEvent::PositionDesync { symbol, expected, observed } => {
                        tracing::error!(symbol = %symbol, expected, observed, "Position desync, symbol suspended");
                    }
                    EngineEvent::PositionResumed { symbol } => {
                        tracing::info!(symbol = %symbol, "Position agrees with the exchange again");
                    }
                    EngineEvent::OrderResolved(order) => {
                        tracing::info!(
                            symbol = %order.symbol,
                            client_order_id = %order.client_order_id,
                            status = order.status.as_str(),
                            "Order resolved by reconciliation"
                        );
                    }
                }
            }
        })
    };

    let orchestrator = DecisionOrchestrator::new(&config, cache, oracle, engine, audit);
    orchestrator.start()?;
    tracing::info!("Press Ctrl+C to stop");

    let mut halted = false;
    let mut status_ticker = tokio::time::interval(config.orchestrator.tick_interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = status_ticker.tick() => {
                let status = orchestrator.status();
                if status.run_state == RunState::Halted {
                    tracing::error!(reason = ?status.halt_reason, "Orchestrator halted, shutting down");
                    halted = true;
                    break;
                }
                for symbol in &status.symbols {
                    tracing::debug!(
                        symbol = %symbol.symbol,
                        state = symbol.state.as_str(),
                        category = ?symbol.last_category,
                        action = ?symbol.last_action,
                        suspended = symbol.suspended,
                        "Symbol status"
                    );
                }
            }
        }
    }

    orchestrator.stop().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = ingestion_task.await {
        tracing::warn!(error = %e, "Ingestion task ended abnormally");
    }
    events_task.abort();

    let status = orchestrator.status();
    tracing::info!(cycles = status.completed_cycles, "alphatrader stopped");
    if halted {
        return Err(anyhow!(
            "halted: {}",
            status.halt_reason.unwrap_or_else(|| "unknown".to_string())
        ));
    }
    Ok(())
}

async fn audit(config_path: Option<PathBuf>, query: CycleQuery) -> Result<()> {
    let config = load_config(config_path)?;
    let url = config
        .audit
        .database_url
        .as_deref()
        .context("audit.database_url must be set to query the audit store")?;
    let store = PostgresAuditStore::connect(url)
        .await
        .context("connecting to the audit database")?;

    let page = store.query(&query).await?;
    println!(
        "{} matching cycle(s), showing {} from offset {}",
        page.total,
        page.cycles.len(),
        query.offset
    );
    for cycle in &page.cycles {
        println!(
            "\n{} {} ({} ms)",
            cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
            cycle.id,
            cycle.duration_ms
        );
        for entry in &cycle.entries {
            let gate = entry
                .gate
                .as_ref()
                .map(|g| g.reason.code())
                .unwrap_or("-");
            let order = entry
                .order
                .as_ref()
                .map(|o| format!("{} {} {}", o.side.as_str(), o.requested_quantity, o.status.as_str()))
                .unwrap_or_else(|| "-".to_string());
            let category = entry
                .category()
                .map(|c| c.as_str())
                .unwrap_or("ok");
            println!(
                "  {:<10} {:<12} gate={:<24} order={:<28} {}{}",
                entry.symbol,
                entry.decision.action.as_str(),
                gate,
                order,
                category,
                if entry.timed_out { " (timed out)" } else { "" }
            );
            println!("    {}", entry.decision.reasoning);
        }
    }
    Ok(())
}
