//! Reversion Trader - Main Entry Point
//!
//! Paper-trades a mean-reversion strategy over a fixed equity basket with
//! state persisted between cycles.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use reversion_trader::assistant::{Assistant, SummaryAssistant};
use reversion_trader::config::Config;
use reversion_trader::engine::{
    CommandAuthorizer, CommandRequest, CycleOrchestrator, InstrumentOutcome, OperatorCommand,
    Scheduler,
};
use reversion_trader::market::YahooChartClient;
use reversion_trader::notify::{LogNotifier, Notifier, WebhookNotifier};
use reversion_trader::persistence::{PersistenceManager, StateStore};
use reversion_trader::utils::decimal::to_percent;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Reversion Trader CLI
#[derive(Parser)]
#[command(name = "reversion-trader")]
#[command(version, about = "Mean-reversion paper trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (default). Operator commands are read from stdin
    /// as "liquidate <caller> [signature]".
    Run,

    /// Run a single cycle and exit
    Once,

    /// Show persisted portfolio state and trade log
    Status {
        /// Number of recent trades to list
        #[arg(short, long, default_value = "10")]
        trades: usize,
    },

    /// Close every open position. Waits for a running scheduler's cycle to
    /// commit before acting.
    Liquidate {
        /// Operator identifier
        #[arg(short, long)]
        caller: String,

        /// Hex HMAC-SHA256 of "<caller>:liquidate" when a command secret is set
        #[arg(short, long)]
        signature: Option<String>,
    },

    /// Ask the operator assistant about the portfolio
    Ask {
        /// Free-form question
        message: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Status { trades } => show_status(&config, trades),
        Commands::Once => {
            let engine = build_engine(config)?;
            let report = engine.run_cycle(Utc::now()).await?;
            for (symbol, outcome) in &report.outcomes {
                match outcome {
                    InstrumentOutcome::Skipped(reason) => println!("   ├─ {}: skipped ({})", symbol, reason),
                    InstrumentOutcome::Failed(reason) => println!("   ├─ {}: failed ({})", symbol, reason),
                    _ => {}
                }
            }
            for trade in &report.trades {
                println!("   ├─ {}", trade.describe());
            }
            println!("   └─ {}", report.summary());
            Ok(())
        }
        Commands::Liquidate { caller, signature } => {
            let authorizer = CommandAuthorizer::new(&config.operator);
            let engine = build_engine(config)?;
            let mut request = CommandRequest::new(caller, OperatorCommand::LiquidateAll);
            if let Some(signature) = signature {
                request = request.signed(signature);
            }
            match engine.handle_command(&authorizer, &request, Utc::now()).await? {
                Some(trades) => {
                    for trade in &trades {
                        println!("   ├─ {}", trade.describe());
                    }
                    println!("   └─ {} position(s) closed", trades.len());
                }
                None => println!("❌ Command rejected"),
            }
            Ok(())
        }
        Commands::Ask { message } => {
            let engine = build_engine(config)?;
            let context = engine.assistant_context().await?;
            let reply = SummaryAssistant.respond(&context, &message.join(" ")).await?;
            println!("{}", reply);
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

/// Wire the engine to the live data source, notifier and state database.
fn build_engine(config: Config) -> Result<CycleOrchestrator> {
    let timeout = Duration::from_secs(config.market.fetch_timeout_secs);
    let provider = Arc::new(YahooChartClient::new(&config.market.base_url, timeout)?);

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.notify.timeout_secs),
        )?),
        _ => {
            info!("📭 No webhook configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let store = Arc::new(
        PersistenceManager::new(&config.persistence.db_path)?
            .with_lock_timeout(Duration::from_secs(config.persistence.lock_timeout_secs))?,
    );

    Ok(CycleOrchestrator::new(config, provider, notifier, store))
}

async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║        Reversion Trader v{} - Paper Trading              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let authorizer = CommandAuthorizer::new(&config.operator);
    let engine_config = config.engine.clone();
    let engine = Arc::new(Mutex::new(build_engine(config)?));

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match CommandRequest::parse(&line) {
                Ok(request) => {
                    if tx.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("⚠️  [COMMAND] Ignoring input: {}", e),
            }
        }
    });

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
    };

    Scheduler::new(engine, authorizer, &engine_config)
        .run(rx, shutdown)
        .await;

    info!("👋 Reversion Trader shutdown complete");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "reversion-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("reversion_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Instruments: {}", config.market.instruments.len());
    info!(
        "   Interval: {} over {}",
        config.market.interval, config.market.lookback
    );
    info!(
        "   Entry z < {} (aggressive < {}), partial at z >= {}",
        config.strategy.z_buy_threshold,
        config.strategy.z_buy_aggressive_threshold,
        config.strategy.z_partial_sell_threshold
    );
    info!(
        "   Stop Loss: {:.2}% | Trailing arms at {:.2}%",
        to_percent(config.strategy.stop_loss_pct),
        to_percent(config.strategy.trailing_activation_pct)
    );
    info!(
        "   Kelly Cap: {:.0}% | VaR Limit: {:.2}% at {}",
        to_percent(config.risk.kelly_cap),
        to_percent(config.risk.var_limit),
        config.risk.var_limit_confidence
    );
    info!(
        "   Circuit Breaker: {} losses -> {}m cooldown",
        config.risk.max_consecutive_losses, config.risk.cooldown_minutes
    );
    info!(
        "   Cycle: {}s | Heartbeat: {}s",
        config.engine.cycle_interval_secs, config.engine.heartbeat_interval_secs
    );
}

/// Print persisted state without touching the network.
fn show_status(config: &Config, trade_limit: usize) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REVERSION TRADER STATUS                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let db_path = &config.persistence.db_path;
    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The engine has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    if !persistence.has_state()? {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    }

    let Some(state) = persistence.load_state()? else {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    };

    println!("\n📊 Account Summary");
    println!("   ├─ Cash:               ${:.2}", state.cash);
    println!("   ├─ Open Positions:     {}", state.position_count());
    println!("   ├─ Consecutive Losses: {}", state.consecutive_losses);
    match state.cooldown_until {
        Some(until) if state.in_cooldown(Utc::now()) => {
            println!("   └─ Circuit Breaker:    COOLDOWN until {}", until.format("%Y-%m-%d %H:%M UTC"))
        }
        _ => println!("   └─ Circuit Breaker:    ACTIVE"),
    }

    println!("\n🎯 Kelly Inputs");
    println!("   ├─ Win Rate:  {:.1}%", to_percent(state.historical_win_rate));
    println!("   ├─ Avg Win:   {:.2}%", to_percent(state.historical_avg_win));
    println!("   └─ Avg Loss:  {:.2}%", to_percent(state.historical_avg_loss));

    if !state.positions.is_empty() {
        println!("\n🔓 Open Positions");
        for symbol in state.open_symbols() {
            let Some(pos) = state.positions.get(&symbol) else {
                continue;
            };
            println!("   ┌─ {}", symbol);
            println!("   ├─ Shares:     {:.4} @ ${:.2}", pos.shares, pos.entry_price);
            println!("   ├─ High Water: ${:.2}", pos.high_water_price);
            if pos.partially_closed {
                println!("   ├─ Partial exit taken");
            }
            println!("   └─ Opened:     {}", pos.entry_time.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }

    let by_action = persistence.pnl_by_action()?;
    if !by_action.is_empty() {
        let mut rows: Vec<_> = by_action.into_iter().collect();
        rows.sort_by_key(|(action, _)| action.as_str());
        println!("\n💰 Realized PnL by Action");
        for (action, pnl) in rows {
            println!("   ├─ {:<18} ${:.2}", action.as_str(), pnl);
        }
    }

    let trades = persistence.recent_trades(trade_limit)?;
    if !trades.is_empty() {
        println!("\n📜 Recent Trades");
        for trade in &trades {
            println!(
                "   ├─ {} {}",
                trade.timestamp.format("%m-%d %H:%M"),
                trade.describe()
            );
        }
    }

    Ok(())
}
