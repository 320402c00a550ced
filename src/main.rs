use anyhow::{Context, Result};
use chrono::FixedOffset;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use signalbot::clock::{Clock, SystemClock};
use signalbot::config::{feed_url_from_env, Settings};
use signalbot::exchange::{BinanceClient, BinanceConfig};
use signalbot::execution::{
    BracketRegistry, PassReport, Reconciler, ReconcilerConfig, Sweeper, SweeperConfig,
};
use signalbot::feed::{RowDefaults, SheetFeed};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser)]
#[command(
    name = "signalbot",
    version,
    about = "Turns spreadsheet trading signals into bracketed futures positions"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Process the feed once and exit (default)
    Run,
    /// Cancel stale TP/SL orders of closed positions once and exit
    Sweep,
    /// Process the feed on a schedule and sweep continuously until Ctrl+C
    Daemon,
    /// Fetch and print parsed signals without touching the exchange
    CheckFeed,
}

// ============================================================================
// Shared State
// ============================================================================

struct Runtime {
    settings: Settings,
    feed: SheetFeed,
    reconciler: Arc<Reconciler>,
    sweeper: Arc<Sweeper>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckFeed => check_feed().await?,
        Command::Run => {
            let runtime = build_runtime().await?;
            run_pass(&runtime.feed, &runtime.reconciler).await?;
        }
        Command::Sweep => {
            let runtime = build_runtime().await?;
            let report = runtime.sweeper.sweep_once().await;
            if report.aborted {
                anyhow::bail!("Sweep aborted: open positions could not be read");
            }
        }
        Command::Daemon => run_daemon(build_runtime().await?).await,
    }

    tracing::info!("👋 signalbot stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("signalbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn feed_offset(hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(hours * 3600)
        .with_context(|| format!("Invalid feed UTC offset: {} hours", hours))
}

async fn build_runtime() -> Result<Runtime> {
    tracing::info!("🚀 signalbot starting");

    let settings = Settings::from_env().context("Invalid configuration")?;
    let http = http_client(settings.http_timeout)?;

    let binance = Arc::new(BinanceClient::new(
        http.clone(),
        BinanceConfig {
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            requests_per_second: settings.requests_per_second,
        },
    ));
    binance
        .sync_time()
        .await
        .context("Exchange connectivity check failed")?;

    let feed = SheetFeed::new(
        http,
        settings.spreadsheet_url.clone(),
        RowDefaults {
            take_profit_pct: settings.default_take_profit_pct,
            stop_loss_pct: settings.default_stop_loss_pct,
            utc_offset: feed_offset(settings.feed_utc_offset_hours)?,
        },
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = BracketRegistry::new();

    let reconciler = Reconciler::new(
        binance.clone(),
        binance.clone(),
        clock.clone(),
        registry.clone(),
        ReconcilerConfig::from_settings(&settings),
    );
    let sweeper = Sweeper::new(
        binance.clone(),
        binance,
        clock,
        registry,
        SweeperConfig::from_settings(&settings),
    );

    tracing::info!("📊 Configuration:");
    tracing::info!("  Exchange: {}", settings.base_url);
    tracing::info!(
        "  Margin per signal: {} {} at {}x",
        settings.fixed_margin_usdt,
        settings.settle_asset,
        settings.leverage
    );
    tracing::info!(
        "  Default TP/SL: {}% / {}%",
        settings.default_take_profit_pct * Decimal::ONE_HUNDRED,
        settings.default_stop_loss_pct * Decimal::ONE_HUNDRED
    );

    Ok(Runtime {
        settings,
        feed,
        reconciler: Arc::new(reconciler),
        sweeper: Arc::new(sweeper),
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn run_pass(feed: &SheetFeed, reconciler: &Reconciler) -> Result<PassReport> {
    let signals = feed
        .fetch_signals()
        .await
        .context("Signal feed unavailable")?;
    Ok(reconciler.run_pass(&signals).await)
}

async fn check_feed() -> Result<()> {
    let (url, offset_hours) = feed_url_from_env().context("Invalid configuration")?;
    let feed = SheetFeed::new(
        http_client(Duration::from_secs(10))?,
        url,
        RowDefaults {
            utc_offset: feed_offset(offset_hours)?,
            ..RowDefaults::default()
        },
    );

    let signals = feed
        .fetch_signals()
        .await
        .context("Signal feed unavailable")?;

    println!("\n{} signals:", signals.len());
    for s in &signals {
        println!(
            "  {:<14} {:<5} ref {:<12} SL {:>6}% TP {:>6}%  created {}  valid {} min",
            s.symbol,
            s.direction,
            s.reference_price,
            s.stop_loss_pct * Decimal::ONE_HUNDRED,
            s.take_profit_pct * Decimal::ONE_HUNDRED,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.valid_for_minutes
        );
    }
    Ok(())
}

async fn run_daemon(runtime: Runtime) {
    let pass_every = runtime.settings.pass_interval;
    let sweep_every = runtime.settings.sweep_interval;

    tracing::info!("🔄 Spawning loops...");

    let pass_task = {
        let feed = runtime.feed.clone();
        let reconciler = runtime.reconciler.clone();
        tokio::spawn(async move {
            pass_loop(feed, reconciler, pass_every).await;
        })
    };

    let sweep_task = {
        let sweeper = runtime.sweeper.clone();
        tokio::spawn(async move {
            sweep_loop(sweeper, sweep_every).await;
        })
    };

    tracing::info!("✅ All loops spawned");
    tracing::info!("  💹 Signals: every {} min", pass_every.as_secs() / 60);
    tracing::info!("  🧹 Sweeper: every {} s", sweep_every.as_secs());
    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = pass_task => {
            tracing::error!("Signal loop exited: {:?}", result);
        }
        result = sweep_task => {
            tracing::error!("Sweeper loop exited: {:?}", result);
        }
    }
}

// ============================================================================
// Loops
// ============================================================================

async fn pass_loop(feed: SheetFeed, reconciler: Arc<Reconciler>, every: Duration) {
    tracing::info!("💹 Signal loop starting...");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        // a dead feed skips this pass only
        if let Err(e) = run_pass(&feed, &reconciler).await {
            tracing::error!("❌ Pass skipped: {:#}", e);
        }
    }
}

async fn sweep_loop(sweeper: Arc<Sweeper>, every: Duration) {
    tracing::info!("🧹 Sweeper loop starting...");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        sweeper.sweep_once().await;
    }
}
