use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use the_small_inventory_lib::api::{self, SupabaseClient};
use the_small_inventory_lib::display::{self, format_currency, format_quantity, Locale};
use the_small_inventory_lib::sync::{self, ChangeEvent};
use the_small_inventory_lib::{
    db, diagnostics, init_logging, storage, DataManager, InventoryConfig, InventoryError,
    Metric, MetricCache, MetricSource,
};

type Cache = MetricCache<SupabaseClient>;

#[derive(Parser)]
#[command(
    name = "small-inventory",
    about = "Stock valuation and debt dashboard metrics for The Small",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version and build information
    About,
    /// Backend connectivity and local cache health
    Check,
    /// Store backend credentials in the OS keyring
    Login(LoginArgs),
    /// Remove stored backend credentials
    Logout,
    /// Dashboard metrics, served from the cache when fresh
    Report(ReportArgs),
    /// Full stock valuation with per-product lines and ledger findings
    Valuation,
    /// Mark a metric (or every metric depending on a collection) stale
    Invalidate(InvalidateArgs),
    /// Open debts
    Debts,
    /// Register a payment against a debt
    PayDebt(PayDebtArgs),
    /// Rewrite a drifted stock total to quantity x unit cost
    RepairStock(RepairStockArgs),
    /// Keep metrics fresh; reads realtime change payloads as JSON lines on stdin
    Watch,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long, help = "Backend project URL", requires = "anon_key")]
    url: Option<String>,
    #[arg(long, help = "Backend anon key", requires = "url")]
    anon_key: Option<String>,
    #[arg(
        long,
        help = "Connection string (JSON or base64 JSON with url and key)",
        conflicts_with_all = ["url", "anon_key"]
    )]
    connection_string: Option<String>,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Recompute every metric instead of serving fresh cache entries"
    )]
    refresh: bool,
}

#[derive(Args)]
struct InvalidateArgs {
    #[arg(help = "Metric key (e.g. total_stock_value) or collection name (e.g. stock_items)")]
    target: String,
}

#[derive(Args)]
struct PayDebtArgs {
    #[arg(help = "Debt id")]
    id: String,
    #[arg(help = "Amount paid")]
    amount: f64,
}

#[derive(Args)]
struct RepairStockArgs {
    #[arg(help = "Stock item id")]
    item_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::About => print_json(&diagnostics::get_about_info()),
        Commands::Login(args) => handle_login(args)?,
        Commands::Logout => {
            storage::clear_credentials().context("failed to clear credentials")?;
            println!("Backend credentials removed.");
        }
        command => {
            let config = InventoryConfig::resolve().context("failed to resolve configuration")?;
            let _guard = init_logging(&config.log_dir());
            info!(
                version = env!("CARGO_PKG_VERSION"),
                data_dir = %config.data_dir.display(),
                "small-inventory starting"
            );
            let cache = open_cache(&config)?;
            run_command(command, &config, cache, cli.json).await?;
        }
    }

    Ok(())
}

fn open_cache(config: &InventoryConfig) -> Result<Arc<Cache>> {
    let client = SupabaseClient::from_config(config).context("failed to create backend client")?;
    let db = db::init(&config.data_dir).context("failed to open local cache")?;
    Ok(Arc::new(MetricCache::new(
        DataManager::new(Arc::new(client)),
        Arc::new(db),
        config.consistency_tolerance,
    )))
}

async fn run_command(
    command: Commands,
    config: &InventoryConfig,
    cache: Arc<Cache>,
    json: bool,
) -> Result<()> {
    match command {
        Commands::Check => handle_check(config, &cache).await,
        Commands::Report(args) => handle_report(&cache, config.locale, args, json).await,
        Commands::Valuation => handle_valuation(&cache, config.locale, json).await,
        Commands::Invalidate(args) => handle_invalidate(&cache, &args.target),
        Commands::Debts => handle_debts(&cache, config.locale, json).await,
        Commands::PayDebt(args) => handle_pay_debt(&cache, config.locale, args).await,
        Commands::RepairStock(args) => handle_repair_stock(&cache, config.locale, args).await,
        Commands::Watch => handle_watch(config, cache).await,
        Commands::About | Commands::Login(_) | Commands::Logout => Ok(()),
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render JSON: {e}"),
    }
}

fn handle_login(args: LoginArgs) -> Result<()> {
    let (url, anon_key) = match (args.connection_string, args.url, args.anon_key) {
        (Some(raw), _, _) => {
            let url = api::extract_url_from_connection_string(&raw)
                .ok_or_else(|| anyhow!("connection string has no url"))?;
            let key = api::extract_anon_key_from_connection_string(&raw)
                .ok_or_else(|| anyhow!("connection string has no key"))?;
            (url, key)
        }
        (None, Some(url), Some(key)) => (url, key),
        _ => bail!("provide --url and --anon-key, or --connection-string"),
    };
    storage::store_backend_credentials(&url, &anon_key).context("failed to store credentials")?;
    print_json(&storage::get_masked_config());
    Ok(())
}

async fn handle_check(config: &InventoryConfig, cache: &Cache) -> Result<()> {
    let connectivity = cache.data().backend().test_connectivity().await;
    let health = diagnostics::get_cache_health(cache.db())?;
    let status = cache.status()?;
    print_json(&json!({
        "backendUrl": config.backend_url,
        "anonKey": storage::mask_secret(&config.anon_key),
        "locale": config.locale.tag(),
        "refreshIntervalSecs": config.refresh_interval.as_secs(),
        "connectivity": connectivity,
        "cache": health,
        "metrics": status,
    }));
    if !connectivity.success {
        bail!("backend is not reachable");
    }
    Ok(())
}

async fn handle_report(cache: &Cache, locale: Locale, args: ReportArgs, json: bool) -> Result<()> {
    let mut shown = Vec::new();
    for metric in Metric::ALL {
        let value = if args.refresh {
            match cache.recompute(metric.key()).await {
                Ok(value) => Ok(value),
                Err(e) => match cache.last_known(metric)? {
                    Some(last) => Ok(last.with_source(MetricSource::Stale)),
                    None => Err(e),
                },
            }
        } else {
            cache.get_or_last_known(metric.key()).await
        };
        let value = match value {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(metric = %metric, "metric unavailable: {e}");
                None
            }
        };
        shown.push(display::render_metric(metric, value.as_ref(), locale));
    }

    if json {
        print_json(&shown);
        return Ok(());
    }
    for card in &shown {
        match &card.note {
            Some(note) => println!("{:<30} {} ({note})", card.label, card.text),
            None => println!("{:<30} {}", card.label, card.text),
        }
    }
    Ok(())
}

async fn handle_valuation(cache: &Cache, locale: Locale, json: bool) -> Result<()> {
    let valuation = cache.valuation().await.context("failed to load stock")?;
    if json {
        print_json(&valuation);
        return Ok(());
    }

    for line in &valuation.resale_lines {
        println!(
            "{:<32} {:>12} x {:>14} = {:>16}",
            line.product_name,
            format_quantity(line.stock, None, locale),
            format_currency(line.price, locale),
            format_currency(line.value, locale),
        );
    }
    println!();
    println!("Resale products   {}", format_currency(valuation.resale_total, locale));
    println!("Other stock       {}", format_currency(valuation.non_resale_total, locale));
    println!("Total             {}", format_currency(valuation.total, locale));

    if !valuation.inconsistencies.is_empty() {
        println!();
        println!("Ledger rows whose stored total disagrees with quantity x unit cost:");
        for finding in &valuation.inconsistencies {
            println!(
                "  {} ({}): stored {}, expected {}",
                finding.item_name,
                finding.item_id,
                format_currency(finding.stored_total, locale),
                format_currency(finding.expected_total, locale),
            );
        }
    }
    Ok(())
}

fn handle_invalidate(cache: &Cache, target: &str) -> Result<()> {
    if let Ok(metric) = Metric::from_key(target) {
        let existed = cache.invalidate(metric.key())?;
        println!("{metric}: {}", if existed { "marked stale" } else { "not cached" });
        return Ok(());
    }
    let affected = cache.on_change_notification(target)?;
    if affected.is_empty() {
        bail!("'{target}' is neither a metric nor a tracked collection");
    }
    for metric in affected {
        println!("{metric}: marked stale");
    }
    Ok(())
}

async fn handle_debts(cache: &Cache, locale: Locale, json: bool) -> Result<()> {
    let debts: Vec<_> = cache
        .data()
        .load_debts()
        .await
        .context("failed to load debts")?
        .into_iter()
        .filter(|d| !d.is_settled())
        .collect();
    if json {
        print_json(&debts);
        return Ok(());
    }
    for debt in &debts {
        let due = debt
            .due_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<32} {:>16} due {due} [{}]",
            debt.id,
            debt.description,
            format_currency(debt.remaining_amount, locale),
            debt.status.as_str(),
        );
    }
    let total: f64 = debts.iter().map(|d| d.remaining_amount).sum();
    println!("Outstanding: {}", format_currency(total, locale));
    Ok(())
}

async fn handle_pay_debt(cache: &Cache, locale: Locale, args: PayDebtArgs) -> Result<()> {
    let debt = cache
        .data()
        .load_debts()
        .await
        .context("failed to load debts")?
        .into_iter()
        .find(|d| d.id == args.id)
        .ok_or_else(|| InventoryError::NotFound {
            collection: "debts".into(),
            id: args.id.clone(),
        })?;
    let updated = cache.register_debt_payment(&debt, args.amount).await?;
    println!(
        "{}: paid {}, remaining {} [{}]",
        updated.id,
        format_currency(updated.paid_amount, locale),
        format_currency(updated.remaining_amount, locale),
        updated.status.as_str(),
    );
    Ok(())
}

async fn handle_repair_stock(cache: &Cache, locale: Locale, args: RepairStockArgs) -> Result<()> {
    let record = cache
        .data()
        .load_stock_items()
        .await
        .context("failed to load stock items")?
        .into_iter()
        .find(|r| r.item_id == args.item_id)
        .ok_or_else(|| InventoryError::NotFound {
            collection: "stock_items".into(),
            id: args.item_id.clone(),
        })?;
    if record.is_consistent(cache.tolerance()) {
        println!("{} is already consistent", record.item_name);
        return Ok(());
    }
    let repaired = cache.repair_stock_total(&record).await?;
    println!(
        "{}: total {} -> {}",
        repaired.item_name,
        format_currency(record.total_value, locale),
        format_currency(repaired.total_value, locale),
    );
    Ok(())
}

async fn handle_watch(config: &InventoryConfig, cache: Arc<Cache>) -> Result<()> {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);

    let listener = sync::start_change_listener(Arc::clone(&cache), rx, cancel.clone());
    let refresher = sync::start_refresh_loop(
        Arc::clone(&cache),
        Metric::ALL.to_vec(),
        config.refresh_interval,
        cancel.clone(),
    );
    let reader = tokio::spawn(forward_stdin_events(tx, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    cancel.cancel();

    let (listener, refresher, reader) = tokio::join!(listener, refresher, reader);
    listener.context("change listener panicked")?;
    refresher.context("refresh loop panicked")?;
    reader.context("stdin reader panicked")?;
    Ok(())
}

/// Parse realtime payloads from stdin, one JSON object per line.
async fn forward_stdin_events(tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<serde_json::Value>(&line)
            .map_err(InventoryError::from)
            .and_then(|payload| ChangeEvent::from_realtime_payload(&payload));
        match event {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Ignoring change payload: {e}"),
        }
    }
}
