//! fiatramp - Custodial Ledger & Settlement Engine
//!
//! Run modes:
//!   cargo run                    - Show usage
//!   cargo run -- run             - Start market data + reconciliation services
//!   cargo run -- reconcile       - Run one reconciliation cycle and exit
//!   cargo run -- address <idx>   - Print the receiving address for an index
//!   cargo run -- failed          - List entries awaiting manual reconciliation

use std::env;
use std::process;
use std::sync::Arc;

use fiatramp::config::Config;
use fiatramp::logging;
use fiatramp::{
    HttpBankGateway, KeyVault, MarketData, ReconciliationLoop, SqliteLedgerStore,
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "run" => run_services().await,
        "reconcile" => run_single_cycle().await,
        "address" => print_address(&args[2..]),
        "failed" => list_failed().await,
        "help" | "--help" | "-h" => print_usage(),
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("fiatramp - Custodial Ledger & Settlement Engine");
    println!();
    println!("Usage:");
    println!("  fiatramp run             Start market data and reconciliation services");
    println!("  fiatramp reconcile       Run one reconciliation cycle and exit");
    println!("  fiatramp address <idx>   Print the receiving address for a derivation index");
    println!("  fiatramp failed          List entries awaiting manual reconciliation");
    println!();
    println!("Required Environment Variables:");
    println!("  FIATRAMP_MASTER_KEY      Base58 extended private key (xprv/tprv)");
    println!("  FIATRAMP_TICKER_URL      Upstream exchange ticker endpoint");
    println!("  FIATRAMP_BANK_URL        Bank integration API base URL");
    println!("  FIATRAMP_BANK_USERNAME   Bank API username");
    println!("  FIATRAMP_BANK_PASSWORD   Bank API password");
    println!();
    println!("See src/config.rs for optional settings.");
}

fn load_config() -> Config {
    match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            process::exit(1);
        }
    }
}

fn open_store(config: &Config) -> Arc<SqliteLedgerStore> {
    match SqliteLedgerStore::new(&config.database) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("failed to open database {}: {}", config.database, e);
            process::exit(1);
        }
    }
}

fn build_vault(config: &Config) -> Arc<KeyVault> {
    match config.master_xpriv() {
        Ok(master) => Arc::new(KeyVault::new(master, config.network)),
        Err(e) => {
            eprintln!("master key error: {}", e);
            process::exit(1);
        }
    }
}

fn build_bank(config: &Config) -> Arc<HttpBankGateway> {
    match HttpBankGateway::new(
        &config.bank_url,
        &config.bank_username,
        &config.bank_password,
        config.http_timeout,
    ) {
        Ok(bank) => Arc::new(bank),
        Err(e) => {
            eprintln!("bank gateway error: {}", e);
            process::exit(1);
        }
    }
}

/// Start the market data refresh loop and the reconciliation loop, and
/// run until interrupted.
async fn run_services() {
    let config = load_config();
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("{}", e);
        process::exit(1);
    }

    info!(network = %config.network, "starting fiatramp services");

    let store = open_store(&config);
    let bank = build_bank(&config);
    // Parsed early so a bad key fails at startup, not at the first order.
    let _vault = build_vault(&config);

    let market = match MarketData::new(&config.ticker_url, config.http_timeout, config.ticker_refresh)
    {
        Ok(market) => Arc::new(market),
        Err(e) => {
            eprintln!("market data error: {}", e);
            process::exit(1);
        }
    };

    let recon = Arc::new(ReconciliationLoop::new(
        store,
        bank,
        config.reconcile_interval,
    ));

    let market_task = {
        let market = market.clone();
        tokio::spawn(async move { market.run().await })
    };
    let recon_task = {
        let recon = recon.clone();
        tokio::spawn(async move { recon.run().await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");

    market.stop().await;
    recon.stop().await;
    let _ = market_task.await;
    let _ = recon_task.await;
}

/// One reconciliation cycle, for cron-style operation.
async fn run_single_cycle() {
    let config = load_config();
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("{}", e);
        process::exit(1);
    }

    let store = open_store(&config);
    let bank = build_bank(&config);
    let recon = ReconciliationLoop::new(store, bank, config.reconcile_interval);

    match recon.run_cycle().await {
        Ok(report) => {
            println!(
                "fetched: {}  credited: {}  duplicates: {}  wrong channel: {}  unknown payer: {}  deferred: {}",
                report.fetched,
                report.credited,
                report.duplicates,
                report.wrong_channel,
                report.unknown_payer,
                report.deferred,
            );
        }
        Err(e) => {
            eprintln!("reconciliation cycle failed: {}", e);
            process::exit(1);
        }
    }
}

/// Print the deterministic receiving address for a derivation index.
fn print_address(args: &[String]) {
    let Some(raw) = args.first() else {
        eprintln!("usage: fiatramp address <index>");
        process::exit(1);
    };
    let index: u32 = match raw.parse() {
        Ok(index) => index,
        Err(_) => {
            eprintln!("not a derivation index: {}", raw);
            process::exit(1);
        }
    };

    let config = load_config();
    let vault = build_vault(&config);
    match vault.derive_receiving_key(index) {
        Ok(key) => println!("{}", key.address),
        Err(e) => {
            eprintln!("derivation failed: {}", e);
            process::exit(1);
        }
    }
}

/// List entries that failed after their debit committed.
async fn list_failed() {
    let config = load_config();
    let store = open_store(&config);

    use fiatramp::storage::LedgerStore;
    use fiatramp::EntryStatus;

    match store.entries_with_status(EntryStatus::Failed).await {
        Ok(entries) => {
            if entries.is_empty() {
                println!("no failed entries");
                return;
            }
            for entry in entries {
                println!(
                    "{}  {}  account={}  amount={}  {}",
                    entry.time.to_rfc3339(),
                    entry.kind,
                    entry.account_id,
                    entry.amount,
                    entry.id,
                );
            }
        }
        Err(e) => {
            eprintln!("failed to read ledger: {}", e);
            process::exit(1);
        }
    }
}
