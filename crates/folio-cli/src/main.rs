use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use folio_core::calendar::parse_month_key;
use folio_core::summary::summarize_month;
use folio_core::DateRange;
use folio_providers::{BankProvider, ScriptedBankProvider};
use folio_storage::{ArchiveStore, FinanceStore, PgStore};
use folio_sync::{
    maybe_build_scheduler, portfolio_history, BatchOrchestrator, CategorySeed, Institution, LinkManager, Providers,
    RetentionPass, RetentionPolicy, SyncConfig,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "folio")]
#[command(about = "Personal finance aggregation and sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the nightly batch once and print its summary.
    Sync {
        /// Replay a JSON bank fixture instead of calling the bank aggregator.
        #[arg(long)]
        bank_fixture: Option<PathBuf>,
    },
    /// Archive and roll up aged snapshot and transaction rows.
    Retention,
    /// Serve the HTTP endpoints, with the cron scheduler when enabled.
    Serve,
    Migrate,
    /// Load categories and rules from the YAML seed file.
    Seed {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show bank item and brokerage connection health.
    Status,
    /// Income, spending and investing totals for one month.
    Report {
        /// Month as YYYY-MM.
        #[arg(long)]
        month: String,
    },
    /// Recent daily values and month-end history of the investment portfolio.
    Portfolio {
        /// Limit both series to one brokerage account.
        #[arg(long)]
        account: Option<String>,
    },
    #[command(subcommand)]
    Link(LinkCommand),
    #[command(subcommand)]
    Brokerage(BrokerageCommand),
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    /// Create a link token; `--update` re-authenticates an existing item.
    Token {
        #[arg(long)]
        update: Option<String>,
    },
    Exchange {
        public_token: String,
        #[arg(long)]
        institution_id: Option<String>,
        #[arg(long)]
        institution_name: Option<String>,
    },
    Remove {
        item_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum BrokerageCommand {
    Register,
    Portal,
    Refresh,
    Remove { connection_id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FOLIO_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing already initialized: {err}");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn FinanceStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { bank_fixture: None }) {
        Commands::Sync { bank_fixture } => {
            let store = open_store(&config).await?;
            let mut providers = Providers::from_config(&config)?;
            if let Some(path) = bank_fixture {
                let scripted = ScriptedBankProvider::from_fixture(&path)?;
                info!(fixture = %path.display(), "bank calls replayed from fixture");
                providers.bank = Some(Arc::new(scripted) as Arc<dyn BankProvider>);
            }
            let orchestrator = BatchOrchestrator::new(store, providers, RetentionPolicy::from_config(&config));
            print_json(&orchestrator.run(Utc::now()).await?)?;
        }
        Commands::Retention => {
            let store = open_store(&config).await?;
            let pass = RetentionPass::new(
                store,
                ArchiveStore::new(&config.archive_dir),
                RetentionPolicy::from_config(&config),
            );
            print_json(&pass.run(Utc::now()).await?)?;
        }
        Commands::Serve => {
            let store = open_store(&config).await?;
            let providers = Providers::from_config(&config)?;
            let policy = RetentionPolicy::from_config(&config);
            let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), providers, policy));
            let retention = Arc::new(RetentionPass::new(
                store.clone(),
                ArchiveStore::new(&config.archive_dir),
                policy,
            ));
            if let Some(sched) = maybe_build_scheduler(&config, orchestrator.clone(), retention).await? {
                sched.start().await.context("starting scheduler")?;
            }
            let state = folio_web::AppState::new(store, orchestrator, config.cron_secret.clone());
            folio_web::serve(&config, state).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { path } => {
            let store = open_store(&config).await?;
            let path = path.unwrap_or_else(|| config.categories_path());
            let report = CategorySeed::from_path(&path)?.apply(store.as_ref()).await?;
            println!("seeded {} categories and {} rules", report.categories, report.rules);
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            for item in store.list_items().await? {
                println!(
                    "item {:<28} {:<16} pending={:<5} last_synced={}",
                    item.item_id,
                    item.status.as_str(),
                    item.pending,
                    item.last_synced_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            for connection in store.list_brokerage_connections().await? {
                println!(
                    "brokerage {:<23} {:<20} {}",
                    connection.connection_id,
                    connection.status.as_str(),
                    connection.brokerage
                );
            }
        }
        Commands::Report { month } => {
            let month = parse_month_key(&month).ok_or_else(|| anyhow!("--month must look like YYYY-MM"))?;
            let store = open_store(&config).await?;
            let range = DateRange::month(month);
            let transactions = store.list_transactions(range).await?;
            if transactions.is_empty() {
                let archived = store.list_category_summaries(range).await?;
                print_json(&json!({ "archived": true, "categories": archived }))?;
            } else {
                let categories = store.list_categories().await?;
                print_json(&summarize_month(&transactions, &categories))?;
            }
        }
        Commands::Portfolio { account } => {
            let store = open_store(&config).await?;
            let history = portfolio_history(store.as_ref(), Utc::now().date_naive(), account.as_deref()).await?;
            print_json(&history)?;
        }
        Commands::Link(command) => {
            let store = open_store(&config).await?;
            let links = LinkManager::new(store, Providers::from_config(&config)?, config.owner_id.clone());
            match command {
                LinkCommand::Token { update } => println!("{}", links.create_link_token(update.as_deref()).await?),
                LinkCommand::Exchange {
                    public_token,
                    institution_id,
                    institution_name,
                } => {
                    let institution = institution_id.map(|institution_id| Institution {
                        name: institution_name.unwrap_or_else(|| institution_id.clone()),
                        institution_id,
                    });
                    let item = links
                        .exchange_public_token(&public_token, institution.as_ref(), Utc::now())
                        .await?;
                    println!("linked item {}", item.item_id);
                }
                LinkCommand::Remove { item_id } => {
                    links.remove_item(&item_id).await?;
                    println!("removed item {item_id}");
                }
            }
        }
        Commands::Brokerage(command) => {
            let store = open_store(&config).await?;
            let links = LinkManager::new(store, Providers::from_config(&config)?, config.owner_id.clone());
            match command {
                BrokerageCommand::Register => {
                    let user = links.ensure_brokerage_user().await?;
                    println!("brokerage user {}", user.user_id);
                }
                BrokerageCommand::Portal => println!("{}", links.connection_portal_url().await?),
                BrokerageCommand::Refresh => print_json(&links.refresh_connections(Utc::now()).await?)?,
                BrokerageCommand::Remove { connection_id } => {
                    links.remove_connection(&connection_id).await?;
                    println!("removed connection {connection_id}");
                }
            }
        }
    }

    Ok(())
}
