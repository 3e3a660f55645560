use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_adapters::EventEnvelope;
use vigil_core::view::{apply_view, SortColumn, ViewOptions};
use vigil_core::{CanonicalItem, ItemKind, SeverityLevel};
use vigil_storage::postgres::{connect_pool, run_migrations};
use vigil_storage::{AttrFilter, Cursor, ListRequest};
use vigil_sync::{start_scheduler, Cadence, EventsQuery, FindingsQuery, Monitor, MonitorConfig, SyncOutcome};

#[derive(Debug, Parser)]
#[command(name = "vigil-cli")]
#[command(about = "Vigil cloud finding monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncTarget {
    Security,
    Operational,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Findings,
    Events,
}

impl From<KindArg> for ItemKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Findings => ItemKind::SecurityFinding,
            KindArg::Events => ItemKind::OperationalEvent,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and print the report.
    Sync {
        #[arg(value_enum, default_value = "all")]
        target: SyncTarget,
    },
    /// Serve the JSON API, with the scheduler when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
    List {
        #[arg(value_enum)]
        kind: KindArg,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        service: Option<String>,
        #[arg(long, value_parser = SeverityLevel::from_str)]
        severity: Option<SeverityLevel>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
        /// Follow the cursor chain to the end before sorting.
        #[arg(long)]
        all: bool,
        #[arg(long, value_parser = SortColumn::from_str, default_value = "createdAt")]
        sort: SortColumn,
        #[arg(long)]
        desc: bool,
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,
    },
    Get {
        #[arg(value_enum)]
        kind: KindArg,
        account: String,
        id: String,
    },
    Annotate {
        #[arg(value_enum)]
        kind: KindArg,
        account: String,
        id: String,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long)]
        determination: Option<String>,
    },
    /// Ingest one pushed event envelope from a JSON file.
    IngestEvent { file: PathBuf },
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected RFC 3339 timestamp: {err}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_sync(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => println!(
            "sync complete: source={} run_id={} stored={} scopes={} failed_scopes={} aborted={}",
            report.source,
            report.run_id,
            report.stored,
            report.scopes_completed,
            report.scope_failures.len(),
            report.aborted.as_deref().unwrap_or("no"),
        ),
        SyncOutcome::Skipped { source } => println!("sync skipped: source={source} already running"),
    }
}

fn print_item_row(item: &CanonicalItem) {
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        item.account_id,
        item.severity_level().label(),
        item.status_code(),
        item.created_at,
        item.sort_key,
        item.title
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync { target: SyncTarget::All }) {
        Commands::Sync { target } => {
            let monitor = Monitor::from_config(&config).await?;
            if matches!(target, SyncTarget::Security | SyncTarget::All) {
                print_sync(&monitor.sync_security().await);
            }
            if matches!(target, SyncTarget::Operational | SyncTarget::All) {
                print_sync(&monitor.sync_operational().await);
            }
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is not set; nothing to migrate");
            };
            let pool = connect_pool(url).await.context("connecting to database")?;
            run_migrations(&pool).await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            if let Some(url) = &config.database_url {
                let pool = connect_pool(url).await.context("connecting to database")?;
                run_migrations(&pool).await.context("running migrations")?;
            }
            let monitor = Arc::new(Monitor::from_config(&config).await?);
            let _scheduler = if config.scheduler_enabled {
                Some(start_scheduler(monitor.clone(), Cadence::from_config(&config)).await?)
            } else {
                info!("scheduler disabled");
                None
            };
            vigil_web::serve(monitor, config.web_port).await?;
        }
        Commands::List {
            kind,
            account,
            service,
            severity,
            limit,
            cursor,
            all,
            sort,
            desc,
            from,
            to,
        } => {
            let monitor = Monitor::from_config(&config).await?;
            let kind = ItemKind::from(kind);
            let (items, next_token) = if all {
                let status = (kind == ItemKind::OperationalEvent && account.is_none()).then(|| "open".to_string());
                let request = ListRequest {
                    partition_key: account,
                    status,
                    filter: service.map(|s| AttrFilter::eq("service", s)),
                    limit: 1000,
                    ..Default::default()
                };
                (monitor.list_all(kind, request).await?, None)
            } else {
                let cursor = cursor.map(Cursor::from_token);
                let page = match kind {
                    ItemKind::SecurityFinding => {
                        monitor
                            .query_findings(FindingsQuery {
                                account_id: account,
                                severity,
                                cursor,
                                limit,
                            })
                            .await?
                    }
                    ItemKind::OperationalEvent => {
                        monitor
                            .query_events(EventsQuery {
                                account_id: account,
                                service,
                                cursor,
                                limit,
                            })
                            .await?
                    }
                };
                (page.items, page.next_cursor)
            };
            let view = apply_view(
                &items,
                &ViewOptions {
                    severity,
                    from,
                    to,
                    sort,
                    descending: desc,
                    ..Default::default()
                },
            );
            for item in &view.items {
                print_item_row(item);
            }
            println!("matched={} fetched={}", view.matched, items.len());
            if let Some(token) = next_token {
                println!("next_token={}", token.as_str());
            }
        }
        Commands::Get { kind, account, id } => {
            let monitor = Monitor::from_config(&config).await?;
            print_json(&monitor.get_one(kind.into(), &account, &id).await?)?;
        }
        Commands::Annotate {
            kind,
            account,
            id,
            comment,
            determination,
        } => {
            let monitor = Monitor::from_config(&config).await?;
            let kind = ItemKind::from(kind);
            monitor
                .annotate(kind, &account, &id, comment, determination.as_deref())
                .await?;
            print_json(&monitor.get_one(kind, &account, &id).await?)?;
        }
        Commands::IngestEvent { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let envelope: EventEnvelope =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            let monitor = Monitor::from_config(&config).await?;
            print_json(&monitor.ingest_event(envelope).await?)?;
        }
    }

    Ok(())
}
