use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chain_backfill::{
    config::{init_logger, BackfillConfig},
    progress, Backfill, DatasetKind, DatasetPlan, FetchClient, GapAuditor, HeightRange,
    ProgressReporter, RecordSource, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report missing heights per dataset without fetching anything
    Audit {
        /// Comma-separated datasets (hashes, headers, stats)
        #[arg(long, value_delimiter = ',', default_values_t = DatasetKind::ALL.to_vec())]
        datasets: Vec<DatasetKind>,
        /// Audit up to this height instead of the chain tip (-1 for none)
        #[arg(long, allow_hyphen_values = true)]
        tip: Option<i64>,
    },
    /// Fetch and store every missing height
    Backfill {
        /// Comma-separated datasets, drained in the given order
        #[arg(long, value_delimiter = ',', default_values_t = DatasetKind::ALL.to_vec())]
        datasets: Vec<DatasetKind>,
        /// Backfill up to this height instead of the chain tip (-1 for none)
        #[arg(long, allow_hyphen_values = true)]
        tip: Option<i64>,
        /// Headers stop at the highest stored hash instead of the chain tip
        #[arg(long, default_value_t = false)]
        catch_up: bool,
    },
}

fn plans(datasets: &[DatasetKind], tip: Option<HeightRange>, catch_up: bool) -> Vec<DatasetPlan> {
    datasets
        .iter()
        .map(|&kind| match (tip, kind.depends_on()) {
            (Some(range), _) => DatasetPlan::fixed(kind, range),
            (None, Some(leader)) if catch_up => DatasetPlan::following(kind, leader),
            (None, _) => DatasetPlan::to_chain_tip(kind),
        })
        .collect()
}

async fn listen_shutdown(cancel: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BackfillConfig::load().context("load configuration")?;
    init_logger(&config.log_level, config.log_json);

    let cancel = CancellationToken::new();
    tokio::spawn(listen_shutdown(cancel.clone()));

    let client = FetchClient::new(config.transport()?)
        .with_retry_policy(config.retry_policy())
        .with_cancellation(cancel.clone());
    let store = Arc::new(
        SqliteStore::new(config.db_path.clone())
            .with_context(|| format!("open store at {}", config.db_path.display()))?,
    );

    match args.command {
        Command::Audit { datasets, tip } => {
            let range = match tip {
                Some(t) => HeightRange::from_sentinel(t)?,
                None => client.chain_tip().await?,
            };
            let auditor = GapAuditor::new(config.audit_strategy);
            for set in auditor.audit_all(&*store, &datasets, range).await? {
                println!(
                    "{:>8}: {} missing of {} (tip {})",
                    set.kind.table(),
                    set.heights.len(),
                    range.len(),
                    range.sentinel()
                );
            }
        }
        Command::Backfill {
            datasets,
            tip,
            catch_up,
        } => {
            let tip = tip.map(HeightRange::from_sentinel).transpose()?;
            let (tx, rx) = progress::channel(config.progress_buffer);
            let reporter = tokio::spawn(ProgressReporter::new().run(rx));

            let engine = Backfill::new(Arc::clone(&store), client)
                .with_audit_strategy(config.audit_strategy)
                .with_header_strategy(config.header_strategy)
                .with_concurrency(config.concurrency)
                .with_progress(tx)
                .with_cancellation(cancel.clone());

            let result = engine.run(&plans(&datasets, tip, catch_up)).await;
            drop(engine);
            let totals = reporter.await?;

            let summary = result?;
            for report in &summary.datasets {
                let retries = totals.get(&report.kind).map_or(0, |t| t.retries);
                println!(
                    "{:>8}: {} missing, {} stored, {} already present, {} skipped, {} retries{}",
                    report.kind.table(),
                    report.missing,
                    report.stored,
                    report.already_present,
                    report.skipped,
                    retries,
                    if report.cancelled { " (interrupted)" } else { "" }
                );
            }
        }
    }
    Ok(())
}
