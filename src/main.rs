use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adobatch::config::IngestPlan;
use adobatch::data_loader::{CsvSource, TabularSource};
use adobatch::memory::{CollectingReporter, InMemoryQueue, InMemoryRepository, StaticFileResolver};
use adobatch::resolver;
use adobatch::transform::HandlebarsEngine;
use adobatch::worker::{build_tasks, IngestQueue, IngestQueueWorker};

#[derive(Parser)]
#[command(name = "adobatch", about = "Resolve and ingest tabular ADO batches")]
struct Cli {
    /// Ingest plan (YAML)
    #[clap(short, long, default_value = "plan.yaml")]
    plan: String,
    /// Tabular input, CSV or TSV by extension
    #[clap(short, long)]
    input: String,
    /// Run the resolved set through the full pipeline against an
    /// in-memory repository instead of only reporting the resolution
    #[clap(long)]
    simulate: bool,
    /// Acting user id
    #[clap(long, default_value = "admin")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let plan_content = fs::read_to_string(&cli.plan)
        .with_context(|| format!("could not read plan {}", cli.plan))?;
    let plan: IngestPlan = serde_yaml::from_str(&plan_content)?;

    let batch = CsvSource::for_path(&cli.input)?
        .with_source_ref(format!("file://{}", cli.input))
        .read(None, 0)?;
    info!(
        "read {} row(s) from {} for set {}",
        batch.total_rows, cli.input, plan.set_id
    );

    let repo = Arc::new(InMemoryRepository::new());
    let resolution = resolver::resolve(&batch, &plan.columns, plan.op, repo.as_ref()).await?;

    println!(
        "resolved {} object(s), {} invalid row(s)",
        resolution.objects.len(),
        resolution.invalid.len()
    );
    for object in resolution.objects.values() {
        println!(
            "  row {:>3}  {}  type={} parent={}",
            object.index,
            object.uuid,
            object.type_value,
            object
                .parent
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    for index in &resolution.invalid {
        println!("  row {:>3}  invalid", index);
    }

    if cli.simulate {
        let mut engine = HandlebarsEngine::new();
        for (id, source) in &plan.templates {
            engine.register(id, source)?;
        }

        let plan = Arc::new(plan);
        let queue = Arc::new(InMemoryQueue::new());
        let reporter = Arc::new(CollectingReporter::new());
        let worker = IngestQueueWorker::new(
            repo.clone(),
            Arc::new(StaticFileResolver::new()),
            queue.clone(),
            Arc::new(engine),
        )
        .with_reporter(reporter.clone());

        for task in build_tasks(&resolution, &batch, &plan, &cli.user) {
            queue.enqueue(task).await?;
        }
        let outcomes = queue.drain(&worker).await;

        println!(
            "simulated {} delivery(ies), {} entity(ies) in the repository",
            outcomes.len(),
            repo.len().await
        );
        for message in reporter.statuses().await {
            println!("  ok    {}", message);
        }
        for message in reporter.warnings().await {
            println!("  warn  {}", message);
        }
        for message in reporter.errors().await {
            println!("  error {}", message);
        }
    }

    Ok(())
}
