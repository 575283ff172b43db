use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yth_core::Diagnostic;
use yth_harvest::HarvestConfig;
use yth_warehouse::{AnalysisQuery, CellValue, QueryResult, Warehouse};

#[derive(Debug, Parser)]
#[command(name = "yth-cli")]
#[command(about = "Harvest video-platform channels into a SQLite warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve,
    /// Create warehouse tables if missing.
    Schema,
    /// Collect channels and load them into the warehouse.
    Harvest {
        #[arg(required = true)]
        channel_ids: Vec<String>,
        /// Stage videos before loading.
        #[arg(long)]
        videos: bool,
        /// Stage videos and their comments before loading.
        #[arg(long)]
        comments: bool,
        /// Stop after staging.
        #[arg(long)]
        no_load: bool,
    },
    /// List warehouse channels.
    Channels,
    /// Run a canned analysis by slug.
    Analysis {
        slug: String,
        #[arg(long = "channel")]
        channel_id: Option<String>,
    },
    /// Run a read-only SQL statement.
    Query { sql: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => yth_web::serve_from_env().await?,
        Commands::Schema => {
            open_warehouse(&config).await?;
            println!("schema ready: {}", config.warehouse_url);
        }
        Commands::Harvest {
            channel_ids,
            videos,
            comments,
            no_load,
        } => harvest(&config, &channel_ids, videos || comments, comments, no_load).await?,
        Commands::Channels => {
            let warehouse = open_warehouse(&config).await?;
            let (channels, diagnostics) = warehouse.list_channels().await.into_parts();
            for channel in channels {
                println!("{}\t{}", channel.id, channel.name);
            }
            fail_on(&diagnostics)?;
        }
        Commands::Analysis { slug, channel_id } => {
            let Some(query) = AnalysisQuery::from_slug(&slug) else {
                let known = AnalysisQuery::ALL.map(AnalysisQuery::slug).join(", ");
                bail!("unknown analysis {slug}; expected one of: {known}");
            };
            let warehouse = open_warehouse(&config).await?;
            println!("# {}", query.description());
            let (table, diagnostics) = warehouse
                .run_analysis(query, channel_id.as_deref())
                .await
                .into_parts();
            print_table(&table);
            fail_on(&diagnostics)?;
        }
        Commands::Query { sql } => {
            let warehouse = open_warehouse(&config).await?;
            let (table, diagnostics) = warehouse.run_query(&sql).await.into_parts();
            print_table(&table);
            fail_on(&diagnostics)?;
        }
    }

    Ok(())
}

async fn open_warehouse(config: &HarvestConfig) -> Result<Warehouse> {
    let warehouse = Warehouse::connect(&config.warehouse_url)
        .await
        .with_context(|| format!("opening warehouse {}", config.warehouse_url))?;
    warehouse.ensure_schema().await?;
    Ok(warehouse)
}

async fn harvest(
    config: &HarvestConfig,
    channel_ids: &[String],
    videos: bool,
    comments: bool,
    no_load: bool,
) -> Result<()> {
    let mut harvester = yth_harvest::harvester_from_config(config).await?;

    for channel_id in channel_ids {
        if let Err(err) = harvester.collect(channel_id).await {
            warn!(channel_id, error = %err, "skipping channel");
            continue;
        }
        if videos {
            harvester.fetch_videos(channel_id).await?;
        }
        if comments {
            harvester.fetch_comments(channel_id).await?;
        }
    }

    for staged in harvester.staged_channels() {
        println!(
            "staged {} ({}): {:?} videos={} comments={}",
            staged.channel_id,
            staged.channel_name,
            staged.stage,
            staged.videos.map_or("-".to_string(), |n| n.to_string()),
            staged.comments.map_or("-".to_string(), |n| n.to_string()),
        );
    }
    if no_load {
        return Ok(());
    }

    let report = harvester.load_all().await?;
    println!(
        "load complete: run_id={} loaded={} degraded={} failed={} channels={} videos={} comments={}",
        report.run_id,
        report.loaded.len(),
        report.degraded.len(),
        report.failed.len(),
        report.totals.channels,
        report.totals.videos,
        report.totals.comments
    );
    for degraded in &report.degraded {
        for diagnostic in &degraded.diagnostics {
            eprintln!("degraded {}: {}", degraded.channel_id, diagnostic.message);
        }
    }
    for failed in &report.failed {
        eprintln!("failed {}: {}", failed.channel_id, failed.error);
    }
    if !report.failed.is_empty() {
        bail!("{} channel(s) failed to load and remain staged", report.failed.len());
    }
    Ok(())
}

fn print_table(table: &QueryResult) {
    println!("{}", table.columns.join("\t"));
    for row in &table.rows {
        let cells = row.iter().map(cell_text).collect::<Vec<_>>();
        println!("{}", cells.join("\t"));
    }
}

fn cell_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => "NULL".to_string(),
        CellValue::Integer(n) => n.to_string(),
        CellValue::Real(x) => format!("{x:.2}"),
        CellValue::Text(s) => s.clone(),
    }
}

fn fail_on(diagnostics: &[Diagnostic]) -> Result<()> {
    match diagnostics.iter().find(|d| d.is_failure()) {
        Some(diagnostic) => bail!("{}", diagnostic.message),
        None => Ok(()),
    }
}
