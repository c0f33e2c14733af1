use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rdc_collect::{CollectConfig, StoreTarget};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rdc-cli")]
#[command(about = "Reddit Discussion Collector command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect one forum's newest posts and their comments.
    Collect(CollectArgs),
    /// Apply database migrations.
    Migrate,
    /// Fetch one post and print its flattened comments as JSON.
    Thread { post_id: String },
    /// Collect repeatedly on a cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct CollectArgs {
    #[arg(long)]
    forum: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    post_chunk_size: Option<usize>,
    #[arg(long)]
    comment_chunk_size: Option<usize>,
    /// Run against an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
}

impl CollectArgs {
    fn apply(&self, config: &mut CollectConfig) {
        if let Some(forum) = &self.forum {
            config.forum = forum.trim_start_matches("r/").to_string();
        }
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(size) = self.post_chunk_size {
            config.chunks.post_chunk_size = size;
        }
        if let Some(size) = self.comment_chunk_size {
            config.chunks.comment_chunk_size = size;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CollectConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Collect(CollectArgs::default())) {
        Commands::Collect(args) => {
            args.apply(&mut config);
            let target = if args.dry_run {
                StoreTarget::Memory
            } else {
                StoreTarget::Postgres
            };
            let summary = rdc_collect::collect_once(&config, target).await?;
            println!(
                "collection complete: run_id={} forum={} posts={} comments={} dangling_parents={} throttled_posts={} failed_posts={}",
                summary.run_id,
                summary.forum,
                summary.posts_persisted,
                summary.comments_persisted,
                summary.dangling_parents,
                summary.throttled_posts,
                summary.failed_posts
            );
        }
        Commands::Migrate => {
            rdc_collect::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Thread { post_id } => {
            let view = rdc_collect::inspect_thread(&config, &post_id).await?;
            let json = serde_json::to_string_pretty(&view).context("encoding thread view")?;
            println!("{json}");
        }
        Commands::Schedule { cron } => {
            if let Some(cron) = cron {
                config.collect_cron = cron;
            }
            rdc_collect::run_scheduled(&config).await?;
        }
    }

    Ok(())
}
