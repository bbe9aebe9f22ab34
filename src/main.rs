use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use sifto::clients::{OpenAiEmbeddings, ResendMailer, WorkerClient};
use sifto::db::Database;
use sifto::environment::Config;
use sifto::events::{DigestRef, ItemCreated};
use sifto::logging::configure_logging;
use sifto::pipeline::Pipeline;
use sifto::plan::build_reading_plan;
use sifto::related::find_related;
use sifto::rss::fetch_all_sources;
use sifto::schedule;
use sifto::TARGET_PIPELINE;

#[derive(Parser)]
#[clap(name = "sifto", about = "RSS enrichment pipeline and daily digest")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a user
    AddUser {
        #[clap(required = true)]
        email: String,
    },

    /// Register a feed for a user
    AddSource {
        #[clap(required = true)]
        user_id: String,
        #[clap(required = true)]
        url: String,
        #[clap(short, long)]
        title: Option<String>,
    },

    /// Poll every enabled feed once
    FetchFeeds,

    /// Run extract, facts, summary and embedding for one item
    ProcessItem {
        #[clap(required = true)]
        item_id: String,
    },

    /// Embed one summarized item
    EmbedItem {
        #[clap(required = true)]
        item_id: String,
    },

    /// Queue embedding runs for summarized items without a vector
    BackfillEmbeddings {
        #[clap(short, long, default_value = "100")]
        limit: i64,
    },

    /// Reset failed items and queue them again
    RetryFailed {
        #[clap(short, long, default_value = "100")]
        limit: i64,
    },

    /// Create today's digests (defaults to DIGEST_USER_IDS, else every user)
    GenerateDigests {
        #[clap(short, long)]
        user: Vec<String>,
    },

    /// Compose email copy for one digest
    ComposeDigest {
        #[clap(required = true)]
        digest_id: String,
    },

    /// Send one composed digest
    SendDigest {
        #[clap(required = true)]
        digest_id: String,
    },

    /// Send monthly budget alerts
    CheckBudgets,

    /// Print related items for an item as JSON
    Related {
        #[clap(required = true)]
        user_id: String,
        #[clap(required = true)]
        item_id: String,
        #[clap(short, long, default_value = "6")]
        limit: usize,
    },

    /// Print the reading plan for a user as JSON
    ReadingPlan {
        #[clap(required = true)]
        user_id: String,
        #[clap(short, long, default_value = "15")]
        size: usize,
        /// Build the plan around these item ids instead of the top unread
        #[clap(long)]
        selected: Vec<String>,
    },

    /// Handle queued events
    Work {
        /// Drain what is available now and exit
        #[clap(long)]
        once: bool,
    },

    /// Event worker plus scheduled feed polling, digests and budget checks
    Run,
}

fn build_pipeline(config: &Config, db: Database) -> Result<Pipeline> {
    let content = Arc::new(WorkerClient::new(config)?);
    let embedder = Arc::new(OpenAiEmbeddings::new(&config.openai_api_base_url)?);
    let mailer = Arc::new(ResendMailer::new(config)?);
    let events = Arc::new(db.clone());
    Ok(Pipeline::new(config, db, content, embedder, mailer, events))
}

async fn digest_ref(db: &Database, digest_id: &str) -> Result<DigestRef> {
    let digest = db
        .get_digest(digest_id)
        .await?
        .ok_or_else(|| anyhow!("digest {} not found", digest_id))?;
    let user = db
        .get_user(&digest.user_id)
        .await?
        .ok_or_else(|| anyhow!("user {} not found", digest.user_id))?;
    Ok(DigestRef {
        digest_id: digest.id,
        user_id: user.id,
        to: user.email,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let args = Cli::parse();
    let config = Config::from_env();
    let db = Database::new(&config.database_path).await?;
    let pipeline = build_pipeline(&config, db.clone())?;

    match args.command {
        Commands::AddUser { email } => {
            let id = db.create_user(&email).await?;
            println!("{}", id);
        }
        Commands::AddSource {
            user_id,
            url,
            title,
        } => {
            let id = db.create_source(&user_id, &url, title.as_deref()).await?;
            println!("{}", id);
        }
        Commands::FetchFeeds => {
            let summary = fetch_all_sources(&db, &db).await?;
            println!("new_items={}", summary.new_items);
        }
        Commands::ProcessItem { item_id } => {
            let item = db
                .get_item(&item_id)
                .await?
                .ok_or_else(|| anyhow!("item {} not found", item_id))?;
            let event = ItemCreated {
                item_id: item.id,
                source_id: item.source_id,
                url: item.url,
                title: item.title,
            };
            let outcome = pipeline.process_item(&event).await?;
            println!("{:?}", outcome);
        }
        Commands::EmbedItem { item_id } => {
            let outcome = pipeline.embed_item(&item_id).await?;
            println!("{:?}", outcome);
        }
        Commands::BackfillEmbeddings { limit } => {
            let queued = pipeline.backfill_embeddings(limit).await?;
            println!("queued={}", queued);
        }
        Commands::RetryFailed { limit } => {
            let queued = pipeline.retry_failed_items(limit).await?;
            println!("queued={}", queued);
        }
        Commands::GenerateDigests { user } => {
            let users = if user.is_empty() {
                config.digest_user_ids.clone()
            } else {
                user
            };
            let summary = pipeline.generate_digests(Utc::now(), &users).await?;
            println!("{:?}", summary);
        }
        Commands::ComposeDigest { digest_id } => {
            let data = digest_ref(&db, &digest_id).await?;
            let outcome = pipeline.compose_digest_copy(&data).await?;
            println!("{:?}", outcome);
        }
        Commands::SendDigest { digest_id } => {
            let data = digest_ref(&db, &digest_id).await?;
            let outcome = pipeline.send_digest(&data).await?;
            println!("{:?}", outcome);
        }
        Commands::CheckBudgets => {
            let summary = pipeline.check_budget_alerts(Utc::now()).await?;
            println!("{:?}", summary);
        }
        Commands::Related {
            user_id,
            item_id,
            limit,
        } => {
            let related = find_related(&db, &user_id, &item_id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&related)?);
        }
        Commands::ReadingPlan {
            user_id,
            size,
            selected,
        } => {
            let plan = build_reading_plan(&db, &user_id, size, &selected).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Work { once } => {
            if once {
                let handled = pipeline.drain_events().await?;
                println!("handled={}", handled);
            } else {
                tokio::select! {
                    _ = pipeline.run_event_worker(config.event_poll_interval) => {}
                    _ = signal::ctrl_c() => info!(target: TARGET_PIPELINE, "Shutting down event worker"),
                }
            }
        }
        Commands::Run => {
            let tasks = vec![
                tokio::spawn(schedule::feed_loop(pipeline.clone())),
                tokio::spawn(schedule::digest_loop(
                    pipeline.clone(),
                    config.digest_user_ids.clone(),
                )),
                tokio::spawn(schedule::budget_loop(pipeline.clone())),
                {
                    let worker = pipeline.clone();
                    let poll = config.event_poll_interval;
                    tokio::spawn(async move { worker.run_event_worker(poll).await })
                },
            ];
            if let Err(e) = signal::ctrl_c().await {
                error!(target: TARGET_PIPELINE, "Failed to listen for ctrl-c: {}", e);
            }
            info!(target: TARGET_PIPELINE, "Shutting down");
            for task in tasks {
                task.abort();
            }
        }
    }

    Ok(())
}
