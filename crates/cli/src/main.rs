use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use xiaoxing_core::{
    chat::{ChatRequest, ChatResponse},
    config_path, load_config, IntentClassifier, PromptBuilder,
};
use xiaoxing_knowledge::KnowledgeStore;

#[derive(Parser, Debug)]
#[command(name = "xiaoxing", version, about = "Xiaoxing health assistant CLI")]
struct Cli {
    /// More log output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect the knowledge base
    Knowledge {
        #[command(subcommand)]
        cmd: KnowledgeCmd,
    },
    /// Classify a message into a conversation intent
    Intent { text: String },
    /// Print the prompt that would be sent upstream
    Prompt {
        text: String,
        /// Treat the turn as carrying an image
        #[arg(long)]
        image: bool,
        /// Reference document to include (repeatable)
        #[arg(long = "doc")]
        docs: Vec<String>,
    },
    /// Send a message to a running server
    Ask {
        text: String,
        #[arg(long)]
        image_url: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        server: String,
    },
}

#[derive(Subcommand, Debug)]
enum KnowledgeCmd {
    /// Item counts per category
    Stats {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Keyword search over content and tags
    Search {
        keyword: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Knowledge { cmd } => match cmd {
            KnowledgeCmd::Stats { dir } => {
                let store = open_store(dir)?;
                let stats = store.stats();
                println!("total: {}", stats.total);
                for (category, count) in &stats.categories {
                    println!("  {category:<12} {count}");
                }
            }
            KnowledgeCmd::Search { keyword, dir } => {
                let keyword = keyword.trim();
                anyhow::ensure!(!keyword.is_empty(), "keyword must not be empty");
                let store = open_store(dir)?;
                let hits = store.search_by_keyword(keyword);
                println!("{} hit(s) for '{keyword}'", hits.len());
                for item in hits {
                    println!("[{}] {}", item.category_label(), item.content);
                }
            }
        },
        Commands::Intent { text } => {
            let matched = IntentClassifier::default().classify(&text);
            match matched.keyword {
                Some(keyword) => println!("{} (keyword: {keyword})", matched.intent),
                None => println!("{}", matched.intent),
            }
        }
        Commands::Prompt { text, image, docs } => {
            let intent = IntentClassifier::default().classify(&text).intent;
            println!("{}", PromptBuilder.build(&text, &docs, intent, image));
        }
        Commands::Ask {
            text,
            image_url,
            session,
            server,
        } => ask(&server, text, image_url, session).await?,
    }

    Ok(())
}

fn open_store(dir: Option<PathBuf>) -> anyhow::Result<KnowledgeStore> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            let mut config = load_config(config_path())?;
            config.apply_env();
            config.knowledge.base_path
        }
    };
    anyhow::ensure!(
        dir.is_dir(),
        "knowledge directory {} does not exist",
        dir.display()
    );
    Ok(KnowledgeStore::load(&dir))
}

async fn ask(
    server: &str,
    message: String,
    image_url: Option<String>,
    session_id: Option<String>,
) -> anyhow::Result<()> {
    let url = format!("{}/api/chat", server.trim_end_matches('/'));
    let request = ChatRequest {
        message,
        image_url,
        session_id,
    };

    let response = reqwest::Client::new()
        .post(&url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {body}");
    }

    let reply: ChatResponse = response
        .json()
        .await
        .context("unexpected response body")?;
    println!("[{}] {}", reply.intent, reply.response);
    if let Some(search) = &reply.vector_search {
        println!(
            "-- {} of {} knowledge item(s) used",
            search.retrieved_count, search.total_knowledge
        );
        for hit in &search.top_matches {
            println!("   {:.4} [{}] {}", hit.score, hit.category, hit.content);
        }
    }
    if let Some(widget) = &reply.widget {
        println!("-- widget: {}", widget.content.title);
    }
    Ok(())
}
