use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use facelogin_core::FacePipeline;
use facelogin_store::SqliteStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod service;

use service::{AuthService, Lookup};

#[derive(Parser)]
#[command(name = "facelogin", about = "Face-based registration and login", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity from a face image
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        /// Image file containing the face
        image: PathBuf,
    },
    /// Identify the registered user in a face image
    Login {
        image: PathBuf,
    },
    /// Show pipeline availability and registration count
    Status,
    /// Look up registered identities
    #[command(group(ArgGroup::new("key").required(true).args(["id", "username", "email"])))]
    Show {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Attach a notification chat id to an identity
    LinkChat {
        id: i64,
        chat_id: String,
    },
    /// Report stored descriptors that cannot be matched
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening identity store at {}", config.db_path.display()))?;

    // Lookup commands never touch the detector model.
    let pipeline = if needs_pipeline(&cli.command) {
        FacePipeline::init(&config.model_path, config.min_face_size, config.crop_dir.clone())
    } else {
        FacePipeline::unavailable("not loaded for this command")
    };
    let engine = engine::spawn_engine(pipeline)?;
    let service = AuthService::new(store, engine, config.thresholds, config.extract_timeout);

    match cli.command {
        Commands::Register {
            username,
            email,
            image,
        } => {
            let image = read_image(&image).await?;
            let identity = service.register(&username, &email, image).await?;
            print_json(&identity)?;
        }
        Commands::Login { image } => {
            let image = read_image(&image).await?;
            match service.login(image).await? {
                Some(found) => print_json(&found)?,
                None => {
                    eprintln!("no matching user");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Status => {
            let status = service.status().await?;
            print_json(&status)?;
        }
        Commands::Show {
            id,
            username,
            email,
        } => {
            let lookup = match (id, username, email) {
                (Some(id), _, _) => Lookup::Id(id),
                (_, Some(username), _) => Lookup::Username(username),
                (_, _, Some(email)) => Lookup::Email(email),
                (None, None, None) => anyhow::bail!("one of --id, --username or --email is required"),
            };
            let found = service.find(lookup).await?;
            print_json(&found)?;
            if found.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::LinkChat { id, chat_id } => {
            let identity = service.link_chat(id, &chat_id).await?;
            print_json(&identity)?;
        }
        Commands::Check => {
            let report = service.check_integrity().await?;
            print_json(&report)?;
            if !report.findings.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn needs_pipeline(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Register { .. } | Commands::Login { .. } | Commands::Status
    )
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading image {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
