//! Operational CLI for the clinic store: initialize the database, inspect
//! the waiting queue, search the directory and manage users. The clinic's
//! front-desk UI lives elsewhere; this binary covers setup and maintenance.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clinica::config::Config;
use clinica::models::UserDraft;
use clinica::Clinic;

#[derive(Parser)]
#[command(name = "clinica", about = "Clinic store maintenance commands")]
struct Cli {
    /// Path to the SQLite store; overrides CLINICA_DB.
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store and seed reference data if it does not exist yet.
    Init,
    /// Print the current waiting-queue snapshot.
    Queue,
    /// Search the person directory.
    Search { query: String },
    /// Create a user (requires superuser credentials).
    CreateUser {
        #[arg(long)]
        admin_user: String,
        #[arg(long)]
        admin_secret: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        secret: String,
        #[arg(long)]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .init();

    let cli = Cli::parse();
    let path = cli.db.unwrap_or(config.database_path);
    let clinic = Clinic::open(&path)
        .await
        .with_context(|| format!("failed to open clinic store at {path}"))?;

    match cli.command {
        Command::Init => {
            println!("store ready at {path}");
        }
        Command::Queue => {
            let entries = clinic.list_queue().await?;
            for entry in &entries {
                println!(
                    "{}  {}  {}  {}",
                    entry.checked_in_at.format("%H:%M"),
                    entry.status.label(),
                    entry.account_type,
                    entry.service,
                );
            }
            println!("{} entries on the board", entries.len());
        }
        Command::Search { query } => {
            for hit in clinic.search_directory(&query, query.is_empty()).await? {
                let roles = match (&hit.holder_kind, hit.dependent_of.is_empty()) {
                    (Some(kind), _) => format!("titular ({})", kind.account_label()),
                    (None, false) => format!("beneficiario de {}", hit.dependent_of.join(", ")),
                    (None, true) => "sin afiliación".to_string(),
                };
                println!("{}  {}  {roles}", hit.person.document(), hit.person.full_name());
            }
        }
        Command::CreateUser {
            admin_user,
            admin_secret,
            username,
            secret,
            role,
        } => {
            let session = clinic.authenticate(&admin_user, &admin_secret).await?;
            let user = clinic
                .create_user(
                    &session,
                    UserDraft { username, secret, role, person_id: None },
                )
                .await?;
            clinic.end_session(&session.token);
            println!("created user {} ({})", user.username, user.role);
        }
    }

    Ok(())
}
