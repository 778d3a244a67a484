use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use user_activator::{
    config::ActivatorConfig,
    db,
    models::{Document, DocumentWrite, UserRecord},
    repositories::{DocumentStore, RepositoryError, SqliteDocumentStore},
};

#[derive(Parser)]
#[command(name = "user-activator-cli")]
#[command(about = "CLI tool for managing pending and verified user records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Records waiting for verification
    Pending {
        #[command(subcommand)]
        command: PendingCommands,
    },
    /// Activated records
    Verified {
        #[command(subcommand)]
        command: VerifiedCommands,
    },
}

#[derive(Subcommand)]
enum PendingCommands {
    /// Register a new unverified user
    Create {
        /// Email address
        #[arg(short, long)]
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// User id (generated if not provided)
        #[arg(long)]
        id: Option<String>,
    },

    /// Mark a pending user as verified; the activator picks it up from there
    Verify {
        /// User id
        #[arg(long)]
        id: String,
    },

    /// List pending users
    List {
        /// Maximum number of users to display
        #[arg(short, long, default_value_t = 100)]
        limit: i64,

        /// Offset for pagination
        #[arg(short = 'o', long, default_value_t = 0)]
        offset: i64,
    },

    /// Print one pending record as JSON
    Show {
        /// User id
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum VerifiedCommands {
    /// List verified users
    List {
        /// Maximum number of users to display
        #[arg(short, long, default_value_t = 100)]
        limit: i64,

        /// Offset for pagination
        #[arg(short = 'o', long, default_value_t = 0)]
        offset: i64,
    },

    /// Print one verified record as JSON
    Show {
        /// User id
        #[arg(long)]
        id: String,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("❌ {}", message);
    std::process::exit(1);
}

async fn list_collection(store: &dyn DocumentStore, collection: &str, limit: i64, offset: i64) {
    match store.list(collection, Some(limit), Some(offset)).await {
        Ok(documents) => {
            if documents.is_empty() {
                println!("No users found.");
                return;
            }
            println!(
                "{:<38} {:<40} {:<10} {:<28}",
                "ID", "Email", "Verified", "Updated"
            );
            println!("{}", "-".repeat(116));
            for document in documents {
                let record = UserRecord::new(&document.data);
                println!(
                    "{:<38} {:<40} {:<10} {:<28}",
                    document.id,
                    record.email().unwrap_or("N/A"),
                    if record.verified() == Some(true) { "Yes" } else { "No" },
                    document.updated_at
                );
            }
        }
        Err(err) => fail(format!("Failed to list {}: {}", collection, err)),
    }
}

async fn show_document(store: &dyn DocumentStore, collection: &str, id: &str) {
    match store.get(collection, id).await {
        Ok(Some(document)) => match serde_json::to_string_pretty(&Value::Object(document)) {
            Ok(pretty) => println!("{}", pretty),
            Err(err) => fail(format!("Failed to render document: {}", err)),
        },
        Ok(None) => fail(format!("{}/{} not found", collection, id)),
        Err(err) => fail(format!("Failed to read {}/{}: {}", collection, id, err)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ActivatorConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    db::run_migrations(&pool).await?;

    let store = SqliteDocumentStore::new(pool);

    // Parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Pending { command } => match command {
            PendingCommands::Create { email, name, id } => {
                if !email.contains('@') {
                    fail(format!("Invalid email address: {}", email));
                }

                let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let mut fields: Document = Document::new();
                fields.insert("email".to_string(), json!(email));
                fields.insert("verified".to_string(), json!(false));
                if let Some(name) = name {
                    fields.insert("name".to_string(), json!(name));
                }

                match store
                    .create(
                        &config.pending_collection,
                        &id,
                        DocumentWrite::new(fields).with_server_timestamp("createdAt"),
                    )
                    .await
                {
                    Ok(_) => {
                        println!("✅ Pending user created successfully!");
                        println!("  ID: {}", id);
                        println!("  Email: {}", email);
                    }
                    Err(RepositoryError::AlreadyExists) => {
                        fail(format!("User '{}' already exists", id))
                    }
                    Err(err) => fail(format!("Failed to create user: {}", err)),
                }
            }

            PendingCommands::Verify { id } => {
                match store.get(&config.pending_collection, &id).await {
                    Ok(Some(document)) => {
                        if UserRecord::new(&document).verified() == Some(true) {
                            println!("ℹ️  User '{}' is already verified", id);
                            return Ok(());
                        }
                    }
                    Ok(None) => fail(format!("User '{}' not found", id)),
                    Err(err) => fail(format!("Failed to find user: {}", err)),
                }

                let mut fields = Document::new();
                fields.insert("verified".to_string(), json!(true));
                match store.update(&config.pending_collection, &id, fields).await {
                    Ok(_) => println!("✅ User '{}' marked as verified!", id),
                    Err(err) => fail(format!("Failed to verify user: {}", err)),
                }
            }

            PendingCommands::List { limit, offset } => {
                list_collection(&store, &config.pending_collection, limit, offset).await
            }

            PendingCommands::Show { id } => {
                show_document(&store, &config.pending_collection, &id).await
            }
        },

        Commands::Verified { command } => match command {
            VerifiedCommands::List { limit, offset } => {
                list_collection(&store, &config.verified_collection, limit, offset).await
            }

            VerifiedCommands::Show { id } => {
                show_document(&store, &config.verified_collection, &id).await
            }
        },
    }

    Ok(())
}
