mod handlers;
mod server;

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keylock_core::KeyDeriver;

use crate::handlers::DeriveRequest;
use crate::server::ServeOptions;

#[derive(Parser)]
#[command(
    name = "keylock",
    about = "keylock: lease-bounded key locks for idempotent operations",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the shared lock-store HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3100")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Storage backend: "memory" or "sqlite:<path>"
        #[arg(long, default_value = "memory", env = "KEYLOCK_STORAGE")]
        storage: String,

        /// Maximum requests processed at once
        #[arg(long, default_value = "1024", env = "KEYLOCK_MAX_CONCURRENCY")]
        max_concurrency: usize,
    },

    /// Derive the lock record for a `{call, config}` JSON document (stdin)
    Derive {
        /// Prefix prepended to the derived key
        #[arg(long, default_value = "", env = "KEYLOCK_KEY_PREFIX")]
        prefix: String,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            storage,
            max_concurrency,
        } => {
            let options = ServeOptions {
                host,
                port,
                storage,
                max_concurrency,
            };
            if let Err(e) = server::run(options).await {
                tracing::error!("Server error: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Derive { prefix } => {
            eprintln!("Reading {{call, config}} JSON from stdin...");
            let mut input = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut input) {
                eprintln!("Failed to read stdin: {}", e);
                return ExitCode::FAILURE;
            }
            match derive_record(&input, &prefix) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(2)
                }
            }
        }
        Commands::Version => {
            println!("keylock {}", env!("CARGO_PKG_VERSION"));
            println!("Lease-bounded key locks for idempotent operations");
            ExitCode::SUCCESS
        }
    }
}

fn derive_record(input: &str, prefix: &str) -> Result<String, String> {
    let request: DeriveRequest =
        serde_json::from_str(input).map_err(|e| format!("Invalid JSON input: {}", e))?;
    let record = KeyDeriver::with_prefix(prefix)
        .derive(&request.call, &request.config)
        .map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&record).map_err(|e| e.to_string())
}
