//! Millrace service binary.
//!
//! Usage:
//!     millrace serve --db millrace.db --fabric-url https://fabric.example/api --envs TRN,PRD
//!     millrace refresh --env TRN [--full]
//!     millrace detect --env TRN [--detector <name>]
//!
//! `serve` runs the orchestrator, worker pool and bus listeners until
//! ctrl-c. `refresh` and `detect` are operator one-shots against a local
//! service database.

mod service;

use anyhow::Result;
use clap::{Parser, Subcommand};
use millrace_logging::{init_logging, LogConfig};
use service::{Service, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "millrace", about = "Snapshot refresh orchestrator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose console logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator service
    Serve {
        /// SQLite database path
        #[arg(long, default_value = "millrace.db")]
        db: String,

        /// Data Fabric base URL
        #[arg(long, env = "MILLRACE_FABRIC_URL")]
        fabric_url: String,

        /// Service-account bearer token
        #[arg(long, env = "MILLRACE_FABRIC_TOKEN", hide_env_values = true)]
        token: String,

        /// Environments to serve (comma-separated tags)
        #[arg(long, default_value = "TRN", value_delimiter = ',')]
        envs: Vec<String>,

        /// Batch workers per environment
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Request a snapshot refresh and wait for it to finish
    Refresh {
        #[arg(long, default_value = "millrace.db")]
        db: String,
        #[arg(long, env = "MILLRACE_FABRIC_URL")]
        fabric_url: String,
        #[arg(long, env = "MILLRACE_FABRIC_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        env: String,
        /// Ignore the high-water mark and reload every phase whole
        #[arg(long)]
        full: bool,
    },

    /// Run the detector suite against the current snapshot
    Detect {
        #[arg(long, default_value = "millrace.db")]
        db: String,
        #[arg(long, env = "MILLRACE_FABRIC_URL", default_value = "")]
        fabric_url: String,
        #[arg(long, env = "MILLRACE_FABRIC_TOKEN", hide_env_values = true, default_value = "")]
        token: String,
        #[arg(long)]
        env: String,
        /// Restrict to one detector (repeatable)
        #[arg(long = "detector")]
        detectors: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "millrace",
        verbose: args.verbose,
    })?;

    match args.command {
        Command::Serve {
            db,
            fabric_url,
            token,
            envs,
            workers,
        } => {
            let service = Service::start(ServiceConfig {
                db_path: db,
                fabric_url,
                fabric_token: token,
                envs,
                workers_per_env: workers,
            })
            .await?;
            service.run_until_shutdown().await
        }
        Command::Refresh {
            db,
            fabric_url,
            token,
            env,
            full,
        } => {
            let service = Service::start(ServiceConfig {
                db_path: db,
                fabric_url,
                fabric_token: token,
                envs: vec![env.clone()],
                workers_per_env: 4,
            })
            .await?;
            service.refresh_once(&env, full).await
        }
        Command::Detect {
            db,
            fabric_url,
            token,
            env,
            detectors,
        } => {
            let service = Service::start(ServiceConfig {
                db_path: db,
                fabric_url,
                fabric_token: token,
                envs: vec![env.clone()],
                workers_per_env: 1,
            })
            .await?;
            service.detect_once(&env, detectors).await
        }
    }
}
