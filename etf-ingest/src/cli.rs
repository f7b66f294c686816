///
/// This module implements the CLI interface for etf-ingest: command parsing, argument
/// validation and the async entrypoint shared by `main` and the integration tests.
///
/// All fetching, storage and deployment planning lives in the `etf-ingest-core` crate.
/// This module is strictly glue: it builds real clients and runners and reports outcomes.
///
/// ## Commands
/// - `serve`: run the HTTP function server (what the deployed service executes).
/// - `ingest`: run the ingestion pipeline once from the terminal.
/// - `deploy`: validate the environment and deploy one of the functions with `gcloud`.
use crate::gcloud::GcloudRunner;
use crate::load_config::load_settings;
use crate::server::{self, AppState, ClientProvider, EnvClientProvider, FunctionTarget};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use etf_ingest_core::deploy::{
    deploy_from_env, DeployEnv, DeployError, DeployReport, DeployTarget, StepOutcome,
    HTTP_FUNCTION,
};
use etf_ingest_core::ingest::ingest_many;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI for etf-ingest: ingest Alpha Vantage ETF data into Cloud Storage.
#[derive(Parser)]
#[clap(
    name = "etf-ingest",
    version,
    about = "Fetch ETF profiles and holdings from Alpha Vantage into Cloud Storage"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the ingestion functions over HTTP
    Serve {
        /// Port to listen on
        #[clap(long, env = "PORT", default_value_t = 8080)]
        port: u16,
        /// Entry point served on `/` (etf_data_ingest or etf_data_ingest_scheduled)
        #[clap(long, env = "FUNCTION_TARGET", default_value = HTTP_FUNCTION)]
        target: String,
    },
    /// Ingest one or more symbols once and print the results as JSON
    Ingest {
        /// ETF symbol to ingest; repeat for several
        #[clap(long = "symbol", required = true)]
        symbols: Vec<String>,
        /// Only fetch the profile
        #[clap(long)]
        no_holdings: bool,
    },
    /// Deploy a function with gcloud
    Deploy {
        /// Deploy the scheduled variant (creates the trigger topic)
        #[clap(long)]
        scheduled: bool,
        /// Path to the YAML deployment settings
        #[clap(long)]
        config: Option<PathBuf>,
        /// Print the commands instead of running them
        #[clap(long)]
        dry_run: bool,
    },
}

/// Process exit status for an error returned by [`run`].
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<DeployError>()
        .map(DeployError::exit_code)
        .unwrap_or(1)
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Serve { port, target } => {
            let target: FunctionTarget = target.parse().map_err(anyhow::Error::msg)?;
            let state = Arc::new(AppState {
                clients: Arc::new(EnvClientProvider::default()),
                target,
            });
            server::serve(port, state).await
        }
        Commands::Ingest {
            symbols,
            no_holdings,
        } => {
            tracing::info!(command = "ingest", count = symbols.len(), "Starting ingestion");
            let clients = EnvClientProvider::default()
                .clients()
                .map_err(anyhow::Error::msg)?;
            let results = ingest_many(
                clients.source.as_ref(),
                clients.store.as_ref(),
                &symbols,
                !no_holdings,
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&results)?);

            let failed: Vec<&str> = results
                .iter()
                .filter(|r| !r.is_success())
                .map(|r| r.symbol.as_str())
                .collect();
            if failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("Ingestion failed for: {}", failed.join(", ")))
            }
        }
        Commands::Deploy {
            scheduled,
            config,
            dry_run,
        } => {
            let settings = load_settings(config)?;
            let target = if scheduled {
                DeployTarget::Scheduled
            } else {
                DeployTarget::Http
            };
            tracing::info!(command = "deploy", ?target, dry_run, "Starting deployment");

            if dry_run {
                let env = DeployEnv::from_env()?;
                let plan = target.plan(&env, &settings)?;
                println!("Deployment plan for {}:", plan.function);
                for line in plan.rendered_steps() {
                    println!("  {line}");
                }
                if let Some(example) = &plan.scheduler_example {
                    println!("Scheduler job (not created):\n  {example}");
                }
                return Ok(());
            }

            let report = tokio::task::spawn_blocking(move || {
                deploy_from_env(target, &settings, &GcloudRunner::from_env())
            })
            .await
            .context("deployment task panicked")??;
            print_report(&report);
            Ok(())
        }
    }
}

fn print_report(report: &DeployReport) {
    println!("Deployment complete: {} (service {})", report.function, report.service);
    for step in &report.steps {
        let outcome = match step.outcome {
            StepOutcome::Done => "done",
            StepOutcome::AlreadyExists => "already exists",
        };
        println!("  {}: {outcome}", step.description);
    }
    match &report.url {
        Some(url) => println!("Function URL: {url}"),
        None => println!("Function URL: unavailable (check `gcloud run services describe`)"),
    }
    if report.entry_point == HTTP_FUNCTION {
        if let Some(example) = report.usage_example() {
            println!("Try it:\n  {example}");
        }
    }
    if let Some(example) = &report.scheduler_example {
        println!("Create the scheduled trigger with:\n  {example}");
    }
}
