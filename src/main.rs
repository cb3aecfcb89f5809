use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

pub mod app;
pub mod cloudformation;
pub mod config;
pub mod secrets;
pub mod stacks;
pub mod template;
pub mod writer;

#[derive(Parser)]
#[command(name = "book-management-infra")]
#[command(about = "Synthesize and deploy the Book Management API stacks", long_about = None)]
struct Cli {
    /// Optional YAML settings file; environment variables take precedence
    #[arg(long, env = "BOOK_MANAGEMENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// sops binary used to decrypt the secrets file
    #[arg(long, env = "SOPS_BIN", default_value = secrets::DEFAULT_SOPS_BIN, global = true)]
    sops_bin: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the stacks in deployment order
    List,
    /// Write every stack template and the assembly manifest
    Synth {
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,
    },
    /// Synthesize, then create or update the stacks in order. Templates stay in memory.
    Deploy {
        /// Only deploy these stacks (default: all)
        #[arg(long = "stack")]
        stacks: Vec<String>,
        /// Seconds between status checks
        #[arg(long, default_value = "10")]
        poll_seconds: u64,
    },
    /// Fetch the outputs of deployed stacks
    Outputs {
        /// Repeatable; with --json, a key published by several stacks keeps the last value
        #[arg(long = "stack", required = true)]
        stacks: Vec<String>,
        /// Write the merged outputs to this JSON file instead of printing them
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    return ExitCode::from(exit_status(run(cli).await));
}

/// Logs a failed run once and turns it into the process exit status.
fn exit_status(result: anyhow::Result<()>) -> u8 {
    if let Err(error) = result {
        tracing::error!(error = %format!("{:#}", error), "Aborting");
        return 1;
    }

    return 0;
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::List => {
            for id in stacks::StackId::ALL {
                println!("{}\t{}", id.name(), id.description());
            }
        }
        Commands::Synth { out } => {
            let app = synthesize(cli.config, &cli.sops_bin)?;
            writer::write_assembly(&out, &app)?;
        }
        Commands::Deploy {
            stacks: selected,
            poll_seconds,
        } => {
            let app = synthesize(cli.config, &cli.sops_bin)?;

            for name in &selected {
                if app.stack(name).is_none() {
                    anyhow::bail!("Unknown stack {}", name);
                }
            }

            let client = cloudformation::Client::new(
                &app.environment.region,
                Duration::from_secs(poll_seconds),
            )
            .await;
            for stack in app.stacks() {
                if !selected.is_empty() && !selected.contains(&stack.name) {
                    continue;
                }

                let outputs = client
                    .deploy(stack)
                    .await
                    .with_context(|| format!("Deploying {}", stack.name))?;
                for (key, value) in outputs {
                    println!("{}.{} = {}", stack.name, key, value);
                }
            }
        }
        Commands::Outputs { stacks, json } => {
            // Reading outputs needs a region, not a full deployable configuration.
            let mut settings = match &cli.config {
                Some(path) => config::parse(path)?,
                None => config::Settings::default(),
            };
            settings.apply_env(|key| std::env::var(key).ok());
            let region = settings
                .region
                .unwrap_or_else(|| config::DEFAULT_REGION.to_string());

            let client = cloudformation::Client::new(&region, Duration::from_secs(0)).await;
            let fetched = futures::future::try_join_all(
                stacks.iter().map(|stack_name| client.get_outputs(stack_name)),
            )
            .await?;

            match json {
                Some(path) => {
                    let merged = merge_outputs(stacks.iter().map(String::as_str).zip(fetched));
                    writer::write_outputs(&path, &merged)?;
                }
                None => {
                    for (stack_name, outputs) in stacks.iter().zip(fetched) {
                        for (key, value) in outputs {
                            println!("{}.{} = {}", stack_name, key, value);
                        }
                    }
                }
            }
        }
    }

    return Ok(());
}

/// Loads configuration, resolves secrets and builds every stack. Any failure here stops the
/// run before a single template is written.
fn synthesize(config_path: Option<PathBuf>, sops_bin: &str) -> anyhow::Result<app::App> {
    let config = config::load(config_path.as_deref(), |key| std::env::var(key).ok())
        .context("Loading configuration")?;

    let sops = secrets::Sops::new(sops_bin);
    let secrets = secrets::resolve(
        &sops,
        &config.secrets.file,
        config.secrets.sops_config.as_deref(),
    )
    .context("Resolving secrets")?;

    let app = stacks::synthesize(&config, &secrets)?;
    return Ok(app);
}

/// Flattens per-stack outputs into one map. When several stacks publish the same key, the
/// stack listed last wins and the collision is logged.
fn merge_outputs<'a, I>(outputs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, BTreeMap<String, String>)>,
{
    let mut merged = BTreeMap::new();
    let mut sources: BTreeMap<String, &str> = BTreeMap::new();
    for (stack_name, stack_outputs) in outputs {
        for (key, value) in stack_outputs {
            if let Some(previous) = sources.insert(key.clone(), stack_name) {
                tracing::warn!(
                    key = %key,
                    kept = %stack_name,
                    dropped = %previous,
                    "Output published by more than one stack"
                );
            }
            merged.insert(key, value);
        }
    }

    return merged;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{exit_status, merge_outputs};

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn failures_exit_non_zero() {
        assert_eq!(exit_status(Ok(())), 0);
        assert_eq!(exit_status(Err(anyhow::anyhow!("Deploying failed"))), 1);
    }

    #[test]
    fn later_stacks_win_output_collisions() {
        let merged = merge_outputs(vec![
            (
                "BookManagementStack",
                outputs(&[("LoadBalancerDNS", "alb"), ("Shared", "first")]),
            ),
            (
                "BookManagementApplicationStack",
                outputs(&[("ServiceURL", "https://alb"), ("Shared", "second")]),
            ),
        ]);

        assert_eq!(
            merged,
            outputs(&[
                ("LoadBalancerDNS", "alb"),
                ("ServiceURL", "https://alb"),
                ("Shared", "second"),
            ])
        );
    }
}
