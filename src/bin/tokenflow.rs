use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenflow::compiler::loader::{load_definition_from_yaml, load_definitions_from_dir};
use tokenflow::runtime::model::JobState;
use tokenflow::runtime::redis_storage::RedisRecordStore;
use tokenflow::{Engine, EngineConfig, Variables};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process locally in memory until it waits for the outside world
    Run {
        /// Path to the process definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Execute jobs stored in Redis until Ctrl+C
    Worker {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Key prefix of the record store
        #[arg(long, default_value = "tokenflow")]
        prefix: String,

        /// Directory containing process definition YAML files
        #[arg(long)]
        definitions: PathBuf,

        /// Worker id used as job lock owner
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a process instance in Redis
    Start {
        /// Path to the process definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        #[arg(long, default_value = "tokenflow")]
        prefix: String,

        #[arg(long)]
        business_key: Option<String>,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Broadcast a signal to the instances stored in Redis
    Signal {
        /// Signal name
        name: String,

        /// Directory containing process definition YAML files
        #[arg(long)]
        definitions: PathBuf,

        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        #[arg(long, default_value = "tokenflow")]
        prefix: String,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Restrict delivery to one process instance
        #[arg(long)]
        instance: Option<uuid::Uuid>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_yaml_file(&path.to_string_lossy()),
        None => Ok(EngineConfig::default()),
    }
}

async fn redis_engine(config: EngineConfig, url: &str, prefix: &str) -> Result<Engine> {
    let store = RedisRecordStore::connect(url, prefix)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    Ok(Engine::builder().config(config).store(Arc::new(store)).build())
}

fn deploy_dir(engine: &Engine, dir: &Path) -> Result<()> {
    for definition in load_definitions_from_dir(dir)? {
        let key = definition.key.clone();
        match engine.deploy(definition) {
            Ok(deployed) => info!(definition_id = %deployed.id, "Deployed"),
            Err(e) => error!(key = %key, error = %e, "Failed to deploy"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { file, vars } => {
            info!("Running in standalone memory mode");
            let engine = Engine::builder().config(config).build();
            let deployed = engine.deploy(load_definition_from_yaml(&file)?)?;
            let variables: Variables = vars.into_iter().collect();
            let instance_id = engine.start_process(&deployed.definition.key, variables).await?;
            info!(instance_id = %instance_id, "Process started");

            let scheduler = engine.job_scheduler();
            loop {
                if scheduler.run_once().await? > 0 {
                    continue;
                }
                let pending = engine.jobs(Some(instance_id)).await?;
                if pending.iter().all(|j| j.state == JobState::Dead) {
                    break;
                }
                tokio::time::sleep(engine.config().poll_interval()).await;
            }

            let executions = engine.executions(instance_id).await?;
            if executions.is_empty() {
                info!(instance_id = %instance_id, "Process completed");
                return Ok(());
            }
            let variables = engine.get_variables(instance_id).await?;
            println!("variables:");
            for v in variables {
                println!("  {} = {}", v.name, v.value);
            }
            println!("open tasks:");
            for task in engine.tasks(instance_id).await? {
                println!("  {} {} ({:?})", task.id, task.name, task.status);
            }
        }

        Commands::Worker {
            redis,
            prefix,
            definitions,
            name,
        } => {
            let worker_id = name.unwrap_or_else(|| config.worker_id.clone());
            info!(worker_id = %worker_id, redis = %redis, "Starting worker");
            let engine = redis_engine(config, &redis, &prefix).await?;
            deploy_dir(&engine, &definitions)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });
            engine.job_scheduler_for(&worker_id).run(shutdown_rx).await;
        }

        Commands::Start {
            file,
            redis,
            prefix,
            business_key,
            vars,
        } => {
            let engine = redis_engine(config, &redis, &prefix).await?;
            let deployed = engine.deploy(load_definition_from_yaml(&file)?)?;
            let variables: Variables = vars.into_iter().collect();
            let key = &deployed.definition.key;
            let instance_id = match business_key {
                Some(bk) => engine.start_process_with_business_key(key, &bk, variables).await?,
                None => engine.start_process(key, variables).await?,
            };
            println!("{}", instance_id);
        }

        Commands::Signal {
            name,
            definitions,
            redis,
            prefix,
            payload,
            instance,
        } => {
            let engine = redis_engine(config, &redis, &prefix).await?;
            deploy_dir(&engine, &definitions)?;
            let payload = payload
                .map(|p| serde_json::from_str::<Value>(&p))
                .transpose()
                .context("Payload is not valid JSON")?;
            let delivery = engine.send_signal(&name, payload, instance).await?;
            println!("delivered: {}", delivery.delivered);
            for (subscription, e) in delivery.failures {
                println!("failed: {} ({})", subscription, e);
            }
        }
    }

    Ok(())
}
