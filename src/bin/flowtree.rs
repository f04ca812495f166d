use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use flowtree::compiler::core::Compiler;
use flowtree::compiler::loader::{load_process_from_yaml, load_processes_from_dir};
use flowtree::handlers::HandlerRegistry;
use flowtree::runtime::config::{EngineConfig, load_config_from_yaml};
use flowtree::runtime::engine::Engine;
use flowtree::runtime::events::{EventKind, EventListener, LifecycleEvent};
use flowtree::runtime::redis_storage::{RedisJobScheduler, RedisTreeStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process locally in memory, printing lifecycle events as JSON lines
    Run {
        /// Process definition YAML files; called processes go here too
        #[arg(long = "file", short, required = true)]
        files: Vec<PathBuf>,

        /// Key of the process to start (defaults to the first file)
        #[arg(long, short)]
        process: Option<String>,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Complete user tasks and fire timers until the instance is quiescent
        #[arg(long)]
        auto_complete: bool,

        /// Engine configuration YAML file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check process definitions without running them
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fire due timers against the Redis backends until Ctrl+C
    Worker {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Worker Name (for logging)
        #[arg(long, default_value = "worker")]
        name: String,

        /// Directory containing process YAML files to deploy
        #[arg(long)]
        definitions: Option<PathBuf>,

        /// Engine configuration YAML file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `job_poll_interval_ms` from the config file
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Overrides `job_batch_size` from the config file
        #[arg(long)]
        batch_size: Option<usize>,

        /// Overrides `key_prefix` from the config file
        #[arg(long)]
        key_prefix: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => load_config_from_yaml(&path.to_string_lossy()),
        None => Ok(EngineConfig::default()),
    }
}

struct JsonLinesListener;

impl EventListener for JsonLinesListener {
    fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    }

    fn fail_on_exception(&self) -> bool {
        false
    }
}

// Upper bound on auto-complete rounds, so a looping process cannot spin forever.
const MAX_ROUNDS: usize = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            files,
            process,
            vars,
            auto_complete,
            config,
        } => {
            info!("Running in Standalone Memory Mode");
            let engine = Engine::with_config(load_config(config.as_ref())?);
            engine.add_listener(Arc::new(JsonLinesListener), EventKind::ALL);

            let mut first_key = None;
            for file in &files {
                let definition = load_process_from_yaml(file)?;
                let key = engine.deploy(definition)?;
                first_key.get_or_insert(key);
            }
            let key = process
                .or(first_key)
                .ok_or_else(|| anyhow!("No process definition given"))?;

            let initial_vars: HashMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start_process(&key, initial_vars).await?;
            info!("Process started: {}", instance_id);

            if auto_complete {
                for _ in 0..MAX_ROUNDS {
                    let mut progressed = false;
                    for task in engine.open_tasks(instance_id).await? {
                        info!(task = ?task.name, "Auto-completing task");
                        engine.complete_task(task.id, HashMap::new()).await?;
                        progressed = true;
                    }
                    for job in engine.timer_jobs(instance_id).await? {
                        info!(activity_id = %job.activity_id, "Firing timer");
                        engine.fire_timer(job.id).await?;
                        progressed = true;
                    }
                    if !progressed {
                        break;
                    }
                }
            }

            let snapshot = engine.snapshot(instance_id).await?;
            let finished = snapshot
                .executions
                .iter()
                .find(|e| e.id == instance_id)
                .is_some_and(|e| e.is_ended);
            if finished {
                info!("Process finished.");
            } else {
                warn!(open_tasks = snapshot.tasks.len(), "Process is waiting.");
            }
        }

        Commands::Validate { files } => {
            let registry = HandlerRegistry::with_builtins();
            let mut failures = 0;
            for file in &files {
                let result = load_process_from_yaml(file)
                    .and_then(|definition| Compiler::new().with_handlers(&registry).compile(definition));
                match result {
                    Ok(graph) => println!("{}: ok ({} nodes)", file.display(), graph.nodes.len()),
                    Err(e) => {
                        println!("{}: {:#}", file.display(), e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                return Err(anyhow!("{} of {} definitions are invalid", failures, files.len()));
            }
        }

        Commands::Worker {
            redis,
            name,
            definitions,
            config,
            poll_interval_ms,
            batch_size,
            key_prefix,
        } => {
            info!("[{}] Starting Worker... Redis: {}", name, redis);
            let mut config = load_config(config.as_ref())?;
            if let Some(ms) = poll_interval_ms {
                config.job_poll_interval_ms = ms;
            }
            if let Some(size) = batch_size {
                config.job_batch_size = size;
            }
            if let Some(prefix) = key_prefix {
                config.key_prefix = prefix;
            }
            let client = redis::Client::open(redis)?;
            let store = Arc::new(RedisTreeStore::new(client.clone(), &config.key_prefix));
            let scheduler = Arc::new(RedisJobScheduler::new(client, &config.key_prefix));
            let engine = Engine::new_with_storage(store, scheduler, config);

            if let Some(dir) = definitions {
                info!("Loading processes from: {:?}", dir);
                for definition in load_processes_from_dir(&dir)? {
                    let id = definition.id.clone();
                    match engine.deploy(definition) {
                        Ok(key) => info!("Loaded process: {}", key),
                        Err(e) => error!("Failed to deploy {}: {}", id, e),
                    }
                }
            }

            info!("[{}] Worker ready.", name);
            engine
                .run_worker(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                })
                .await;
        }
    }

    Ok(())
}
