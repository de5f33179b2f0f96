use std::{path::PathBuf, process, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use plumline::{
    broker::{Broker, memory::MemoryBroker},
    bundle::{BundleStore, FileBundleStore, InMemoryBundleStore},
    config::{ConfigManager, EnvConfigManager, TaskQueueConfig},
    logger::{LogConfig, LogLevel, init_tracing},
    process::{ProcessHost, ProcessRegistry},
    schema::write_schema,
    task::{CorrelationRegistry, ProcessLauncher, TaskMessage, TaskPublisher, TaskSubscriber},
};
use serde_json::Value;
use task_protocol::{Codec, JsonCodec};
use tokio::time::timeout;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "plumline",
    about = "Checkpointable processes over a task queue",
    version
)]
struct Cli {
    /// Log level: error, warn, info, debug or trace
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,

    /// Write logs into this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Read configuration from this .env file before the environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a process through an in-process task queue and print its result
    Demo(DemoArgs),

    /// List the registered process classes
    Classes,

    /// Emit JSON-Schema for tasks, responses, bundles and process specs
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Process class to launch
    #[arg(long, default_value = "dummy_with_output")]
    class: String,

    /// Positional arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,

    /// Keyword arguments as a JSON object
    #[arg(long, default_value = "{}")]
    kwargs: String,

    /// Only create and checkpoint the process; report its pid
    #[arg(long)]
    no_play: bool,

    /// After a --no-play launch, continue the process by pid
    #[arg(long, requires = "no_play")]
    resume: bool,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Print results as YAML
    #[arg(long)]
    yaml: bool,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guards = init_tracing(&LogConfig::new(cli.log_level, cli.log_dir.clone()))?;

    match cli.command {
        Commands::Demo(args) => {
            let config_mgr = ConfigManager(EnvConfigManager::new(cli.env_file));
            let config = TaskQueueConfig::from_config(&config_mgr).await;
            if let Err(err) = demo(args, config).await {
                error!("demo failed: {err:#}");
                eprintln!("Error: {err:#}");
                process::exit(1);
            }
            Ok(())
        }
        Commands::Classes => {
            let registry = ProcessRegistry::with_builtins();
            for id in registry.list() {
                if let Some(class) = registry.get(&id) {
                    println!("{id:<24} {}", class.description());
                }
            }
            Ok(())
        }
        Commands::Schema(args) => {
            let written = write_schema(&args.out, &ProcessRegistry::with_builtins())?;
            println!("{} schemas written to {}", written.len(), args.out.display());
            Ok(())
        }
    }
}

async fn demo(args: DemoArgs, config: TaskQueueConfig) -> anyhow::Result<()> {
    let positional: Vec<Value> = serde_json::from_str(&args.args).context("--args must be a JSON array")?;
    let kwargs: Value = serde_json::from_str(&args.kwargs).context("--kwargs must be a JSON object")?;
    let wait_for = Duration::from_secs(args.timeout);

    let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
    let store: Arc<dyn BundleStore> = match &config.bundle_dir {
        Some(dir) => FileBundleStore::new(dir.clone(), codec.clone())?,
        None => InMemoryBundleStore::new(),
    };
    let host = ProcessHost::with_store(ProcessRegistry::with_builtins(), store, false);
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

    let subscriber = TaskSubscriber::new(broker.clone(), codec.clone(), &config);
    subscriber.add_task_receiver(Arc::new(ProcessLauncher::new(host.clone())));
    subscriber.start().await?;
    let publisher = TaskPublisher::new(broker, codec, &config, CorrelationRegistry::new()).await?;
    info!(class = %args.class, play = !args.no_play, "sending launch task");

    let launch = TaskMessage::create_launch(&args.class, positional, kwargs, !args.no_play)?;
    let response = match timeout(wait_for, launch.send(&publisher).await?.wait()).await {
        Ok(result) => result?,
        Err(_) => bail!("no response to the launch task within {}s", args.timeout),
    };
    print_value(&response, args.yaml)?;

    if args.resume {
        let Some(pid) = response.get("pid").and_then(Value::as_str) else {
            bail!("launch response carries no pid");
        };
        let cont = TaskMessage::create_continue(pid, None, true)?;
        match timeout(wait_for, cont.send(&publisher).await?.wait()).await {
            Ok(result) => print_value(&result?, args.yaml)?,
            Err(_) => bail!("process {pid} did not finish within {}s", args.timeout),
        }
    }

    publisher.close().await;
    subscriber.stop().await?;
    Ok(())
}

fn print_value(value: &Value, yaml: bool) -> anyhow::Result<()> {
    if yaml {
        print!("{}", serde_yaml_bw::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
