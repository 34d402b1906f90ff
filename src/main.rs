//! runtime-storage -- inspect the resolved runtime config and move objects
//! through the configured storage provider.

use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use runtime_storage::config::{ConfigPaths, EnvVars};
use runtime_storage::storage::PutObjectOptions;
use runtime_storage::RuntimeContext;

/// Command-line arguments for the runtime-storage tool.
#[derive(Parser, Debug)]
#[command(
    name = "runtime-storage",
    version,
    about = "Layered runtime config and object storage"
)]
struct Cli {
    /// Project root the config directory is resolved against.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Override the directory holding the YAML fragments.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Print Prometheus metrics to stderr on exit.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved runtime config as JSON.
    Config {
        /// Resolve as if running on this host.
        #[arg(long)]
        host: Option<String>,
        /// Print only the value at this dotted path.
        #[arg(long)]
        path: Option<String>,
    },
    /// List object keys.
    Ls { prefix: Option<String> },
    /// Download an object.
    Get {
        key: String,
        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file.
    Put {
        key: String,
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        cache_control: Option<String>,
    },
    /// Delete an object.
    Rm { key: String },
    /// Print the public URL of a key.
    Url { key: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if cli.metrics {
        runtime_storage::metrics::init_metrics()?;
        runtime_storage::metrics::describe_metrics();
    }

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let mut paths = ConfigPaths::new(root);
    if let Some(dir) = cli.config_dir {
        paths = paths.with_config_dir(dir);
    }
    let ctx = RuntimeContext::new(paths);
    let env = EnvVars::from_process();

    let result = run(&ctx, &env, cli.command).await;

    if cli.metrics {
        if let Some(text) = runtime_storage::metrics::render() {
            eprintln!("{text}");
        }
    }
    result
}

async fn run(ctx: &RuntimeContext, env: &EnvVars, command: Command) -> anyhow::Result<()> {
    if let Command::Config { host, path } = &command {
        let config = ctx.runtime_config(env, host.as_deref());
        let value = match path {
            Some(path) => config
                .get(path)
                .cloned()
                .with_context(|| format!("no value at {path}"))?,
            None => config.to_value(),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let client = ctx.storage_client(env, None).await?;
    info!("Using {} storage", client.provider().label());

    match command {
        Command::Config { .. } => {}
        Command::Ls { prefix } => {
            for key in client.list_objects(prefix.as_deref()).await? {
                println!("{key}");
            }
        }
        Command::Get { key, output } => {
            let data = client.get_object(&key).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => {
                    use tokio::io::AsyncWriteExt;
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Put {
            key,
            file,
            content_type,
            cache_control,
        } => {
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut options = PutObjectOptions::default();
            if let Some(value) = content_type {
                options = options.content_type(value);
            }
            if let Some(value) = cache_control {
                options = options.cache_control(value);
            }
            let result = client.put_object(&key, Bytes::from(body), options).await?;
            match result.url {
                Some(url) => println!("{url}"),
                None => info!("Uploaded {}", key),
            }
        }
        Command::Rm { key } => {
            client.delete_object(&key).await?;
            info!("Deleted {}", key);
        }
        Command::Url { key } => match client.get_public_url(&key) {
            Some(url) => println!("{url}"),
            None => anyhow::bail!("{} has no public URL for {key}", client.provider().label()),
        },
    }
    Ok(())
}
