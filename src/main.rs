use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use ::tracing::{error, info_span};
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use fc_local::{
    config::LocalConfig,
    descriptor::{DebugConfig, DebugIde, Manifest},
    driver::{ContainerEngine, DockerEngine},
    service::{default_image_resolver, invoke_once, Service, StartOptions},
    tracing::setup_tracing,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve HTTP triggers and direct invocations until interrupted.
    Start {
        #[arg(short, long, value_name = "FILE", default_value = "template.yml")]
        manifest: PathBuf,
        #[arg(short = 'd', long)]
        debug_port: Option<u16>,
        #[arg(long, value_enum, default_value_t = DebugIde::None)]
        debug_ide: DebugIde,
        /// Function to attach the debugger to, `[service/]function`.
        #[arg(long)]
        debug_function: Option<String>,
        /// Start every function container before serving requests.
        #[arg(long)]
        eager: bool,
    },
    /// Invoke a function once and print its output.
    Invoke {
        /// `[service/]function`; defaults to the first function.
        name: Option<String>,
        #[arg(short, long, value_name = "FILE", default_value = "template.yml")]
        manifest: PathBuf,
        /// Event file, `-` for stdin.
        #[arg(short, long, value_name = "FILE")]
        event: Option<PathBuf>,
        #[arg(short = 'd', long)]
        debug_port: Option<u16>,
        #[arg(long, value_enum, default_value_t = DebugIde::None)]
        debug_ide: DebugIde,
    },
}

async fn read_event(event: Option<&Path>) -> Result<Bytes> {
    match event {
        None => Ok(Bytes::new()),
        Some(path) if path == Path::new("-") => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read event from stdin")?;
            Ok(Bytes::from(buf))
        }
        Some(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .with_context(|| format!("Failed to read event file {}", path.display())),
    }
}

fn debug_config(port: Option<u16>, ide: DebugIde) -> Option<DebugConfig> {
    port.map(|port| DebugConfig { port, ide })
}

async fn run(cli: Cli, config: LocalConfig) -> Result<()> {
    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::from_config(config.docker.address.as_deref())?);
    let images = default_image_resolver(&config);

    match cli.command {
        Command::Start {
            manifest,
            debug_port,
            debug_ide,
            debug_function,
            eager,
        } => {
            let manifest = Manifest::from_path(&manifest)?;
            let options = StartOptions {
                eager,
                debug: debug_config(debug_port, debug_ide),
                debug_function,
            };
            Service::new(config, manifest, engine, images, options)?
                .start()
                .await
        }
        Command::Invoke {
            name,
            manifest,
            event,
            debug_port,
            debug_ide,
        } => {
            let manifest = Manifest::from_path(&manifest)?;
            let name = match name {
                Some(name) => name,
                None => manifest
                    .first()
                    .map(|f| f.key().to_string())
                    .context("Manifest declares no functions")?,
            };
            let payload = read_event(event.as_deref()).await?;
            let debug = debug_config(debug_port, debug_ide);

            let response =
                invoke_once(&config, &manifest, engine, images, &name, payload, debug).await?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&response.body)?;
            stdout.flush()?;
            if response.status >= 400 {
                anyhow::bail!("function {name} failed with status {}", response.status);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LocalConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    setup_tracing(&config).inspect_err(|e| {
        eprintln!("Error setting up tracing: {e:?}");
    })?;

    let root_span = info_span!("fc-local", env = config.env);
    let _guard = root_span.enter();

    if let Err(err) = run(cli, config).await {
        error!("{:#}", err);
        return Err(err);
    }
    Ok(())
}
