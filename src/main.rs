use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};

use emailworker::binder::bind;
use emailworker::config::{
    Configuration, DEFAULT_CONFIG_PATH, DEFAULT_RABBITMQ_CONFIG_PATH, DRYRUN,
};
use emailworker::mailer;
use emailworker::publisher;
use emailworker::request::{EmailRequest, load_message_file};
use emailworker::worker::Worker;

/// Email worker: consumes email requests from RabbitMQ and sends them over SMTP.
#[derive(Debug, Parser)]
#[command(name = "emailworker", version)]
struct Cli {
    /// Override file with UPPERCASE keys.
    #[arg(long, env = "EMAILWORKER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Broker connection, credentials and queue binding.
    #[arg(
        long,
        env = "EMAILWORKER_RABBITMQ_CONFIG",
        default_value = DEFAULT_RABBITMQ_CONFIG_PATH
    )]
    rabbitmq_config: PathBuf,

    /// Log emails instead of sending them.
    #[arg(long)]
    dryrun: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker (default).
    Start,
    /// Publish a test email request to the queue.
    #[command(visible_alias = "send")]
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct PublishArgs {
    fromaddr: Option<String>,
    /// Comma-separated recipients.
    toaddrs: Option<String>,
    body: Option<String>,

    #[arg(long)]
    subject: Option<String>,

    /// TOML file with an [email] table to take the fields from.
    #[arg(long)]
    message: Option<PathBuf>,

    /// Publish N copies.
    #[arg(short = 'C', long, value_name = "N", default_value_t = 1)]
    count: u32,
}

impl PublishArgs {
    /// Message file fields first, then any given on the command line.
    fn into_arguments(self) -> anyhow::Result<Map<String, Value>> {
        let mut args = match &self.message {
            Some(path) => load_message_file(path)?,
            None => Map::new(),
        };

        let flags = [
            ("fromaddr", self.fromaddr),
            ("toaddrs", self.toaddrs),
            ("body", self.body),
            ("subject", self.subject),
        ];
        for (name, value) in flags {
            if let Some(value) = value {
                args.insert(name.to_string(), Value::String(value));
            }
        }
        Ok(args)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Configuration::assemble(
        Configuration::defaults(),
        Some(cli.config.as_path()),
        Some(cli.rabbitmq_config.as_path()),
    )
    .context("failed to load configuration")?;
    if cli.dryrun {
        config.insert(DRYRUN, true);
    }
    let config = config;

    // Initialize tracing
    let filter = config.log_filter()?.unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    for path in config.sources() {
        tracing::info!(path = %path.display(), "Loaded config layer");
    }
    tracing::debug!(keys = ?config.keys().collect::<Vec<_>>(), "Configuration assembled");

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start(&config).await,
        Command::Publish(args) => publish(&config, args).await,
    }
}

async fn start(config: &Configuration) -> anyhow::Result<()> {
    let broker = config.broker_settings()?;
    let smtp = config.smtp_settings()?;
    let mailer = mailer::from_settings(&smtp);

    let mut worker = Worker::new(smtp, mailer);
    worker
        .start(&broker, shutdown_signal())
        .await
        .context("worker stopped on a broker failure")?;
    Ok(())
}

async fn publish(config: &Configuration, args: PublishArgs) -> anyhow::Result<()> {
    let count = args.count;
    let request: EmailRequest = bind(args.into_arguments()?)?;
    let broker = config.broker_settings()?;

    publisher::publish(&broker, &request, count)
        .await
        .context("failed to publish email request")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
