//! Command-line demo of the streaming client.
//!
//! Run with: cargo run -p stream-cli -- --help
//!
//! The agent address and token come from `NOMAD_ADDR` / `NOMAD_TOKEN`.

mod drain;

use std::{collections::BTreeMap, io::Write as _, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use nomad_stream_client::{Client, Config, LogType, LogsRequest, Origin, QueryOptions, WriteOptions};
use nomad_stream_core::{ReadStatus, Topic};
use nomad_stream_exec::{ExecIo, ExecOptions, ExecRequest, ExecSession};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "nomad-stream", about = "Follow cluster streams", version, long_about = None)]
struct Cli {
    /// Agent address; overrides `NOMAD_ADDR`.
    #[arg(long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print cluster events as JSON lines.
    Events {
        /// `Topic` or `Topic:key`; repeatable. Defaults to every topic.
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Only events after this raft index.
        #[arg(long, default_value_t = 0)]
        index: u64,
    },
    /// Print a task's logs.
    Logs {
        alloc_id: String,
        task: String,
        #[arg(long)]
        stderr: bool,
        #[arg(short, long)]
        follow: bool,
        #[arg(long, value_enum, default_value_t = OriginArg::Start)]
        origin: OriginArg,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Run a command inside an allocation.
    Exec {
        alloc_id: String,
        task: String,
        /// Allocate a pseudo-terminal.
        #[arg(short = 't', long)]
        tty: bool,
        /// HTTP address of the node running the allocation; looked up when omitted.
        #[arg(long)]
        node_address: Option<String>,
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// PUT a JSON body, retrying on server errors.
    Put {
        path: String,
        body: String,
    },
    /// Watch a node drain and the allocations it moves.
    Drain { node_id: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OriginArg {
    Start,
    End,
}

impl From<OriginArg> for Origin {
    fn from(origin: OriginArg) -> Self {
        match origin {
            OriginArg::Start => Self::Start,
            OriginArg::End => Self::End,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(address) = cli.address {
        config = config.with_address(address);
    }
    let client = Client::new(config).context("invalid client configuration")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Events { topics, index } => events(&client, cancel, &topics, index).await,
        Command::Logs {
            alloc_id,
            task,
            stderr,
            follow,
            origin,
            offset,
        } => {
            let request = LogsRequest::new(task)
                .log_type(if stderr { LogType::Stderr } else { LogType::Stdout })
                .follow(follow)
                .from(origin.into(), offset);
            logs(&client, cancel, &alloc_id, &request).await
        }
        Command::Exec {
            alloc_id,
            task,
            tty,
            node_address,
            command,
        } => {
            let mut request = ExecRequest::new(alloc_id, task, command).tty(tty);
            request.node_address = node_address;
            let code = exec(&client, cancel, &request).await;
            std::process::exit(code);
        }
        Command::Put { path, body } => put(&client, cancel, &path, &body).await,
        Command::Drain { node_id } => {
            let monitor = drain::watch(&client, &cancel, &node_id);
            let mut messages = monitor.into_stream();
            while let Some(msg) = messages.next().await {
                println!("{msg}");
            }
            Ok(())
        }
    }
}

fn parse_topics(raw: &[String]) -> BTreeMap<Topic, Vec<String>> {
    let mut topics: BTreeMap<Topic, Vec<String>> = BTreeMap::new();
    if raw.is_empty() {
        topics.insert(Topic::All, Vec::new());
    }
    for entry in raw {
        let (topic, key) = match entry.split_once(':') {
            Some((topic, key)) => (topic, Some(key)),
            None => (entry.as_str(), None),
        };
        let Ok(topic) = topic.parse::<Topic>();
        let keys = topics.entry(topic).or_default();
        if let Some(key) = key.filter(|k| *k != "*") {
            keys.push(key.to_string());
        }
    }
    topics
}

async fn events(
    client: &Client,
    cancel: CancellationToken,
    topics: &[String],
    index: u64,
) -> Result<()> {
    let topics = parse_topics(topics);
    let mut rx = client
        .event_stream()
        .stream(cancel, &topics, index, &QueryOptions::default())
        .await
        .context("failed to subscribe to events")?;

    while let Some(batch) = rx.recv().await {
        let batch = batch?;
        for event in &batch.events {
            println!("{}", serde_json::to_string(event)?);
        }
    }
    Ok(())
}

async fn logs(
    client: &Client,
    cancel: CancellationToken,
    alloc_id: &str,
    request: &LogsRequest,
) -> Result<()> {
    let stream = client
        .fs()
        .logs(alloc_id, request, cancel, &QueryOptions::default())
        .await
        .context("failed to open log stream")?;
    let mut reader = stream.into_reader();
    reader.set_unblock_time(Duration::from_secs(1));

    let mut out = std::io::stdout();
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await? {
            ReadStatus::Read(n) => out.write_all(&buf[..n])?,
            ReadStatus::Idle => out.flush()?,
            ReadStatus::Eof => break,
        }
    }
    out.flush()?;
    Ok(())
}

async fn exec(client: &Client, cancel: CancellationToken, request: &ExecRequest) -> i32 {
    let session = ExecSession::new(ExecOptions::default());
    let io = ExecIo::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr());
    match session.start(client, request, io, cancel).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("exec failed: {err}");
            err.exit_code()
        }
    }
}

async fn put(client: &Client, cancel: CancellationToken, path: &str, body: &str) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(body).context("body is not valid JSON")?;
    if !path.starts_with('/') {
        bail!("path must start with '/'");
    }
    let (response, meta): (serde_json::Value, _) = client
        .retry_put(&cancel, path, &body, &WriteOptions::default())
        .await?;
    tracing::info!(index = meta.last_index, "write applied");
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
