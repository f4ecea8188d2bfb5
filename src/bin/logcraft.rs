use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logcraft::anomaly::AnomalyEvent;
use logcraft::config::{self, Config};
use logcraft::gateway::{Gateway, GatewayStats};
use logcraft::multiline::EntryAssembler;
use logcraft::parser::ParseMode;
use logcraft::patterns::Template;
use logcraft::query::{EventFilter, TimeRange};
use logcraft::server;
use logcraft::summarize::{kind_counts, IncidentSummary};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logcraft", version, about = "AI-assisted log analysis")]
struct Cli {
    /// Config file (JSON). Missing file means defaults.
    #[arg(long, global = true, default_value = "~/.config/logcraft/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze files (or stdin) and print a JSON report
    Analyze {
        /// Input files (`-` for stdin)
        input: Vec<String>,
        /// Source tag for every line (defaults to the file name)
        #[arg(long)]
        source: Option<String>,
        /// auto | json_lines | plain_text
        #[arg(long)]
        mode: Option<ParseMode>,
        /// Lines handed to the pipeline per batch
        #[arg(long, default_value_t = 4096)]
        chunk_lines: usize,
        /// Only print the N most frequent templates
        #[arg(long)]
        top: Option<usize>,
    },
    /// Run the HTTP API
    Serve {
        /// host:port or port
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Serialize)]
struct Report {
    templates: Vec<Template>,
    events: Vec<AnomalyEvent>,
    event_kinds: BTreeMap<String, usize>,
    summaries: Vec<IncidentSummary>,
    stats: GatewayStats,
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn source_for(path: &str, explicit: Option<&str>) -> Option<String> {
    explicit.map(str::to_string).or_else(|| {
        (path != "-")
            .then(|| Path::new(path).file_stem().map(|s| s.to_string_lossy().into_owned()))
            .flatten()
    })
}

/// Feeds assembled entries from `reader` to `on_chunk` in bounded batches.
fn stream_entries<R: BufRead>(reader: R, chunk_lines: usize, mut on_chunk: impl FnMut(&[String])) -> io::Result<()> {
    let mut asm = EntryAssembler::default();
    let mut buf = Vec::with_capacity(chunk_lines);
    for line in reader.lines() {
        if let Some(entry) = asm.push(&line?) {
            buf.push(entry);
            if buf.len() >= chunk_lines {
                on_chunk(&buf);
                buf.clear();
            }
        }
    }
    buf.extend(asm.finish());
    if !buf.is_empty() {
        on_chunk(&buf);
    }
    Ok(())
}

fn analyze(
    mut cfg: Config,
    input: Vec<String>,
    source: Option<String>,
    mode: Option<ParseMode>,
    chunk_lines: usize,
    top: Option<usize>,
) -> Result<()> {
    if let Some(mode) = mode {
        cfg.ingest.mode = mode;
    }
    let gateway = Gateway::new(cfg).context("failed to start pipeline")?;
    let inputs = if input.is_empty() { vec!["-".to_string()] } else { input };
    let chunk_lines = chunk_lines.max(1);

    for path in &inputs {
        let tag = source_for(path, source.as_deref());
        let mut rejected = 0usize;
        let mut ingest = |chunk: &[String]| {
            rejected += gateway.ingest_batch(chunk, tag.as_deref()).rejected.len();
        };
        if path == "-" {
            stream_entries(io::stdin().lock(), chunk_lines, &mut ingest).context("failed to read stdin")?;
        } else {
            let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
            stream_entries(BufReader::with_capacity(1 << 20, file), chunk_lines, &mut ingest)
                .with_context(|| format!("failed to read {path}"))?;
        }
        if rejected > 0 {
            warn!(input = %path, rejected, "some lines could not be parsed");
        }
        info!(input = %path, "input processed");
    }

    gateway.flush();
    gateway.shutdown().context("pipeline shutdown failed")?;

    let events = gateway.query_events(TimeRange::all(), &EventFilter::default());
    let report = Report {
        templates: gateway.templates(top),
        event_kinds: kind_counts(&events).into_iter().map(|(k, n)| (k.to_string(), n)).collect(),
        events,
        summaries: gateway.query_summaries(TimeRange::all()),
        stats: gateway.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn serve(mut cfg: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config::apply_bind(&mut cfg, &bind)?;
    }
    let addr = format!("{}:{}", cfg.server.hostname, cfg.server.port);
    let gateway = Arc::new(Gateway::new(cfg).context("failed to start pipeline")?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        server::serve(Arc::clone(&gateway), listener, shutdown_signal()).await?;
        anyhow::Ok(())
    })?;

    gateway.shutdown().context("pipeline shutdown failed")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config).with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_logging(&cfg);

    match cli.command {
        Command::Analyze { input, source, mode, chunk_lines, top } => {
            analyze(cfg, input, source, mode, chunk_lines, top)
        }
        Command::Serve { bind } => serve(cfg, bind),
    }
}
