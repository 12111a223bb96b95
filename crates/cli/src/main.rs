use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use mirra_core::{object_labels, Change, ChangeType, ResourceKey};
use mirra_kubehub::KubeTransport;
use mirra_ops::{ByteStream, FrameEncoding, LogOptions, PodLogSource};
use mirra_select::LabelSelector;
use mirra_sync::{Collection, Engine, EngineConfig, RequestOptions, WatchOptions};
use serde_json::Value;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirractl", version, about = "Mirra CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to scope requests to (default: all namespaces; logs use the context namespace)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects of a resource type once
    Ls {
        /// Resource, e.g. "pods", "apps/v1/deployments"
        resource: String,
        /// Label selector, e.g. "app=web,tier notin (db)"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Fetch a single object
    Get {
        resource: String,
        name: String,
    },
    /// Keep a resource mirrored and print +/~/- per change
    Watch {
        resource: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Re-list on a timer instead of streaming changes
        #[arg(long = "poll", action = ArgAction::SetTrue)]
        poll: bool,
        /// Poll interval in seconds (default: MIRRA_POLL_INTERVAL_MS or 5s)
        #[arg(long = "interval")]
        interval: Option<u64>,
    },
    /// Tail pod logs
    Logs {
        pod: String,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
        #[arg(long = "tail")]
        tail: Option<i64>,
        #[arg(short = 'f', long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_selector(s: Option<&str>) -> Result<LabelSelector> {
    match s {
        Some(s) => LabelSelector::from_str(s).with_context(|| format!("invalid selector {:?}", s)),
        None => Ok(LabelSelector::new()),
    }
}

fn print_value(output: Output, v: &Value) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
        Output::Human | Output::Yaml => print!("{}", serde_yaml::to_string(v)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let transport = KubeTransport::try_default().await?;
    let client = transport.client().clone();
    let engine = Engine::spawn(Arc::new(transport), EngineConfig::from_env());
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Ls { resource, selector } => {
            let sel = parse_selector(selector.as_deref())?;
            let key = ResourceKey::parse(&resource, ns)?;
            info!(key = %key, selector = %sel, "ls invoked");
            let coll = engine.list_async(&key).await?;
            let items = sel.select(coll.iter());
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
                    for obj in items.values() {
                        let meta = obj.get("metadata");
                        let ns_col = meta.and_then(|m| m.get("namespace")).and_then(Value::as_str).unwrap_or("-");
                        let name = meta.and_then(|m| m.get("name")).and_then(Value::as_str).unwrap_or("");
                        println!("{:<20} {:<40} {}", ns_col, name, render_age(obj));
                    }
                }
                _ => print_value(cli.output, &Value::Array(items.into_values().collect()))?,
            }
        }
        Commands::Get { resource, name } => {
            let key = ResourceKey::parse(&resource, ns)?;
            info!(key = %key, name = %name, "get invoked");
            let obj = engine.get(&key, &name, RequestOptions::quiet()).await?;
            print_value(cli.output, &obj)?;
        }
        Commands::Watch { resource, selector, poll, interval } => {
            let sel = parse_selector(selector.as_deref())?;
            let key = ResourceKey::parse(&resource, ns)?;
            let opts = if poll { WatchOptions::poll(interval.map(Duration::from_secs)) } else { WatchOptions::stream() };
            info!(key = %key, selector = %sel, mode = ?opts.mode(), "watch invoked");
            let output = cli.output;
            let handle = engine.watch(
                &key,
                Arc::new(move |coll: &Collection, change: Option<&Change>| match change {
                    None => {
                        let n = sel.select(coll.iter()).len();
                        println!("= {} objects", n);
                    }
                    Some(ch) if sel.matches_object(&ch.object) => print_change(output, ch),
                    Some(_) => {}
                }),
                opts,
            )?;
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            let state = engine.stream_state(&key).await;
            engine.unwatch(&handle);
            info!(key = %key, state = ?state, "watch stopped");
        }
        Commands::Logs { pod, container, tail, follow } => {
            let namespace = ns.map(str::to_string).unwrap_or_else(|| client.default_namespace().to_string());
            let opts = LogOptions { follow, tail_lines: tail, since_seconds: None, container };
            let stream = ByteStream::new(Arc::new(PodLogSource::new(client, &namespace, &pod, opts)), FrameEncoding::Raw);
            let done = Arc::new(Notify::new());
            stream.on_message(|line| println!("{}", String::from_utf8_lossy(line)));
            stream.on_error(|e| warn!(error = %e, "log stream error"));
            stream.on_close({
                let done = done.clone();
                move |clean| {
                    if !clean { eprintln!("log stream ended with an error"); }
                    done.notify_one();
                }
            });
            stream.start();
            tokio::select! {
                _ = done.notified() => {}
                _ = signal::ctrl_c() => {
                    info!(pod = %pod, "interrupted; closing log stream");
                    stream.stop_and_wait().await;
                }
            }
        }
    }
    Ok(())
}

fn print_change(output: Output, ch: &Change) {
    match output {
        Output::Human => {
            let sign = match ch.kind {
                ChangeType::Added => '+',
                ChangeType::Modified => '~',
                ChangeType::Deleted => '-',
            };
            let labels = object_labels(&ch.object).map(|l| l.len()).unwrap_or(0);
            println!("{} {} (labels: {})", sign, json_key(&ch.object), labels);
        }
        Output::Json => match serde_json::to_string(ch) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!(error = %e, "encode change"),
        },
        Output::Yaml => match serde_yaml::to_string(ch) {
            Ok(s) => print!("---\n{}", s),
            Err(e) => warn!(error = %e, "encode change"),
        },
    }
}

fn render_age(obj: &Value) -> String {
    let created = obj
        .pointer("/metadata/creationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - created.timestamp()).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn json_key(v: &Value) -> String {
    let meta = v.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
    if let Some(ns) = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()) {
        format!("{}/{}", ns, name)
    } else {
        name.to_string()
    }
}
