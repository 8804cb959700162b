mod config;
mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use multilog_k8s::{KubeClient, KubeSource};
use multilog_logs::{LogBuffer, LogSession, Presenter, StreamAggregator, build_tree};
use multilog_types::LogEntry;

use crate::config::{FileConfig, Settings};
use crate::console::{ConsolePresenter, print_tree};

/// multilog - follow and search logs across many Kubernetes pods at once
#[derive(Parser, Debug)]
#[command(name = "multilog")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the kubeconfig file (defaults to $KUBECONFIG or ~/.kube/config)
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes contexts to follow, comma separated (defaults to the current context)
    #[arg(long, value_delimiter = ',')]
    context: Vec<String>,

    /// Namespaces to follow, comma separated (defaults to all namespaces)
    #[arg(short, long, value_delimiter = ',')]
    namespace: Vec<String>,

    /// Label selector; repeat to follow pods matching any of them
    #[arg(short = 'l', long)]
    selector: Vec<String>,

    /// Containers to follow, comma separated (defaults to all containers)
    #[arg(short, long, value_delimiter = ',')]
    container: Vec<String>,

    /// Number of historical log lines to fetch per container [default: 100]
    #[arg(long)]
    tail: Option<i64>,

    /// Read logs of the previous container instance
    #[arg(long)]
    previous: bool,

    /// Only show lines written after startup
    #[arg(long, conflicts_with = "tail")]
    live: bool,

    /// Maximum number of lines kept for searching [default: 10000]
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Highlight matches of this term
    #[arg(long)]
    search: Option<String>,

    /// Match the search term case-sensitively
    #[arg(long)]
    case_sensitive: bool,

    /// Only match the search term as a whole word
    #[arg(long)]
    whole_word: bool,

    /// Treat the search term as a regular expression
    #[arg(long)]
    regex: bool,

    /// Log filter for diagnostics on stderr (overridden by RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// TOML file with default settings
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the namespace/pod/container tree and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(&args, file)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&settings.log_level))
                .context("invalid log level")?,
        )
        .with_writer(std::io::stderr)
        .init();

    let kube_client =
        KubeClient::new(settings.kubeconfig.as_deref()).context("failed to load kubeconfig")?;
    let contexts = if settings.contexts.is_empty() {
        let current = kube_client
            .current_context()
            .context("kubeconfig has no current context; pass --context")?;
        vec![current.to_string()]
    } else {
        settings.contexts.clone()
    };

    let mut sources = Vec::with_capacity(contexts.len());
    for name in contexts {
        let client = kube_client
            .client_for_context(&name)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to context '{}' (available: {})",
                    name,
                    kube_client.contexts().join(", ")
                )
            })?;
        sources.push((name, Arc::new(KubeSource::new(client))));
    }

    if settings.list {
        for (name, source) in &sources {
            let tree = build_tree(
                source.as_ref(),
                &settings.aggregator.namespaces,
                &settings.aggregator.selectors,
            )
            .await
            .with_context(|| format!("failed to list resources in context '{}'", name))?;
            print_tree(name, &tree)?;
        }
        return Ok(());
    }

    follow(settings, sources).await
}

/// Follow every context until Ctrl-C, feeding one shared session
async fn follow(settings: Settings, sources: Vec<(String, Arc<KubeSource>)>) -> Result<()> {
    let presenter: Arc<dyn Presenter> = Arc::new(ConsolePresenter::new());
    let root = CancellationToken::new();

    let mut session = LogSession::new(LogBuffer::new(settings.buffer_size), Arc::clone(&presenter));
    session.set_options(settings.search_options)?;
    if let Some(term) = &settings.search {
        session.search(term).context("invalid --search term")?;
    }

    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let mut handles = Vec::with_capacity(sources.len());
    let mut receivers = Vec::with_capacity(sources.len());
    for (name, source) in sources {
        let aggregator =
            StreamAggregator::new(source, settings.aggregator.clone(), Arc::clone(&presenter));
        let (rx, handle) = aggregator.start(root.clone());
        info!(context = %name, started_at = %handle.started_at(), "following logs");
        receivers.push(rx);
        handles.push((name, handle));
    }

    let entries = merge(receivers, settings.aggregator.channel_capacity);
    let total = session.run(entries).await;
    info!(total, "all log streams closed");

    let context_count = handles.len();
    let mut failures = Vec::new();
    for (name, handle) in handles {
        if let Err(e) = handle.join().await {
            warn!(context = %name, error = %e, "aggregator failed");
            failures.push(format!("{}: {}", name, e));
        }
    }

    // Partial failures were already reported as status
    if !failures.is_empty() && failures.len() == context_count {
        bail!("{}", failures.join("; "));
    }
    Ok(())
}

/// Fan several aggregator channels into one. A single channel is passed
/// through untouched.
fn merge(mut receivers: Vec<mpsc::Receiver<LogEntry>>, capacity: usize) -> mpsc::Receiver<LogEntry> {
    if receivers.len() == 1 {
        if let Some(rx) = receivers.pop() {
            return rx;
        }
    }

    let (tx, rx) = mpsc::channel(capacity.max(1));
    for mut receiver in receivers {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if tx.send(entry).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}
