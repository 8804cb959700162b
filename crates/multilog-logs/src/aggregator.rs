//! Fan-in of many container log streams into one bounded channel
//!
//! A supervisor task resolves namespaces, runs one discovery loop per
//! namespace and one worker per discovered container. Every task is tracked;
//! on cancellation the supervisor waits for all of them before the last
//! sender goes away, so the receiver sees the channel close exactly once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use multilog_k8s::{LogRequest, LogSource, LogStream, SourceError};
use multilog_types::{
    ContainerNode, FollowFrom, LogEntry, NamespaceNode, PodNode, ResourceTree, StreamTarget,
};

use crate::parser::LogParser;
use crate::presenter::Presenter;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// How much history a session starts with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Replay the last N lines of every container found at startup
    Tail(i64),
    /// Only entries emitted after the session started
    LiveTail,
}

impl Default for SessionMode {
    fn default() -> Self {
        Self::Tail(DEFAULT_TAIL_LINES)
    }
}

/// What to follow and how
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Namespaces to watch; empty means every namespace
    pub namespaces: Vec<String>,

    /// Label selectors; pods matching any of them are followed. Empty means
    /// every pod.
    pub selectors: Vec<String>,

    /// Container names to follow; empty means every container
    pub containers: Vec<String>,

    pub mode: SessionMode,

    /// Read the previous instance of each container
    pub previous: bool,

    pub discovery_interval: Duration,
    pub retry_backoff: Duration,
    pub channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            selectors: Vec::new(),
            containers: Vec::new(),
            mode: SessionMode::default(),
            previous: false,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Lifecycle of a per-target worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Starting,
    Streaming,
    Retrying,
    Stopped,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no pods found matching the provided selectors in any namespace")]
    NoPodsFound,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("aggregator task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Targets with a live worker, keyed by target
#[derive(Clone, Default)]
struct TargetRegistry {
    workers: Arc<RwLock<HashMap<StreamTarget, WorkerState>>>,
}

impl TargetRegistry {
    /// Reserve a target for a new worker. False if one is already running.
    fn claim(&self, target: &StreamTarget) -> bool {
        let mut workers = self.workers.write();
        if workers.contains_key(target) {
            return false;
        }
        workers.insert(target.clone(), WorkerState::Starting);
        true
    }

    fn set(&self, target: &StreamTarget, state: WorkerState) {
        if let Some(current) = self.workers.write().get_mut(target) {
            *current = state;
        }
    }

    fn release(&self, target: &StreamTarget) {
        self.workers.write().remove(target);
    }

    fn snapshot(&self) -> Vec<(StreamTarget, WorkerState)> {
        let mut targets: Vec<_> = self
            .workers
            .read()
            .iter()
            .map(|(target, state)| (target.clone(), *state))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }
}

/// Control side of a running aggregator
pub struct AggregatorHandle {
    cancel: CancellationToken,
    registry: TargetRegistry,
    started_at: DateTime<Utc>,
    task: JoinHandle<Result<(), AggregateError>>,
}

impl AggregatorHandle {
    /// Request shutdown. The delivery channel closes once every worker exits.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Followed targets and their worker states, sorted by target
    pub fn targets(&self) -> Vec<(StreamTarget, WorkerState)> {
        self.registry.snapshot()
    }

    /// Instant the session started; live tail drops entries up to it
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait for the supervisor to finish (after cancellation or a fatal
    /// discovery error)
    pub async fn join(self) -> Result<(), AggregateError> {
        self.task.await?
    }
}

/// Merges the logs of every matching container into one channel
pub struct StreamAggregator<S> {
    source: Arc<S>,
    config: AggregatorConfig,
    presenter: Arc<dyn Presenter>,
}

impl<S: LogSource> StreamAggregator<S> {
    pub fn new(source: Arc<S>, config: AggregatorConfig, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            source,
            config,
            presenter,
        }
    }

    /// Start discovery and streaming. Entries arrive on the returned
    /// receiver until `parent` (or the handle) is cancelled and all workers
    /// have stopped.
    pub fn start(self, parent: CancellationToken) -> (mpsc::Receiver<LogEntry>, AggregatorHandle) {
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let registry = TargetRegistry::default();
        let started_at = Utc::now();

        let shared = Arc::new(Shared {
            source: self.source,
            config: self.config,
            presenter: self.presenter,
            registry: registry.clone(),
            tracker: TaskTracker::new(),
            tx,
            cancel: cancel.clone(),
            started_at,
            reported_missing: Mutex::new(HashSet::new()),
            failing_namespaces: Mutex::new(HashSet::new()),
        });

        let task = tokio::spawn(supervise(shared));

        let handle = AggregatorHandle {
            cancel,
            registry,
            started_at,
            task,
        };
        (rx, handle)
    }
}

/// State shared by the supervisor, discovery loops and workers. Holds the
/// only original sender; it is dropped with the last clone of this struct.
struct Shared<S> {
    source: Arc<S>,
    config: AggregatorConfig,
    presenter: Arc<dyn Presenter>,
    registry: TargetRegistry,
    tracker: TaskTracker,
    tx: mpsc::Sender<LogEntry>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    reported_missing: Mutex<HashSet<StreamTarget>>,
    /// Namespaces whose last pod listing failed and was already reported
    failing_namespaces: Mutex<HashSet<String>>,
}

impl<S: LogSource> Shared<S> {
    /// Cursor for a newly discovered target
    fn start_cursor(&self, initial: bool) -> FollowFrom {
        match self.config.mode {
            SessionMode::Tail(lines) if initial => FollowFrom::Tail(lines),
            _ => FollowFrom::Since(self.started_at),
        }
    }

    /// Containers of `pod` to follow, reporting requested names it lacks
    fn select_containers(&self, namespace: &str, pod: &str, available: Vec<String>) -> Vec<String> {
        if self.config.containers.is_empty() {
            return available;
        }

        let mut selected = Vec::new();
        for wanted in &self.config.containers {
            if available.contains(wanted) {
                selected.push(wanted.clone());
                continue;
            }
            let missing = StreamTarget::new(namespace, pod, wanted.as_str());
            if self.reported_missing.lock().insert(missing) {
                warn!(namespace, pod, container = %wanted, "container not found in pod");
                self.presenter.on_status(
                    &format!("Container {} not found in pod {}/{}", wanted, namespace, pod),
                    true,
                );
            }
        }
        selected
    }
}

async fn supervise<S: LogSource>(shared: Arc<Shared<S>>) -> Result<(), AggregateError> {
    let result = run(&shared).await;
    if let Err(e) = &result {
        warn!(error = %e, "aggregator stopping");
        shared.cancel.cancel();
    }

    shared.tracker.close();
    shared.tracker.wait().await;
    debug!("all stream workers stopped, closing delivery channel");

    result
}

async fn run<S: LogSource>(shared: &Arc<Shared<S>>) -> Result<(), AggregateError> {
    let namespaces = if shared.config.namespaces.is_empty() {
        tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            listed = shared.source.list_namespaces() => listed?,
        }
    } else {
        shared.config.namespaces.clone()
    };

    let mut pods_found = 0;
    for namespace in &namespaces {
        tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            found = discover(shared, namespace, true) => pods_found += found,
        }
    }

    if pods_found == 0 {
        shared
            .presenter
            .on_status("No pods found matching the provided selectors", true);
        return Err(AggregateError::NoPodsFound);
    }

    info!(
        pods = pods_found,
        namespaces = namespaces.len(),
        "initial discovery complete"
    );
    shared.presenter.on_status(
        &format!(
            "Following {} pod(s) across {} namespace(s)",
            pods_found,
            namespaces.len()
        ),
        false,
    );

    for namespace in namespaces {
        let loop_shared = Arc::clone(shared);
        shared
            .tracker
            .spawn(async move { discovery_loop(loop_shared, namespace).await });
    }

    shared.cancel.cancelled().await;
    Ok(())
}

/// Poll a namespace for new pods until cancelled
async fn discovery_loop<S: LogSource>(shared: Arc<Shared<S>>, namespace: String) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.config.discovery_interval) => {}
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = discover(&shared, &namespace, false) => {}
        }
    }
    debug!(namespace = %namespace, "discovery loop stopped");
}

/// List matching pods in `namespace` and start a worker for every new
/// container. Returns the number of matching pods.
async fn discover<S: LogSource>(shared: &Arc<Shared<S>>, namespace: &str, initial: bool) -> usize {
    let selectors: Vec<Option<&str>> = if shared.config.selectors.is_empty() {
        vec![None]
    } else {
        shared.config.selectors.iter().map(|s| Some(s.as_str())).collect()
    };

    let mut pods = BTreeSet::new();
    let mut failed = false;
    for selector in selectors {
        match shared.source.list_pods(namespace, selector).await {
            Ok(names) => pods.extend(names),
            Err(e) => {
                failed = true;
                if shared.failing_namespaces.lock().insert(namespace.to_string()) {
                    warn!(namespace, selector, error = %e, "pod discovery failed");
                    shared.presenter.on_status(
                        &format!("Error fetching pods for namespace {}: {}", namespace, e),
                        true,
                    );
                } else {
                    debug!(namespace, selector, error = %e, "pod discovery still failing");
                }
            }
        }
    }
    if !failed && shared.failing_namespaces.lock().remove(namespace) {
        info!(namespace, "pod discovery recovered");
    }

    for pod in &pods {
        let containers = match shared.source.list_containers(namespace, pod).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(namespace, pod = %pod, error = %e, "container listing failed");
                continue;
            }
        };

        for container in shared.select_containers(namespace, pod, containers) {
            let target = StreamTarget::new(namespace, pod.as_str(), container);
            if !shared.registry.claim(&target) {
                continue;
            }

            info!(stream = %target, "starting log stream");
            let worker = Worker::new(Arc::clone(shared), target, shared.start_cursor(initial));
            shared.tracker.spawn(worker.run());
        }
    }

    pods.len()
}

/// Follows one target, reconnecting after transient failures
struct Worker<S> {
    shared: Arc<Shared<S>>,
    target: StreamTarget,
    from: FollowFrom,
    stream: Option<LogStream>,

    /// Timestamp of the newest entry handed to the channel
    last_delivered: Option<DateTime<Utc>>,

    /// Entries at or before this instant were already delivered
    resume_after: Option<DateTime<Utc>>,
}

impl<S: LogSource> Worker<S> {
    fn new(shared: Arc<Shared<S>>, target: StreamTarget, from: FollowFrom) -> Self {
        Self {
            shared,
            target,
            from,
            stream: None,
            last_delivered: None,
            resume_after: None,
        }
    }

    async fn run(mut self) {
        let mut state = WorkerState::Starting;
        loop {
            self.shared.registry.set(&self.target, state);
            debug!(stream = %self.target, ?state, "worker state");

            state = match state {
                WorkerState::Starting => self.open().await,
                WorkerState::Streaming => match self.stream.take() {
                    Some(stream) => self.pump(stream).await,
                    None => WorkerState::Retrying,
                },
                WorkerState::Retrying => self.backoff().await,
                WorkerState::Stopped => break,
            };
        }

        self.shared.registry.release(&self.target);
        debug!(stream = %self.target, "worker stopped");
    }

    async fn open(&mut self) -> WorkerState {
        let request = LogRequest {
            follow: true,
            since_seconds: self.from.since_seconds(Utc::now()),
            tail_lines: self.from.tail_lines(),
            previous: self.shared.config.previous,
        };

        let opened = tokio::select! {
            _ = self.shared.cancel.cancelled() => return WorkerState::Stopped,
            opened = self.shared.source.stream_logs(&self.target, &request) => opened,
        };

        match opened {
            Ok(stream) => {
                self.stream = Some(stream);
                WorkerState::Streaming
            }
            Err(e) if e.is_not_found() => {
                info!(stream = %self.target, error = %e, "target gone, not retrying");
                self.shared
                    .presenter
                    .on_status(&format!("Stopped following {}: {}", self.target, e), true);
                WorkerState::Stopped
            }
            Err(e) => {
                warn!(stream = %self.target, error = %e, "failed to open log stream");
                self.shared.presenter.on_status(
                    &format!("Error streaming {}: {}; retrying", self.target, e),
                    true,
                );
                WorkerState::Retrying
            }
        }
    }

    async fn pump(&mut self, stream: LogStream) -> WorkerState {
        let LogStream { snapshot, mut lines } = stream;
        for line in snapshot.lines().filter(|l| !l.is_empty()) {
            if let Some(next) = self.deliver(line).await {
                return next;
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return WorkerState::Stopped,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    if let Some(next) = self.deliver(&line).await {
                        return next;
                    }
                }
                Some(Err(e)) => {
                    warn!(stream = %self.target, error = %e, "log stream failed");
                    self.shared.presenter.on_status(
                        &format!("Error streaming {}: {}; retrying", self.target, e),
                        true,
                    );
                    return WorkerState::Retrying;
                }
                None => {
                    debug!(stream = %self.target, "log stream ended");
                    return WorkerState::Retrying;
                }
            }
        }
    }

    /// Parse and send one line. Returns the next state if the worker must
    /// leave `Streaming`.
    async fn deliver(&mut self, raw: &str) -> Option<WorkerState> {
        let entry = LogParser::parse(raw, &self.target, Utc::now());

        if self.shared.config.mode == SessionMode::LiveTail
            && entry.timestamp <= self.shared.started_at
        {
            return None;
        }
        if self.resume_after.is_some_and(|after| entry.timestamp <= after) {
            return None;
        }

        let timestamp = entry.timestamp;
        tokio::select! {
            biased;
            sent = self.shared.tx.send(entry) => match sent {
                Ok(()) => {
                    self.last_delivered = Some(timestamp);
                    None
                }
                Err(_) => {
                    debug!(stream = %self.target, "delivery channel closed");
                    Some(WorkerState::Stopped)
                }
            },
            _ = self.shared.cancel.cancelled() => Some(WorkerState::Stopped),
        }
    }

    async fn backoff(&mut self) -> WorkerState {
        if let Some(last) = self.last_delivered {
            self.from = FollowFrom::Since(last);
            self.resume_after = Some(last);
        }

        tokio::select! {
            _ = self.shared.cancel.cancelled() => WorkerState::Stopped,
            _ = tokio::time::sleep(self.shared.config.retry_backoff) => WorkerState::Starting,
        }
    }
}

/// Enumerate namespaces, pods and containers into a [`ResourceTree`].
///
/// An empty `namespaces` lists every namespace. With selectors, a pod is
/// included when it matches any of them.
pub async fn build_tree<S: LogSource + ?Sized>(
    source: &S,
    namespaces: &[String],
    selectors: &[String],
) -> Result<ResourceTree, SourceError> {
    let names = if namespaces.is_empty() {
        source.list_namespaces().await?
    } else {
        namespaces.to_vec()
    };

    let mut tree = ResourceTree::default();
    for namespace in names {
        let mut pods = BTreeSet::new();
        if selectors.is_empty() {
            pods.extend(source.list_pods(&namespace, None).await?);
        }
        for selector in selectors {
            pods.extend(source.list_pods(&namespace, Some(selector)).await?);
        }

        let mut node = NamespaceNode {
            name: namespace.clone(),
            pods: Vec::new(),
        };
        for pod in pods {
            let containers = source
                .list_containers(&namespace, &pod)
                .await?
                .into_iter()
                .map(|container| ContainerNode {
                    target: StreamTarget::new(namespace.as_str(), pod.as_str(), container),
                })
                .collect();
            node.pods.push(PodNode {
                name: pod,
                namespace: namespace.clone(),
                containers,
            });
        }

        tree.namespaces.push(node);
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Attempt, FakeSource, RecordingPresenter};
    use chrono::SecondsFormat;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> AggregatorConfig {
        AggregatorConfig {
            namespaces: vec!["prod".to_string()],
            mode: SessionMode::Tail(10),
            discovery_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn stamped(ts: DateTime<Utc>, message: &str) -> String {
        format!("{} {}", ts.to_rfc3339_opts(SecondsFormat::Nanos, true), message)
    }

    async fn recv(rx: &mut mpsc::Receiver<LogEntry>) -> LogEntry {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for entry")
            .expect("channel closed early")
    }

    /// Cancel, then drain until the channel closes
    async fn shutdown(
        mut rx: mpsc::Receiver<LogEntry>,
        handle: AggregatorHandle,
    ) -> (Vec<LogEntry>, Result<(), AggregateError>) {
        handle.cancel();
        let mut rest = Vec::new();
        loop {
            match timeout(WAIT, rx.recv()).await.expect("channel never closed") {
                Some(entry) => rest.push(entry),
                None => break,
            }
        }
        assert!(rx.recv().await.is_none());
        let joined = timeout(WAIT, handle.join()).await.expect("join hung");
        (rest, joined)
    }

    fn start(
        source: &Arc<FakeSource>,
        config: AggregatorConfig,
    ) -> (
        mpsc::Receiver<LogEntry>,
        AggregatorHandle,
        Arc<RecordingPresenter>,
    ) {
        let presenter = Arc::new(RecordingPresenter::default());
        let aggregator = StreamAggregator::new(Arc::clone(source), config, presenter.clone());
        let (rx, handle) = aggregator.start(CancellationToken::new());
        (rx, handle, presenter)
    }

    #[tokio::test]
    async fn test_per_target_order_is_preserved() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        source.add_pod("prod", "worker", &["app"]);
        for pod in ["api", "worker"] {
            let lines = (0..50).map(|i| format!("{} line {}", pod, i)).collect();
            source.script(&StreamTarget::new("prod", pod, "app"), Attempt::lines(lines));
        }

        let (mut rx, handle, _) = start(&source, fast_config());
        let mut seen: HashMap<String, Vec<String>> = HashMap::new();
        for _ in 0..100 {
            let entry = recv(&mut rx).await;
            seen.entry(entry.target.pod.clone()).or_default().push(entry.message);
        }

        for pod in ["api", "worker"] {
            let expected: Vec<String> = (0..50).map(|i| format!("{} line {}", pod, i)).collect();
            assert_eq!(seen[pod], expected);
        }

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_retries_after_stream_error() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        source.script(&target, Attempt::Fail(SourceError::Stream("reset".to_string())));
        source.script(&target, Attempt::lines(vec!["recovered".to_string()]));

        let (mut rx, handle, presenter) = start(&source, fast_config());
        let entry = recv(&mut rx).await;
        assert_eq!(entry.message, "recovered");
        assert_eq!(source.attempts(&target), 2);
        assert!(presenter.has_error_containing("reset"));

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_not_found_stops_worker_without_retry() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        source.script(
            &target,
            Attempt::Fail(SourceError::PodNotFound {
                namespace: "prod".to_string(),
                pod: "api".to_string(),
            }),
        );

        let config = AggregatorConfig {
            discovery_interval: Duration::from_secs(60),
            ..fast_config()
        };
        let (rx, handle, presenter) = start(&source, config);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.attempts(&target), 1);
        assert!(handle.targets().is_empty());
        assert!(presenter.has_error_containing("Stopped following prod/api/app"));

        let (rest, joined) = shutdown(rx, handle).await;
        assert!(rest.is_empty());
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_resume_skips_already_delivered_entries() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        let base = Utc::now() - chrono::Duration::seconds(30);
        let at = |offset: i64, msg: &str| stamped(base + chrono::Duration::seconds(offset), msg);

        source.script(&target, Attempt::finite(vec![at(0, "one"), at(1, "two")]));
        source.script(
            &target,
            Attempt::lines(vec![at(0, "one"), at(1, "two"), at(2, "three")]),
        );

        let (mut rx, handle, _) = start(&source, fast_config());
        let mut messages = Vec::new();
        for _ in 0..3 {
            messages.push(recv(&mut rx).await.message);
        }
        assert_eq!(messages, vec!["one", "two", "three"]);

        let requests = source.requests(&target);
        assert_eq!(requests[0].tail_lines, Some(10));
        assert!(requests[1].tail_lines.is_none());
        assert!(requests[1].since_seconds.is_some());

        let (rest, joined) = shutdown(rx, handle).await;
        assert!(rest.is_empty());
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_live_tail_drops_entries_before_start() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        let old = stamped(Utc::now() - chrono::Duration::hours(1), "old");
        let new = stamped(Utc::now() + chrono::Duration::hours(1), "new");
        source.script(&target, Attempt::lines(vec![old, new]));

        let config = AggregatorConfig {
            mode: SessionMode::LiveTail,
            ..fast_config()
        };
        let (mut rx, handle, _) = start(&source, config);

        assert_eq!(recv(&mut rx).await.message, "new");
        let request = &source.requests(&target)[0];
        assert!(request.tail_lines.is_none());
        assert!(request.since_seconds.is_some());

        let (rest, joined) = shutdown(rx, handle).await;
        assert!(rest.is_empty());
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_no_pods_is_terminal() {
        let source = Arc::new(FakeSource::default());
        source.add_namespace("prod");

        let (mut rx, handle, presenter) = start(&source, fast_config());
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
        let joined = timeout(WAIT, handle.join()).await.unwrap();
        assert!(matches!(joined, Err(AggregateError::NoPodsFound)));
        assert!(presenter.has_error_containing("No pods found"));
    }

    #[tokio::test]
    async fn test_discovers_pods_created_later() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        source.script(
            &StreamTarget::new("prod", "api", "app"),
            Attempt::lines(vec!["from api".to_string()]),
        );

        let (mut rx, handle, _) = start(&source, fast_config());
        assert_eq!(recv(&mut rx).await.message, "from api");

        let late = StreamTarget::new("prod", "batch", "job");
        source.script(&late, Attempt::lines(vec!["from batch".to_string()]));
        source.add_pod("prod", "batch", &["job"]);

        let entry = recv(&mut rx).await;
        assert_eq!(entry.message, "from batch");
        assert_eq!(entry.target, late);

        let request = &source.requests(&late)[0];
        assert!(request.tail_lines.is_none());
        assert!(request.since_seconds.is_some());
        assert_eq!(handle.targets().len(), 2);

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_container_filter_reports_missing_once() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app", "sidecar"]);
        source.add_pod("prod", "proxy", &["sidecar"]);

        let config = AggregatorConfig {
            containers: vec!["app".to_string()],
            ..fast_config()
        };
        let (rx, handle, presenter) = start(&source, config);

        // Let a few discovery rounds pass
        tokio::time::sleep(Duration::from_millis(150)).await;
        let targets: Vec<StreamTarget> = handle.targets().into_iter().map(|(t, _)| t).collect();
        assert_eq!(targets, vec![StreamTarget::new("prod", "api", "app")]);
        assert_eq!(presenter.errors_containing("Container app not found in pod prod/proxy"), 1);

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_under_backpressure_closes_channel() {
        let source = Arc::new(FakeSource::default());
        for i in 0..8 {
            let pod = format!("pod-{}", i);
            source.add_pod("prod", &pod, &["app"]);
            source.script(&StreamTarget::new("prod", pod.as_str(), "app"), Attempt::Endless);
        }

        let config = AggregatorConfig {
            channel_capacity: 4,
            ..fast_config()
        };
        let (mut rx, handle, _) = start(&source, config);

        for _ in 0..20 {
            recv(&mut rx).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let (rest, joined) = shutdown(rx, handle).await;
        // Only what fit in the channel plus in-flight sends
        assert!(rest.len() <= 4 + 8);
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_selectors_are_unioned() {
        let source = Arc::new(FakeSource::default());
        for pod in ["api", "web", "db"] {
            source.add_pod("prod", pod, &["app"]);
            source.label_pod("prod", pod, &[("app", pod), ("tier", "backend")]);
            source.script(
                &StreamTarget::new("prod", pod, "app"),
                Attempt::lines(vec![format!("from {}", pod)]),
            );
        }

        let config = AggregatorConfig {
            selectors: vec!["app=api".to_string(), "app=web,tier=backend".to_string()],
            ..fast_config()
        };
        let (mut rx, handle, _) = start(&source, config);

        let mut pods = vec![recv(&mut rx).await.target.pod, recv(&mut rx).await.target.pod];
        pods.sort();
        assert_eq!(pods, vec!["api", "web"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let targets: Vec<StreamTarget> = handle.targets().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            targets,
            vec![
                StreamTarget::new("prod", "api", "app"),
                StreamTarget::new("prod", "web", "app"),
            ]
        );
        assert_eq!(source.attempts(&StreamTarget::new("prod", "db", "app")), 0);

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_failing_namespace_does_not_stop_others() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        source.script(&target, Attempt::lines(vec!["still here".to_string()]));

        let config = AggregatorConfig {
            namespaces: vec!["gone".to_string(), "prod".to_string()],
            ..fast_config()
        };
        let (mut rx, handle, presenter) = start(&source, config);

        let entry = recv(&mut rx).await;
        assert_eq!(entry.message, "still here");
        assert_eq!(entry.target, target);

        // Several discovery passes keep failing; the error is reported once
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(presenter.errors_containing("Error fetching pods for namespace gone"), 1);

        // Recovery followed by a new failure is reported again
        source.add_namespace("gone");
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.remove_namespace("gone");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(presenter.errors_containing("Error fetching pods for namespace gone"), 2);

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_stopped_target_is_rediscovered() {
        let source = Arc::new(FakeSource::default());
        source.add_pod("prod", "api", &["app"]);
        let target = StreamTarget::new("prod", "api", "app");
        source.script(
            &target,
            Attempt::Fail(SourceError::PodNotFound {
                namespace: "prod".to_string(),
                pod: "api".to_string(),
            }),
        );
        source.script(&target, Attempt::lines(vec!["replacement pod".to_string()]));

        let (mut rx, handle, presenter) = start(&source, fast_config());

        let entry = recv(&mut rx).await;
        assert_eq!(entry.message, "replacement pod");
        assert!(presenter.has_error_containing("Stopped following prod/api/app"));

        let requests = source.requests(&target);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tail_lines, Some(10));
        assert!(requests[1].tail_lines.is_none());
        assert!(requests[1].since_seconds.is_some());
        assert_eq!(handle.targets(), vec![(target, WorkerState::Streaming)]);

        let (_, joined) = shutdown(rx, handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_build_tree() {
        let source = FakeSource::default();
        source.add_pod("prod", "api", &["app", "sidecar"]);
        source.add_namespace("staging");

        let tree = build_tree(&source, &[], &[]).await.unwrap();
        assert_eq!(tree.namespaces.len(), 2);
        assert_eq!(tree.pod_count(), 1);
        assert_eq!(tree.targets().len(), 2);

        let err = build_tree(&source, &["missing".to_string()], &[])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
