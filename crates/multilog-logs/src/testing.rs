//! In-memory cluster and presenter used by unit tests

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;

use multilog_k8s::{LineStream, LogRequest, LogSource, LogStream, SourceError};
use multilog_types::StreamTarget;

use crate::buffer::LogLine;
use crate::presenter::Presenter;
use crate::search::{Match, SearchResult};

/// Outcome of one `stream_logs` call
pub(crate) enum Attempt {
    Fail(SourceError),
    /// Deliver the lines, then either end or stay open
    Lines { lines: Vec<String>, end: bool },
    /// Numbered lines forever
    Endless,
}

impl Attempt {
    /// Lines followed by an open, idle stream
    pub(crate) fn lines(lines: Vec<String>) -> Self {
        Self::Lines { lines, end: false }
    }

    /// Lines followed by end of stream
    pub(crate) fn finite(lines: Vec<String>) -> Self {
        Self::Lines { lines, end: true }
    }
}

#[derive(Default)]
struct FakePod {
    containers: Vec<String>,
    labels: BTreeMap<String, String>,
}

impl FakePod {
    /// Equality-based selector: `k=v` terms joined by commas, all required
    fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => {
                    self.labels.get(key.trim()).map(String::as_str) == Some(value.trim())
                }
                None => self.labels.contains_key(term),
            })
    }
}

/// Scripted [`LogSource`]. Unscripted streams stay open without output.
#[derive(Default)]
pub(crate) struct FakeSource {
    cluster: Mutex<BTreeMap<String, BTreeMap<String, FakePod>>>,
    scripts: Mutex<HashMap<StreamTarget, VecDeque<Attempt>>>,
    requests: Mutex<HashMap<StreamTarget, Vec<LogRequest>>>,
}

impl FakeSource {
    pub(crate) fn add_namespace(&self, namespace: &str) {
        self.cluster.lock().entry(namespace.to_string()).or_default();
    }

    pub(crate) fn remove_namespace(&self, namespace: &str) {
        self.cluster.lock().remove(namespace);
    }

    pub(crate) fn add_pod(&self, namespace: &str, pod: &str, containers: &[&str]) {
        self.cluster
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(
                pod.to_string(),
                FakePod {
                    containers: containers.iter().map(|c| c.to_string()).collect(),
                    labels: BTreeMap::new(),
                },
            );
    }

    pub(crate) fn label_pod(&self, namespace: &str, pod: &str, labels: &[(&str, &str)]) {
        let mut cluster = self.cluster.lock();
        if let Some(pod) = cluster.get_mut(namespace).and_then(|pods| pods.get_mut(pod)) {
            pod.labels
                .extend(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        }
    }

    pub(crate) fn script(&self, target: &StreamTarget, attempt: Attempt) {
        self.scripts
            .lock()
            .entry(target.clone())
            .or_default()
            .push_back(attempt);
    }

    pub(crate) fn requests(&self, target: &StreamTarget) -> Vec<LogRequest> {
        self.requests.lock().get(target).cloned().unwrap_or_default()
    }

    pub(crate) fn attempts(&self, target: &StreamTarget) -> usize {
        self.requests.lock().get(target).map_or(0, Vec::len)
    }

    fn containers(&self, namespace: &str, pod: &str) -> Result<Vec<String>, SourceError> {
        let cluster = self.cluster.lock();
        let pods = cluster
            .get(namespace)
            .ok_or_else(|| SourceError::NamespaceNotFound(namespace.to_string()))?;
        pods.get(pod)
            .map(|p| p.containers.clone())
            .ok_or_else(|| SourceError::PodNotFound {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
            })
    }
}

#[async_trait]
impl LogSource for FakeSource {
    async fn list_namespaces(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.cluster.lock().keys().cloned().collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<String>, SourceError> {
        let cluster = self.cluster.lock();
        let pods = cluster
            .get(namespace)
            .ok_or_else(|| SourceError::NamespaceNotFound(namespace.to_string()))?;
        Ok(pods
            .iter()
            .filter(|(_, pod)| selector.is_none_or(|s| pod.matches(s)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_containers(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, SourceError> {
        self.containers(namespace, pod)
    }

    async fn stream_logs(
        &self,
        target: &StreamTarget,
        request: &LogRequest,
    ) -> Result<LogStream, SourceError> {
        self.requests
            .lock()
            .entry(target.clone())
            .or_default()
            .push(request.clone());

        if !self.containers(&target.namespace, &target.pod)?.contains(&target.container) {
            return Err(SourceError::ContainerNotFound {
                namespace: target.namespace.clone(),
                pod: target.pod.clone(),
                container: target.container.clone(),
            });
        }

        let attempt = self
            .scripts
            .lock()
            .get_mut(target)
            .and_then(VecDeque::pop_front);

        let lines: LineStream = match attempt {
            Some(Attempt::Fail(e)) => return Err(e),
            Some(Attempt::Lines { lines, end: true }) => stream::iter(lines).map(Ok).boxed(),
            Some(Attempt::Lines { lines, end: false }) => stream::iter(lines)
                .map(Ok)
                .chain(stream::pending())
                .boxed(),
            Some(Attempt::Endless) => {
                let pod = target.pod.clone();
                stream::iter(0u64..)
                    .map(move |i| Ok(format!("{} line {}", pod, i)))
                    .boxed()
            }
            None => stream::pending().boxed(),
        };

        Ok(LogStream {
            snapshot: String::new(),
            lines,
        })
    }
}

/// Presenter that records every callback
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    pub(crate) lines: Mutex<Vec<String>>,
    pub(crate) targets: Mutex<Vec<Option<StreamTarget>>>,
    pub(crate) matches: Mutex<Vec<Vec<Match>>>,
    pub(crate) results: Mutex<Vec<SearchResult>>,
    pub(crate) statuses: Mutex<Vec<(String, bool)>>,
}

impl RecordingPresenter {
    pub(crate) fn errors_containing(&self, needle: &str) -> usize {
        self.statuses
            .lock()
            .iter()
            .filter(|(message, is_error)| *is_error && message.contains(needle))
            .count()
    }

    pub(crate) fn has_error_containing(&self, needle: &str) -> bool {
        self.errors_containing(needle) > 0
    }

    pub(crate) fn last_result(&self) -> Option<SearchResult> {
        self.results.lock().last().cloned()
    }

    pub(crate) fn last_status(&self) -> Option<(String, bool)> {
        self.statuses.lock().last().cloned()
    }
}

impl Presenter for RecordingPresenter {
    fn on_new_entry(&self, line: &LogLine, target: Option<&StreamTarget>, matches: &[Match]) {
        self.lines.lock().push(line.content().to_string());
        self.targets.lock().push(target.cloned());
        self.matches.lock().push(matches.to_vec());
    }

    fn on_search_result(&self, result: &SearchResult) {
        self.results.lock().push(result.clone());
    }

    fn on_status(&self, message: &str, is_error: bool) {
        self.statuses.lock().push((message.to_string(), is_error));
    }
}
