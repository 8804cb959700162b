//! Shared types for multilog
//!
//! This crate contains data structures used across multiple multilog crates.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// One followed log stream: a single container of a single pod
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl StreamTarget {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Namespace level of the resource hierarchy
#[derive(Clone, Debug, Default)]
pub struct NamespaceNode {
    pub name: String,
    pub pods: Vec<PodNode>,
}

/// Pod level of the resource hierarchy
#[derive(Clone, Debug)]
pub struct PodNode {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerNode>,
}

/// Container level of the resource hierarchy (a leaf, always streamable)
#[derive(Clone, Debug)]
pub struct ContainerNode {
    pub target: StreamTarget,
}

/// A borrowed node of the resource hierarchy.
///
/// Each level carries its own payload, so consumers match on the variant
/// instead of downcasting an opaque reference.
#[derive(Clone, Copy, Debug)]
pub enum ResourceNode<'a> {
    Namespace(&'a NamespaceNode),
    Pod(&'a PodNode),
    Container(&'a ContainerNode),
}

impl<'a> ResourceNode<'a> {
    /// Display label for this node
    pub fn label(&self) -> &str {
        match self {
            Self::Namespace(ns) => &ns.name,
            Self::Pod(pod) => &pod.name,
            Self::Container(container) => &container.target.container,
        }
    }

    /// Nesting depth (namespaces are at depth 0)
    pub fn depth(&self) -> usize {
        match self {
            Self::Namespace(_) => 0,
            Self::Pod(_) => 1,
            Self::Container(_) => 2,
        }
    }

    /// The stream target selected by this node, if it is a container
    pub fn target(&self) -> Option<&'a StreamTarget> {
        match self {
            Self::Container(container) => Some(&container.target),
            _ => None,
        }
    }
}

/// Namespace -> pod -> container hierarchy of a cluster
#[derive(Clone, Debug, Default)]
pub struct ResourceTree {
    pub namespaces: Vec<NamespaceNode>,
}

impl ResourceTree {
    /// Walk the tree depth-first, parents before children
    pub fn walk(&self) -> Vec<ResourceNode<'_>> {
        let mut nodes = Vec::new();
        for ns in &self.namespaces {
            nodes.push(ResourceNode::Namespace(ns));
            for pod in &ns.pods {
                nodes.push(ResourceNode::Pod(pod));
                nodes.extend(pod.containers.iter().map(ResourceNode::Container));
            }
        }
        nodes
    }

    /// All streamable targets in the tree
    pub fn targets(&self) -> Vec<&StreamTarget> {
        self.walk().into_iter().filter_map(|n| n.target()).collect()
    }

    pub fn pod_count(&self) -> usize {
        self.namespaces.iter().map(|ns| ns.pods.len()).sum()
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Where a newly opened log stream starts reading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowFrom {
    /// Replay the last N lines, then follow
    Tail(i64),
    /// Only lines emitted after this instant, then follow
    Since(DateTime<Utc>),
}

impl FollowFrom {
    /// Whole seconds to request from the API for a `Since` cursor (at least 1)
    pub fn since_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        match self {
            Self::Tail(_) => None,
            Self::Since(start) => {
                let elapsed = now.signed_duration_since(*start);
                let mut secs = elapsed.num_seconds();
                if elapsed.subsec_nanos() > 0 {
                    secs += 1;
                }
                Some(secs.max(1))
            }
        }
    }

    pub fn tail_lines(&self) -> Option<i64> {
        match self {
            Self::Tail(n) => Some(*n),
            Self::Since(_) => None,
        }
    }
}

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    #[default]
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "",
        }
    }
}

/// A single parsed log entry, as delivered by the stream aggregator
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Source timestamp, or the time the line was read when it carried none
    pub timestamp: DateTime<Utc>,

    /// Stream this entry was read from
    pub target: StreamTarget,

    /// Detected log level
    pub level: LogLevel,

    /// Message text (the JSON message field, or the raw line)
    pub message: String,

    /// Parsed structured fields (if the line was a JSON object)
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
}

impl LogEntry {
    /// Create an unstructured entry from a raw line
    pub fn raw(target: StreamTarget, timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            target,
            level: LogLevel::Unknown,
            message: message.into(),
            fields: None,
        }
    }

    /// Render as a single buffer line:
    /// `2024-01-15T10:30:00Z [ns/pod/container] LEVEL: message`
    pub fn render(&self) -> String {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        match self.level {
            LogLevel::Unknown => format!("{} [{}] {}", ts, self.target, self.message),
            level => format!("{} [{}] {}: {}", ts, self.target, level.as_str(), self.message),
        }
    }
}
