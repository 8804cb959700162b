use async_trait::async_trait;
use futures::stream::BoxStream;

use multilog_types::StreamTarget;

use crate::SourceError;

/// Raw lines of a followed log, in emission order
pub type LineStream = BoxStream<'static, Result<String, SourceError>>;

/// Options for a single log request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogRequest {
    /// Keep the connection open and push new lines as they are written
    pub follow: bool,

    /// Only lines newer than this many seconds (takes precedence over `tail_lines`)
    pub since_seconds: Option<i64>,

    /// Only the last N lines of the existing log
    pub tail_lines: Option<i64>,

    /// Read the previous (terminated) instance of the container
    pub previous: bool,
}

/// Result of opening a log stream
pub struct LogStream {
    /// Text already available when the request was made (may be empty when
    /// the source delivers history through `lines` instead)
    pub snapshot: String,

    /// Lines arriving after the snapshot
    pub lines: LineStream,
}

/// Anything that can enumerate and stream container logs.
///
/// The aggregator only talks to this trait, so a fake can stand in for a
/// cluster in tests.
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// All namespace names
    async fn list_namespaces(&self) -> Result<Vec<String>, SourceError>;

    /// Pod names in a namespace, optionally restricted by a label selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&str>,
    ) -> Result<Vec<String>, SourceError>;

    /// Container names declared by a pod
    async fn list_containers(&self, namespace: &str, pod: &str)
    -> Result<Vec<String>, SourceError>;

    /// Open the log of one container
    async fn stream_logs(
        &self,
        target: &StreamTarget,
        request: &LogRequest,
    ) -> Result<LogStream, SourceError>;
}
