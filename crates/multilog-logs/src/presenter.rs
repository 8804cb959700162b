use multilog_types::StreamTarget;

use crate::buffer::LogLine;
use crate::search::{Match, SearchResult};

/// Outward-facing view of the engine: whatever renders lines, search
/// highlights and status text implements this.
pub trait Presenter: Send + Sync {
    /// A line was appended to the buffer. `matches` are the active search's
    /// matches on it in offset order; `target` is the stream it came from,
    /// when known.
    fn on_new_entry(&self, line: &LogLine, target: Option<&StreamTarget>, matches: &[Match]);

    /// A search result was (re)computed
    fn on_search_result(&self, result: &SearchResult);

    /// Human-readable status text
    fn on_status(&self, message: &str, is_error: bool);
}
