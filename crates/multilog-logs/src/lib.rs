//! Log buffering, search and stream aggregation for multilog

mod aggregator;
mod buffer;
mod index;
mod matcher;
mod parser;
mod presenter;
mod search;
mod session;

#[cfg(test)]
mod testing;

pub use aggregator::{
    AggregateError, AggregatorConfig, AggregatorHandle, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_DISCOVERY_INTERVAL, DEFAULT_RETRY_BACKOFF, DEFAULT_TAIL_LINES, SessionMode,
    StreamAggregator, WorkerState, build_tree,
};
pub use buffer::{BufferView, DEFAULT_CAPACITY, LogBuffer, LogLine};
pub use index::{TokenPattern, WordIndex, fold, tokenize};
pub use matcher::Matcher;
pub use parser::LogParser;
pub use presenter::Presenter;
pub use search::{
    Direction, Match, SearchEngine, SearchError, SearchOptions, SearchResult, Strategy,
};
pub use session::LogSession;
