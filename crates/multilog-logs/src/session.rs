//! Buffer-owning driver that keeps the active search current

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use multilog_types::{LogEntry, StreamTarget};

use crate::buffer::{LogBuffer, LogLine};
use crate::presenter::Presenter;
use crate::search::{Direction, Match, SearchEngine, SearchError, SearchOptions, SearchResult};

/// Maximum entries ingested between two re-searches
const MAX_BATCH: usize = 256;

/// Owns the buffer writer side, the active search and its cursor
pub struct LogSession {
    buffer: LogBuffer,
    presenter: Arc<dyn Presenter>,
    options: SearchOptions,
    result: Option<SearchResult>,
    /// Appended lines not yet shown, oldest first
    pending: Vec<(LogLine, Option<StreamTarget>)>,
}

impl LogSession {
    pub fn new(buffer: LogBuffer, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            buffer,
            presenter,
            options: SearchOptions::default(),
            result: None,
            pending: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn options(&self) -> SearchOptions {
        self.options
    }

    /// The active search, if a term is set
    pub fn result(&self) -> Option<&SearchResult> {
        self.result.as_ref()
    }

    /// Append an entry's rendered line to the buffer. It is shown on the
    /// next [`flush`](Self::flush).
    pub fn ingest(&mut self, entry: &LogEntry) -> usize {
        self.append(entry.render(), Some(entry.target.clone()))
    }

    /// Append a raw line to the buffer
    pub fn ingest_line(&mut self, content: impl Into<Arc<str>>) -> usize {
        self.append(content, None)
    }

    fn append(&mut self, content: impl Into<Arc<str>>, target: Option<StreamTarget>) -> usize {
        let content: Arc<str> = content.into();
        let position = self.buffer.append(Arc::clone(&content));
        self.pending.push((LogLine::new(content), target));
        position
    }

    /// Bring the active search up to date, then show every pending line
    /// with its matches. Returns the number of lines shown.
    pub fn flush(&mut self) -> usize {
        self.refresh();

        let pending = std::mem::take(&mut self.pending);
        // Lines evicted before they were shown have no position left
        let evicted = pending.len().saturating_sub(self.buffer.len());
        let first = self.buffer.len() - (pending.len() - evicted);

        for (i, (line, target)) in pending.iter().enumerate() {
            let matches: Vec<Match> = match (&self.result, i.checked_sub(evicted)) {
                (Some(result), Some(kept)) => {
                    result.matches_on_line(first + kept).copied().collect()
                }
                _ => Vec::new(),
            };
            self.presenter.on_new_entry(line, target.as_ref(), &matches);
        }
        pending.len()
    }

    /// Run a new search. An empty term clears the active search.
    ///
    /// On an invalid pattern the previous result stays active and the error
    /// is reported as status.
    pub fn search(&mut self, term: &str) -> Result<usize, SearchError> {
        let result = match SearchEngine::search_buffer(&self.buffer, term, self.options) {
            Ok(result) => result,
            Err(e) => {
                self.presenter.on_status(&e.to_string(), true);
                return Err(e);
            }
        };

        if result.is_cleared() {
            self.result = None;
            self.presenter.on_search_result(&result);
            self.presenter.on_status("Search cleared", false);
            return Ok(0);
        }

        let count = result.len();
        self.presenter.on_status(
            &format!("Found {} matches for '{}'", count, result.term()),
            false,
        );
        self.presenter.on_search_result(&result);
        self.result = Some(result);
        Ok(count)
    }

    /// Change search options and re-run the active term under them
    pub fn set_options(&mut self, options: SearchOptions) -> Result<usize, SearchError> {
        let previous = std::mem::replace(&mut self.options, options);
        let Some(term) = self.result.as_ref().map(|r| r.term().to_string()) else {
            return Ok(0);
        };

        self.search(&term).inspect_err(|_| self.options = previous)
    }

    /// Recompute the active search if new lines arrived. Returns whether a
    /// new result was published.
    pub fn refresh(&mut self) -> bool {
        if !self.buffer.take_new_content() {
            return false;
        }
        let Some(previous) = &self.result else {
            return false;
        };

        match self
            .buffer
            .view(|view| SearchEngine::incremental_update(previous, &view))
        {
            Ok(result) => {
                self.presenter.on_search_result(&result);
                self.result = Some(result);
                true
            }
            Err(e) => {
                warn!(error = %e, "incremental search failed");
                false
            }
        }
    }

    /// Move the match cursor and return the newly selected match
    pub fn advance(&mut self, direction: Direction) -> Option<Match> {
        let result = self.result.as_mut()?;
        let selected = result.advance(direction).copied()?;
        self.presenter.on_search_result(result);
        Some(selected)
    }

    /// Empty the buffer (switching log target); the search term is kept.
    /// Pending lines are shown first.
    pub fn clear(&mut self) {
        self.flush();
        self.buffer.clear();
        if let Some(previous) = &self.result {
            if let Ok(result) = self
                .buffer
                .view(|view| SearchEngine::incremental_update(previous, &view))
            {
                self.presenter.on_search_result(&result);
                self.result = Some(result);
            }
        }
    }

    /// Drain an aggregator's delivery channel until it closes. Each burst is
    /// searched once, then shown. Returns the number of entries ingested.
    pub async fn run(&mut self, mut entries: mpsc::Receiver<LogEntry>) -> usize {
        // A burst never outgrows the buffer, so every line is shown with its matches
        let max_batch = MAX_BATCH.min(self.buffer.capacity());
        let mut total = 0;

        while let Some(entry) = entries.recv().await {
            self.ingest(&entry);
            let mut batch = 1;
            while batch < max_batch {
                match entries.try_recv() {
                    Ok(entry) => {
                        self.ingest(&entry);
                        batch += 1;
                    }
                    Err(_) => break,
                }
            }
            total += batch;

            self.flush();
        }

        debug!(total, "delivery channel closed");
        total
    }
}
