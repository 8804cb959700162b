//! Search over buffered lines, and navigation between matches

use std::collections::BTreeSet;

use thiserror::Error;

use crate::buffer::{BufferView, LogBuffer, LogLine};
use crate::index::TokenPattern;
use crate::matcher::Matcher;

/// How a term is matched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
    pub regex_enabled: bool,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One occurrence of the term. Offsets are byte offsets into the line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub line_number: usize,
    pub start: usize,
    pub end: usize,
    pub selected: bool,
}

/// Navigation direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Outcome of one search, plus the navigation cursor over its matches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    term: String,
    options: SearchOptions,
    matches: Vec<Match>,
    /// Index into `matches` of the selected match
    cursor: Option<usize>,
    /// Buffer sequence number of line 0 when this result was computed
    origin: u64,
}

impl SearchResult {
    /// Result of an empty term
    pub fn cleared(options: SearchOptions) -> Self {
        Self {
            term: String::new(),
            options,
            matches: Vec::new(),
            cursor: None,
            origin: 0,
        }
    }

    /// True when the term was empty and the view should reset
    pub fn is_cleared(&self) -> bool {
        self.term.is_empty()
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn options(&self) -> SearchOptions {
        self.options
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Index of the selected match
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn selected(&self) -> Option<&Match> {
        self.cursor.and_then(|i| self.matches.get(i))
    }

    /// Matches on one line, in offset order (for highlighting)
    pub fn matches_on_line(&self, line_number: usize) -> impl Iterator<Item = &Match> {
        let start = self.matches.partition_point(|m| m.line_number < line_number);
        self.matches[start..]
            .iter()
            .take_while(move |m| m.line_number == line_number)
    }

    /// Distinct line numbers with at least one match
    pub fn matched_lines(&self) -> BTreeSet<usize> {
        self.matches.iter().map(|m| m.line_number).collect()
    }

    /// Move the cursor one match forward or backward, wrapping around.
    ///
    /// With nothing selected yet, `Forward` selects the first match and
    /// `Backward` the last. Returns the newly selected match, or `None` when
    /// there are no matches.
    pub fn advance(&mut self, direction: Direction) -> Option<&Match> {
        let count = self.matches.len();
        if count == 0 {
            return None;
        }

        let next = match (self.cursor, direction) {
            (None, Direction::Forward) => 0,
            (None, Direction::Backward) => count - 1,
            (Some(i), Direction::Forward) => (i + 1) % count,
            (Some(i), Direction::Backward) => (i + count - 1) % count,
        };
        self.select(next)
    }

    /// Select a match by index, clearing any previous selection
    pub fn select(&mut self, index: usize) -> Option<&Match> {
        if index >= self.matches.len() {
            return None;
        }
        if let Some(previous) = self.cursor.and_then(|i| self.matches.get_mut(i)) {
            previous.selected = false;
        }
        self.matches[index].selected = true;
        self.cursor = Some(index);
        self.matches.get(index)
    }

    /// Short navigation label: "Match 2/5", "5 matches" or "No matches"
    pub fn position_label(&self) -> String {
        match (self.cursor, self.matches.len()) {
            (_, 0) => "No matches".to_string(),
            (Some(i), n) => format!("Match {}/{}", i + 1, n),
            (None, 1) => "1 match".to_string(),
            (None, n) => format!("{} matches", n),
        }
    }
}

/// How candidate lines are chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Narrow candidates through the word index, then locate offsets
    Indexed,
    /// Run the matcher over every line
    FullScan,
}

impl Strategy {
    /// Best strategy for a compiled term
    pub fn for_matcher(matcher: &Matcher) -> Self {
        if matcher.is_indexable() {
            Self::Indexed
        } else {
            Self::FullScan
        }
    }
}

/// Stateless search over buffer views
pub struct SearchEngine;

impl SearchEngine {
    /// Search the view for `term`.
    ///
    /// An empty term yields a cleared result. Matches are ordered by line and
    /// offset; none is selected.
    pub fn search(
        view: &BufferView<'_>,
        term: &str,
        options: SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        Self::search_using(view, term, options, None)
    }

    /// Search with an explicit strategy. `Indexed` is ignored for terms the
    /// index cannot narrow safely.
    pub fn search_using(
        view: &BufferView<'_>,
        term: &str,
        options: SearchOptions,
        strategy: Option<Strategy>,
    ) -> Result<SearchResult, SearchError> {
        if term.is_empty() {
            return Ok(SearchResult::cleared(options));
        }

        let matcher = Matcher::compile(term, options)?;
        let strategy = match strategy {
            Some(Strategy::Indexed) if matcher.is_indexable() => Strategy::Indexed,
            Some(_) => Strategy::FullScan,
            None => Strategy::for_matcher(&matcher),
        };

        let matches = match strategy {
            Strategy::Indexed => Self::indexed_scan(view, &matcher),
            Strategy::FullScan => collect_matches(&matcher, view.lines().enumerate()),
        };

        Ok(SearchResult {
            term: term.to_string(),
            options,
            matches,
            cursor: None,
            origin: view.first_sequence(),
        })
    }

    /// Convenience wrapper taking the buffer's read lock once
    pub fn search_buffer(
        buffer: &LogBuffer,
        term: &str,
        options: SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        buffer.view(|view| Self::search(&view, term, options))
    }

    /// Re-run a previous search over the current buffer contents.
    ///
    /// Always recomputes from scratch, since positions shift on eviction.
    /// A selected match that is still present keeps its selection.
    pub fn incremental_update(
        previous: &SearchResult,
        view: &BufferView<'_>,
    ) -> Result<SearchResult, SearchError> {
        let mut next = Self::search(view, &previous.term, previous.options)?;

        if let Some(selected) = previous.selected() {
            let evicted = view.first_sequence().saturating_sub(previous.origin);
            let shifted = usize::try_from(evicted)
                .ok()
                .and_then(|evicted| selected.line_number.checked_sub(evicted));

            if let Some(line_number) = shifted {
                let index = next.matches.iter().position(|m| {
                    m.line_number == line_number && m.start == selected.start && m.end == selected.end
                });
                if let Some(index) = index {
                    next.select(index);
                }
            }
        }

        Ok(next)
    }

    fn indexed_scan(view: &BufferView<'_>, matcher: &Matcher) -> Vec<Match> {
        // Whole-token and prefix pieces are enough to narrow the candidates;
        // the matcher verifies every candidate anyway
        let patterns = matcher.index_patterns();
        let narrow: Vec<&TokenPattern> = patterns.iter().filter(|p| p.is_narrow()).collect();
        let used = if narrow.is_empty() {
            patterns.iter().collect()
        } else {
            narrow
        };

        let mut candidates: Option<BTreeSet<usize>> = None;
        for pattern in used {
            let lines = view.positions_matching(pattern);
            let next = match candidates {
                Some(acc) => acc.intersection(&lines).copied().collect(),
                None => lines,
            };
            if next.is_empty() {
                return Vec::new();
            }
            candidates = Some(next);
        }

        let lines = candidates
            .unwrap_or_default()
            .into_iter()
            .filter_map(|position| view.line(position).map(|line| (position, line)));
        collect_matches(matcher, lines)
    }
}

fn collect_matches<'a>(
    matcher: &Matcher,
    lines: impl Iterator<Item = (usize, &'a LogLine)>,
) -> Vec<Match> {
    let mut matches = Vec::new();
    for (line_number, line) in lines {
        for (start, end) in matcher.find_matches(line.content()) {
            matches.push(Match {
                line_number,
                start,
                end,
                selected: false,
            });
        }
    }
    matches
}
