use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;

/// Case-fold text so that every line a case-insensitive ASCII term matches
/// contains the folded term. Regex case folding also maps `ſ` (long s) to
/// `s`; the Kelvin sign already lowercases to `k`.
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c == 'ſ' { 's' } else { c })
        .collect()
}

/// Split a line into case-folded index tokens
pub fn tokenize(content: &str) -> impl Iterator<Item = String> + '_ {
    content.split_whitespace().map(fold)
}

/// Where a case-folded fragment of a search term sits inside a token
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenPattern {
    /// The whole token
    Exact(String),
    /// The start of a token
    Prefix(String),
    /// The end of a token
    Suffix(String),
    /// Anywhere in a token
    Within(String),
}

impl TokenPattern {
    /// Whether the index answers this without visiting every token
    pub fn is_narrow(&self) -> bool {
        matches!(self, Self::Exact(_) | Self::Prefix(_))
    }
}

/// Inverted index from case-folded token to the lines containing it.
///
/// Lines are identified by their absolute sequence number, not by position,
/// so evicting the head of the buffer never requires rewriting postings.
/// Each posting list is ascending and holds a line at most once.
#[derive(Clone, Debug, Default)]
pub struct WordIndex {
    postings: BTreeMap<String, VecDeque<u64>>,
}

impl WordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every token of a line. Sequence numbers must be increasing.
    pub fn insert(&mut self, seq: u64, content: &str) {
        for token in tokenize(content) {
            let list = self.postings.entry(token).or_default();
            if list.back() != Some(&seq) {
                list.push_back(seq);
            }
        }
    }

    /// Drop a line from the index. It must be the oldest indexed line.
    pub fn remove_oldest(&mut self, seq: u64, content: &str) {
        for token in tokenize(content) {
            let Some(list) = self.postings.get_mut(&token) else {
                continue;
            };
            if list.front() == Some(&seq) {
                list.pop_front();
            }
            if list.is_empty() {
                self.postings.remove(&token);
            }
        }
    }

    /// Lines containing `token` (case-folded before lookup)
    pub fn lookup(&self, token: &str) -> Vec<u64> {
        self.postings
            .get(&fold(token))
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Lines having a token that fits `pattern`. The fragment inside the
    /// pattern must already be case-folded.
    ///
    /// Exact and prefix patterns walk only the matching range of the sorted
    /// vocabulary; the others visit every token.
    pub fn matching(&self, pattern: &TokenPattern) -> BTreeSet<u64> {
        match pattern {
            TokenPattern::Exact(token) => self
                .postings
                .get(token)
                .map(|list| list.iter().copied().collect())
                .unwrap_or_default(),
            TokenPattern::Prefix(prefix) => self
                .postings
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .take_while(|(token, _)| token.starts_with(prefix.as_str()))
                .flat_map(|(_, list)| list.iter().copied())
                .collect(),
            TokenPattern::Suffix(suffix) => self
                .postings
                .iter()
                .filter(|(token, _)| token.ends_with(suffix.as_str()))
                .flat_map(|(_, list)| list.iter().copied())
                .collect(),
            TokenPattern::Within(fragment) => self
                .postings
                .iter()
                .filter(|(token, _)| token.contains(fragment.as_str()))
                .flat_map(|(_, list)| list.iter().copied())
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.postings.clear();
    }
}
