use regex::{Regex, RegexBuilder};

use crate::index::{TokenPattern, fold};
use crate::search::{SearchError, SearchOptions};

/// Compiled search term
#[derive(Clone)]
pub struct Matcher {
    /// Compiled pattern
    regex: Regex,

    /// Original term as typed
    term: String,

    options: SearchOptions,
}

impl Matcher {
    /// Compile a term under the given options.
    ///
    /// Literal terms are escaped; whole-word wraps the pattern in word
    /// boundaries; matching is case-insensitive unless `case_sensitive`.
    pub fn compile(term: &str, options: SearchOptions) -> Result<Self, SearchError> {
        let mut pattern = if options.regex_enabled {
            term.to_string()
        } else {
            regex::escape(term)
        };

        if options.whole_word {
            pattern = format!(r"\b(?:{})\b", pattern);
        }

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(!options.case_sensitive)
            .build()
            .map_err(|source| SearchError::InvalidPattern {
                pattern: term.to_string(),
                source,
            })?;

        Ok(Self {
            regex,
            term: term.to_string(),
            options,
        })
    }

    /// Find all non-overlapping match positions in a string (byte offsets)
    pub fn find_matches(&self, text: &str) -> Vec<(usize, usize)> {
        self.regex
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect()
    }

    /// Get the original term
    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn options(&self) -> SearchOptions {
        self.options
    }

    /// Whether the word index can narrow the candidate lines for this term.
    ///
    /// Only plain case-insensitive literals qualify. Non-ASCII terms are
    /// excluded because regex case folding relates non-ASCII characters that
    /// [`fold`] keeps apart.
    pub fn is_indexable(&self) -> bool {
        let opts = self.options;
        !opts.regex_enabled
            && !opts.whole_word
            && !opts.case_sensitive
            && self.term.is_ascii()
            && self.term.split_whitespace().next().is_some()
    }

    /// Where each whitespace-separated piece of the term must sit in a
    /// matching line's tokens. A piece with whitespace on both sides is a
    /// whole token; whitespace before it makes it a token prefix.
    pub fn index_patterns(&self) -> Vec<TokenPattern> {
        let starts_open = !self.term.starts_with(char::is_whitespace);
        let ends_open = !self.term.ends_with(char::is_whitespace);
        let pieces: Vec<&str> = self.term.split_whitespace().collect();
        let last = pieces.len().saturating_sub(1);

        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| {
                let piece = fold(piece);
                let open_start = i == 0 && starts_open;
                let open_end = i == last && ends_open;
                match (open_start, open_end) {
                    (false, false) => TokenPattern::Exact(piece),
                    (false, true) => TokenPattern::Prefix(piece),
                    (true, false) => TokenPattern::Suffix(piece),
                    (true, true) => TokenPattern::Within(piece),
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("term", &self.term)
            .field("pattern", &self.regex.as_str())
            .field("options", &self.options)
            .finish()
    }
}
