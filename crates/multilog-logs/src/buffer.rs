use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::index::{TokenPattern, WordIndex};

/// Default number of lines kept in memory
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One received line. Cloning is cheap (shared string).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    content: Arc<str>,
}

impl LogLine {
    pub fn new(content: impl Into<Arc<str>>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Lines and their index, always mutated together under one lock
struct Inner {
    lines: VecDeque<LogLine>,
    index: WordIndex,
    /// Sequence number of `lines[0]`; grows by one per eviction
    first_seq: u64,
}

/// Thread-safe bounded line buffer with a word index
#[derive(Clone)]
pub struct LogBuffer {
    /// Internal storage
    inner: Arc<RwLock<Inner>>,

    /// Maximum capacity
    capacity: usize,

    /// Set on every append, cleared by whoever consumes it
    new_content: Arc<AtomicBool>,
}

impl LogBuffer {
    /// Create a new log buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                index: WordIndex::new(),
                first_seq: 0,
            })),
            capacity,
            new_content: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a line, evicting the oldest if at capacity. Returns its position.
    pub fn append(&self, content: impl Into<Arc<str>>) -> usize {
        let line = LogLine::new(content);

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if inner.lines.len() >= self.capacity {
            if let Some(evicted) = inner.lines.pop_front() {
                inner.index.remove_oldest(inner.first_seq, evicted.content());
                inner.first_seq += 1;
            }
        }

        let seq = inner.first_seq + inner.lines.len() as u64;
        inner.index.insert(seq, line.content());
        inner.lines.push_back(line);
        let position = inner.lines.len() - 1;
        drop(guard);

        self.new_content.store(true, Ordering::Release);
        position
    }

    /// Copy of all lines, oldest first
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.inner.read().lines.iter().cloned().collect()
    }

    /// Run `f` against a consistent view of lines and index
    pub fn view<R>(&self, f: impl FnOnce(BufferView<'_>) -> R) -> R {
        let inner = self.inner.read();
        f(BufferView { inner: &*inner })
    }

    /// Positions of lines containing `token` (case-folded)
    pub fn lookup(&self, token: &str) -> Vec<usize> {
        self.view(|view| view.lookup(token))
    }

    /// Clear all lines and the index
    pub fn clear(&self) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        // Keep sequence numbers monotonic so stale results never line up again
        inner.first_seq += inner.lines.len() as u64;
        inner.lines.clear();
        inner.index.clear();
    }

    /// Whether lines arrived since the last call; resets the flag
    pub fn take_new_content(&self) -> bool {
        self.new_content.swap(false, Ordering::AcqRel)
    }

    pub fn has_new_content(&self) -> bool {
        self.new_content.load(Ordering::Acquire)
    }

    /// Total line count
    pub fn len(&self) -> usize {
        self.inner.read().lines.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the line currently at position 0
    pub fn first_sequence(&self) -> u64 {
        self.inner.read().first_seq
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Read-locked view of a [`LogBuffer`]
pub struct BufferView<'a> {
    inner: &'a Inner,
}

impl BufferView<'_> {
    pub fn len(&self) -> usize {
        self.inner.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lines.is_empty()
    }

    /// Sequence number of the line at position 0
    pub fn first_sequence(&self) -> u64 {
        self.inner.first_seq
    }

    pub fn line(&self, position: usize) -> Option<&LogLine> {
        self.inner.lines.get(position)
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.inner.lines.iter()
    }

    /// Positions of lines containing `token` (case-folded)
    pub fn lookup(&self, token: &str) -> Vec<usize> {
        self.inner
            .index
            .lookup(token)
            .into_iter()
            .filter_map(|seq| self.position_of(seq))
            .collect()
    }

    /// Positions of lines with a token fitting `pattern`
    pub fn positions_matching(&self, pattern: &TokenPattern) -> BTreeSet<usize> {
        self.inner
            .index
            .matching(pattern)
            .into_iter()
            .filter_map(|seq| self.position_of(seq))
            .collect()
    }

    fn position_of(&self, seq: u64) -> Option<usize> {
        let offset = seq.checked_sub(self.inner.first_seq)?;
        let position = usize::try_from(offset).ok()?;
        (position < self.inner.lines.len()).then_some(position)
    }
}
