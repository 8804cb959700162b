//! Terminal rendering of followed lines, search highlights and status

use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{self, IsTerminal, Write};

use crossterm::style::{Color, Stylize};
use tracing::debug;

use multilog_logs::{LogLine, Match, Presenter, SearchResult};
use multilog_types::{ResourceNode, ResourceTree, StreamTarget};

/// Colours given to stream labels
const TARGET_COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::DarkYellow,
    Color::DarkCyan,
];

/// Stable colour for a stream, picked by hashing its identity
fn target_color(target: &StreamTarget) -> Color {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    TARGET_COLORS[(hasher.finish() % TARGET_COLORS.len() as u64) as usize]
}

/// Writes lines to stdout and status to stderr, highlighting search matches
pub struct ConsolePresenter {
    color: bool,
}

impl ConsolePresenter {
    pub fn new() -> Self {
        Self {
            color: io::stdout().is_terminal(),
        }
    }

    /// Render a line with its stream label coloured and search matches
    /// highlighted. The selected match stands out from the others.
    fn render(&self, content: &str, target: Option<&StreamTarget>, matches: &[Match]) -> String {
        if !self.color {
            return content.to_string();
        }

        // Byte span of the "[ns/pod/container]" label
        let label = target.and_then(|t| {
            let label = format!("[{}]", t);
            content
                .find(&label)
                .map(|start| (start, start + label.len(), target_color(t)))
        });

        let mut cuts = vec![0, content.len()];
        if let Some((start, end, _)) = label {
            cuts.extend([start, end]);
        }
        for m in matches {
            cuts.extend([m.start, m.end]);
        }
        cuts.retain(|&cut| content.is_char_boundary(cut));
        cuts.sort_unstable();
        cuts.dedup();

        let mut out = String::with_capacity(content.len() + 32);
        for pair in cuts.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            let piece = &content[start..end];
            let hit = matches.iter().find(|m| m.start <= start && end <= m.end);
            let styled = match (hit, label) {
                (Some(m), _) if m.selected => {
                    piece.with(Color::Black).on(Color::Magenta).to_string()
                }
                (Some(_), _) => piece.with(Color::Black).on(Color::Yellow).to_string(),
                (None, Some((from, to, color))) if from <= start && end <= to => {
                    piece.with(color).to_string()
                }
                _ => piece.to_string(),
            };
            out.push_str(&styled);
        }
        out
    }
}

impl Default for ConsolePresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for ConsolePresenter {
    fn on_new_entry(&self, line: &LogLine, target: Option<&StreamTarget>, matches: &[Match]) {
        let rendered = self.render(line.content(), target, matches);
        if let Err(e) = writeln!(io::stdout().lock(), "{}", rendered) {
            debug!(error = %e, "failed to write line");
        }
    }

    fn on_search_result(&self, result: &SearchResult) {
        // Lines arrive with their own matches; only the selection is reported
        if let Some(selected) = result.selected() {
            self.on_status(
                &format!("{} (line {})", result.position_label(), selected.line_number + 1),
                false,
            );
        }
    }

    fn on_status(&self, message: &str, is_error: bool) {
        let mut stderr = io::stderr().lock();
        let written = if !self.color {
            writeln!(stderr, "{}", message)
        } else if is_error {
            writeln!(stderr, "{}", message.red())
        } else {
            writeln!(stderr, "{}", message.cyan())
        };
        if let Err(e) = written {
            debug!(error = %e, "failed to write status");
        }
    }
}

/// Print a context's namespace/pod/container hierarchy
pub fn print_tree(context: &str, tree: &ResourceTree) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{} ({} pods)", context.bold(), tree.pod_count())?;
    for node in tree.walk() {
        let indent = "  ".repeat(node.depth() + 1);
        match node {
            ResourceNode::Namespace(ns) => writeln!(out, "{}{}", indent, ns.name.as_str().blue())?,
            ResourceNode::Pod(pod) => writeln!(out, "{}{}", indent, pod.name)?,
            ResourceNode::Container(_) => writeln!(out, "{}- {}", indent, node.label().dim())?,
        }
    }
    Ok(())
}
