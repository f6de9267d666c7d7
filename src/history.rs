//! Command history for pipeterm
//!
//! Append-only list of submitted input lines with an up/down recall cursor.

/// Submitted commands, oldest first, plus the recall cursor.
///
/// The cursor is an index into the entries; `len()` means "not browsing".
#[derive(Debug, Clone, Default)]
pub struct CommandHistory {
    entries: Vec<String>,
    cursor: usize,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a submitted line and stop browsing
    pub fn push(&mut self, command: impl Into<String>) {
        self.entries.push(command.into());
        self.cursor = self.entries.len();
    }

    /// Step back towards the oldest entry.
    ///
    /// Stays on the oldest entry once reached. `None` when the history is empty.
    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        self.cursor = self.cursor.saturating_sub(1);
        self.entries.get(self.cursor).map(String::as_str)
    }

    /// Step forward towards the newest entry.
    ///
    /// Moving past the newest entry returns an empty line once and leaves the
    /// cursor at "not browsing"; further calls return `None`.
    pub fn next(&mut self) -> Option<&str> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.entries.get(self.cursor).map_or("", String::as_str))
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_browsing(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// All entries, oldest first
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn last(&self) -> Option<&str> {
        self.entries.last().map(String::as_str)
    }

    /// Search history by query (newest first, case-insensitive)
    pub fn search(&self, query: &str) -> Vec<&str> {
        let query_lower = query.to_lowercase();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.to_lowercase().contains(&query_lower))
            .map(String::as_str)
            .collect()
    }

    /// Get recent history (newest first)
    pub fn recent(&self, count: usize) -> Vec<&str> {
        self.entries.iter().rev().take(count).map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(commands: &[&str]) -> CommandHistory {
        let mut history = CommandHistory::new();
        for command in commands {
            history.push(*command);
        }
        history
    }

    #[test]
    fn test_recall_on_empty_history() {
        let mut history = CommandHistory::new();
        assert_eq!(history.previous(), None);
        assert_eq!(history.next(), None);
        assert_eq!(history.cursor(), 0);
    }

    #[test]
    fn test_previous_clamps_at_oldest() {
        let mut history = history(&["dir", "git status"]);
        assert_eq!(history.previous(), Some("git status"));
        assert_eq!(history.previous(), Some("dir"));
        assert_eq!(history.previous(), Some("dir"));
        assert_eq!(history.previous(), Some("dir"));
        assert_eq!(history.cursor(), 0);
    }

    #[test]
    fn test_next_past_newest_yields_empty_once() {
        let mut history = history(&["dir", "git status"]);
        history.previous();
        history.previous();
        assert_eq!(history.next(), Some("git status"));
        assert_eq!(history.next(), Some(""));
        assert!(!history.is_browsing());
        assert_eq!(history.next(), None);
        assert_eq!(history.cursor(), 2);
    }

    #[test]
    fn test_push_resets_cursor() {
        let mut history = history(&["a", "b", "c"]);
        history.previous();
        history.previous();
        assert!(history.is_browsing());
        history.push("d");
        assert!(!history.is_browsing());
        assert_eq!(history.previous(), Some("d"));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let history = history(&["dir", "dir"]);
        assert_eq!(history.len(), 2);
        assert_eq!(history.last(), Some("dir"));
    }

    #[test]
    fn test_search_newest_first() {
        let history = history(&["git status", "dir", "GIT log", "cls"]);
        assert_eq!(history.search("git"), vec!["GIT log", "git status"]);
        assert!(history.search("make").is_empty());
        assert_eq!(history.recent(2), vec!["cls", "GIT log"]);
    }
}
