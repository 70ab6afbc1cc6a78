//! Line-oriented output scanning.
//!
//! The assistant speaks over a PTY: a stream of bytes that the adapter
//! splits into lines, buffers, and flushes on sentence terminators, blank
//! lines, or prompt arrival. Prompt lines (trailing `>`, `?`, `Continue?`,
//! `Proceed?`) signal that a reply is complete.

/// Prompt suffixes, checked against the trimmed line.
const PROMPT_SUFFIXES: &[&str] = &[">", "?", "Continue?", "Proceed?"];

/// True when a trimmed line looks like the assistant waiting for input.
pub fn is_prompt_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    PROMPT_SUFFIXES.iter().any(|s| trimmed.ends_with(s))
}

/// Outcome of feeding one line to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// Line buffered; nothing to emit yet.
    Buffered,
    /// Buffered text ready to stream.
    Flush(String),
    /// A prompt arrived; any remaining buffered text comes with it.
    Prompt(Option<String>),
}

/// Accumulates lines and decides when to flush.
#[derive(Debug, Default)]
pub struct OutputScanner {
    buffer: String,
}

impl OutputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its newline).
    pub fn push_line(&mut self, line: &str) -> Scan {
        if is_prompt_line(line) {
            let flushed = (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer));
            return Scan::Prompt(flushed);
        }

        self.buffer.push_str(line);
        self.buffer.push('\n');

        // Sentence terminators and blank lines are flush hints.
        if line.is_empty()
            || line.ends_with('.')
            || line.ends_with('!')
            || line.ends_with('?')
        {
            Scan::Flush(std::mem::take(&mut self.buffer))
        } else {
            Scan::Buffered
        }
    }

    /// Whatever is still buffered.
    pub fn drain(&mut self) -> Option<String> {
        (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer))
    }
}

/// Splits a byte stream into complete lines, tolerating chunk boundaries
/// anywhere. Carriage returns are stripped; invalid UTF-8 is replaced.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete lines it finished.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop(); // newline
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

/// Extract touched files and actions from assistant output.
///
/// Recognized line patterns: `Editing <file>`, `Creating <file>`,
/// `Applied edit`, `Committed`.
pub fn parse_actions(output: &str) -> (Vec<String>, Vec<String>) {
    let mut files = Vec::new();
    let mut actions = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if line.contains("Editing ") || line.contains("Creating ") {
            if let Some(filename) = line.split_whitespace().last() {
                files.push(filename.to_string());
                if line.contains("Creating") {
                    actions.push(format!("create:{}", filename));
                } else {
                    actions.push(format!("edit:{}", filename));
                }
            }
        }

        if line.contains("Applied edit") {
            actions.push("applied_edit".to_string());
        }
        if line.contains("Committed") {
            actions.push("commit".to_string());
        }
    }

    (files, actions)
}

// =============================================================================
// Tests
// =============================================================================
