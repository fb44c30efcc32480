//! Human-facing build output.
//!
//! The reporter owns the accumulated log string and the same-line status
//! machinery. Internal diagnostics go through `tracing`; everything a user
//! is meant to read goes through here.

use std::cell::{Cell, RefCell};

use console::{Style, Term};

pub struct Reporter {
    term: Term,
    quiet: Cell<bool>,
    verbose: Cell<bool>,
    use_color: Cell<bool>,
    line_dirty: Cell<bool>,
    log: RefCell<String>,
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
            quiet: Cell::new(false),
            verbose: Cell::new(false),
            use_color: Cell::new(true),
            line_dirty: Cell::new(false),
            log: RefCell::new(String::new()),
        }
    }

    pub(crate) fn configure(&self, quiet: bool, verbose: bool, use_color: bool) {
        self.quiet.set(quiet);
        self.verbose.set(verbose);
        self.use_color.set(use_color);
    }

    /// Appends a full line to the log and the terminal.
    pub fn line(&self, message: &str) {
        if self.line_dirty.get() {
            self.write_terminal("\n");
            self.line_dirty.set(false);
        }
        self.log.borrow_mut().push_str(message);
        self.log.borrow_mut().push('\n');
        self.write_terminal(message);
        self.write_terminal("\n");
    }

    /// Rewrites the current terminal line, Ninja style. Falls back to a
    /// plain line when stdout is not a terminal or verbose output is on.
    pub fn sameline(&self, message: &str) {
        if !self.term.is_term() || self.verbose.get() {
            self.line(message);
            return;
        }
        self.log.borrow_mut().push_str(message);
        self.log.borrow_mut().push('\n');
        if !self.quiet.get() {
            let width = self.term.size().1 as usize;
            let clipped: String = message.chars().take(width.saturating_sub(1)).collect();
            let _ = self.term.clear_line();
            let _ = self.term.write_str(&clipped);
        }
        self.line_dirty.set(true);
    }

    /// Everything printed so far, newline separated.
    pub fn log_text(&self) -> String {
        self.log.borrow().clone()
    }

    pub(crate) fn is_quiet(&self) -> bool {
        self.quiet.get()
    }

    /// Applies a style when color output is enabled.
    pub(crate) fn paint(&self, style: &Style, text: &str) -> String {
        if self.use_color.get() {
            style.apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn write_terminal(&self, text: &str) {
        if !self.quiet.get() {
            let _ = self.term.write_str(text);
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_accumulates_lines() {
        let reporter = Reporter::new();
        reporter.configure(true, false, false);
        reporter.line("first");
        reporter.sameline("second");
        reporter.line("third");
        assert_eq!(reporter.log_text(), "first\nsecond\nthird\n");
    }

    #[test]
    fn paint_is_a_no_op_without_color() {
        let reporter = Reporter::new();
        reporter.configure(true, false, false);
        let styled = reporter.paint(&Style::new().red(), "text");
        assert_eq!(styled, "text");
    }
}
