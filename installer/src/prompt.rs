//! Operator prompts.
//!
//! The installer asks the operator a small number of binary questions
//! (install an unsigned module, continue despite a configuration conflict)
//! and occasionally for a path. [`Prompter`] abstracts the terminal so the
//! core can be driven non-interactively and tested with mocks.

use std::cell::RefCell;
use std::io::{BufRead, Write};

/// Answer to a binary question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Continue with the offered action.
    Proceed,
    /// Stop the installation.
    Abort,
}

/// Asks the operator questions.
#[cfg_attr(test, mockall::automock)]
pub trait Prompter {
    /// Offer a choice between `proceed` and `abort`, returning `default`
    /// when no answer can be obtained.
    fn choose(&self, question: &str, proceed: &str, abort: &str, default: Choice) -> Choice;

    /// Ask for a filesystem path. Returns `None` when the operator gives no
    /// answer.
    fn ask_path(&self, question: &str) -> Option<String>;
}

/// Answers every question with its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn choose(&self, question: &str, proceed: &str, abort: &str, default: Choice) -> Choice {
        let answer = match default {
            Choice::Proceed => proceed,
            Choice::Abort => abort,
        };
        log::info!("{question} -> {answer} (default)");
        default
    }

    fn ask_path(&self, question: &str) -> Option<String> {
        log::info!("{question} -> no answer (non-interactive)");
        None
    }
}

/// Prompts on a line-oriented terminal.
pub struct TerminalPrompter<R, W> {
    input: RefCell<R>,
    output: RefCell<W>,
}

impl<R: BufRead, W: Write> TerminalPrompter<R, W> {
    /// Create a prompter reading answers from `input`.
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: RefCell::new(input),
            output: RefCell::new(output),
        }
    }

    fn read_answer(&self, prompt: &str) -> Option<String> {
        {
            let mut out = self.output.borrow_mut();
            write!(out, "{prompt}").ok()?;
            out.flush().ok()?;
        }
        let mut line = String::new();
        match self.input.borrow_mut().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_owned()),
        }
    }
}

impl<R: BufRead, W: Write> Prompter for TerminalPrompter<R, W> {
    fn choose(&self, question: &str, proceed: &str, abort: &str, default: Choice) -> Choice {
        let default_index = match default {
            Choice::Proceed => 1,
            Choice::Abort => 2,
        };
        let prompt =
            format!("\n{question}\n  1) {proceed}\n  2) {abort}\nSelect [{default_index}]: ");
        match self.read_answer(&prompt).as_deref() {
            Some("1") => Choice::Proceed,
            Some("2") => Choice::Abort,
            _ => default,
        }
    }

    fn ask_path(&self, question: &str) -> Option<String> {
        self.read_answer(&format!("\n{question}\n> "))
            .filter(|answer| !answer.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    #[case::proceed("1\n", Choice::Abort, Choice::Proceed)]
    #[case::abort("2\n", Choice::Proceed, Choice::Abort)]
    #[case::empty_takes_default("\n", Choice::Proceed, Choice::Proceed)]
    #[case::eof_takes_default("", Choice::Abort, Choice::Abort)]
    #[case::garbage_takes_default("maybe\n", Choice::Abort, Choice::Abort)]
    fn terminal_choice(#[case] input: &str, #[case] default: Choice, #[case] expected: Choice) {
        let prompter = TerminalPrompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        assert_eq!(
            prompter.choose("Install unsigned?", "Install", "Abort", default),
            expected
        );
    }

    #[test]
    fn terminal_prompt_shows_both_options() {
        let prompter = TerminalPrompter::new(Cursor::new(b"1\n".to_vec()), Vec::new());
        prompter.choose("Continue?", "Yes", "No", Choice::Abort);
        let shown = String::from_utf8(prompter.output.into_inner()).expect("UTF-8");
        assert!(shown.contains("1) Yes"));
        assert!(shown.contains("2) No"));
        assert!(shown.contains("Select [2]"));
    }

    #[test]
    fn blank_path_answer_is_none() {
        let prompter = TerminalPrompter::new(Cursor::new(b"  \n".to_vec()), Vec::new());
        assert_eq!(prompter.ask_path("Kernel source path?"), None);
    }

    #[test]
    fn non_interactive_returns_defaults() {
        let prompter = NonInteractivePrompter;
        assert_eq!(
            prompter.choose("Continue?", "Yes", "No", Choice::Abort),
            Choice::Abort
        );
        assert_eq!(prompter.ask_path("Path?"), None);
    }
}
