//! Line editor helper: command completion, colouring and quote validation

use std::borrow::Cow;

use colored::Colorize;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Context, Helper};

use crate::commands::{find_command, COMMANDS};
use crate::tokenize::split_commands;

/// rustyline helper for the terminal
#[derive(Helper, Default)]
pub struct TermHelper;

impl TermHelper {
    /// Create a helper
    pub fn new() -> Self {
        Self
    }
}

// Start of the command word the cursor is in, if it is the first word of a command
fn command_word_start(line: &str, pos: usize) -> Option<usize> {
    let head = &line[..pos];
    let cmd_start = head.rfind(';').map_or(0, |i| i + 1);
    let word = &head[cmd_start..];
    let trimmed = word.trim_start();
    if trimmed.contains(char::is_whitespace) {
        return None;
    }
    Some(pos - trimmed.len())
}

impl Completer for TermHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        let Some(start) = command_word_start(line, pos) else {
            return Ok((pos, Vec::new()));
        };
        let prefix = line[start..pos].to_ascii_lowercase();
        let candidates = COMMANDS
            .iter()
            .filter(|c| c.name.len() > 1 && c.name.starts_with(&prefix))
            .map(|c| Pair {
                display: format!("{:<8} {}", c.name, c.help.dimmed()),
                replacement: format!("{} ", c.name),
            })
            .collect();
        Ok((start, candidates))
    }
}

impl Validator for TermHelper {
    fn validate(&self, ctx: &mut ValidationContext<'_>) -> rustyline::Result<ValidationResult> {
        // an open quote continues on the next line
        match split_commands(ctx.input()) {
            Err(_) => Ok(ValidationResult::Incomplete),
            Ok(_) => Ok(ValidationResult::Valid(None)),
        }
    }
}

impl Hinter for TermHelper {
    type Hint = String;

    fn hint(&self, _line: &str, _pos: usize, _ctx: &Context<'_>) -> Option<String> {
        None
    }
}

impl Highlighter for TermHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let body_end = line.find('#').unwrap_or(line.len());
        let mut out = String::with_capacity(line.len() * 2);
        for (n, part) in line[..body_end].split(';').enumerate() {
            if n > 0 {
                out.push(';');
            }
            let lead = part.len() - part.trim_start().len();
            let word_len = part[lead..].find(char::is_whitespace).unwrap_or(part.len() - lead);
            let word = &part[lead..lead + word_len];
            out.push_str(&part[..lead]);
            if !word.is_empty() {
                let coloured = if find_command(word).is_ok() { word.bright_cyan().bold() } else { word.bright_red() };
                out.push_str(&coloured.to_string());
            }
            out.push_str(&part[lead + word_len..]);
        }
        if body_end < line.len() {
            out.push_str(&line[body_end..].dimmed().to_string());
        }
        Cow::Owned(out)
    }

    fn highlight_char(&self, line: &str, _pos: usize, _forced: bool) -> bool {
        !line.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_word_start() {
        assert_eq!(command_word_start("du", 2), Some(0));
        assert_eq!(command_word_start("sig; wr", 7), Some(5));
        assert_eq!(command_word_start("dump fl", 7), None);
    }
}
