//! Command line splitting
//!
//! Tokens are separated by white space. Quoted strings stay one token and
//! keep their quotes so that the data parser can tell a string from a
//! number. A backslash before white space, `;` or `#` takes that character
//! literally. `#` at the start of a token comments out the rest of the
//! line, and `;` ends a command.

use crate::error::{Result, TermError};

/// Split a line into commands, each a list of tokens
pub fn split_commands(line: &str) -> Result<Vec<Vec<String>>> {
    let mut commands = Vec::new();
    let mut args: Vec<String> = Vec::new();
    let mut tok = String::new();
    let mut in_tok = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            tok.push(c);
            if c == '\\' {
                if let Some(n) = chars.next() {
                    tok.push(n);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\\' => {
                match chars.peek() {
                    Some(&n) if n.is_whitespace() || n == ';' || n == '#' => {
                        tok.push(n);
                        chars.next();
                    }
                    _ => tok.push('\\'),
                }
                in_tok = true;
            }
            '"' | '\'' => {
                quote = Some(c);
                tok.push(c);
                in_tok = true;
            }
            '#' if !in_tok => break,
            ';' => {
                finish_token(&mut args, &mut tok, &mut in_tok);
                if !args.is_empty() {
                    commands.push(std::mem::take(&mut args));
                }
            }
            c if c.is_whitespace() => finish_token(&mut args, &mut tok, &mut in_tok),
            c => {
                tok.push(c);
                in_tok = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(TermError::InvalidArgument(format!("unterminated {} quote", q)));
    }
    finish_token(&mut args, &mut tok, &mut in_tok);
    if !args.is_empty() {
        commands.push(args);
    }
    Ok(commands)
}

fn finish_token(args: &mut Vec<String>, tok: &mut String, in_tok: &mut bool) {
    if *in_tok {
        args.push(std::mem::take(tok));
        *in_tok = false;
    }
}
