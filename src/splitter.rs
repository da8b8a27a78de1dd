//! Quote-aware splitting of raw SQL input into statements.
//!
//! One implementation serves every caller: the interactive loop, file
//! execution, benchmark loading and multi-statement detection. Semicolons
//! inside single- or double-quoted regions do not terminate a statement.
//! Escape sequences are not modeled; a quote character closes the region
//! it opened.

/// Statement terminator
pub const TERMINATOR: char = ';';

/// Split raw input into individual statements.
///
/// Returns trimmed, non-empty statements. Input without a trailing
/// terminator yields its remainder as a final statement.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;

    for ch in input.chars() {
        match in_quote {
            Some(quote) => {
                current.push(ch);
                if ch == quote {
                    in_quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    current.push(ch);
                    in_quote = Some(ch);
                }
                TERMINATOR => {
                    push_trimmed(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }

    push_trimmed(&mut statements, &current);
    statements
}

/// True when the input holds more than one statement.
pub fn is_multi_statement(input: &str) -> bool {
    split_statements(input).len() > 1
}

fn push_trimmed(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}
