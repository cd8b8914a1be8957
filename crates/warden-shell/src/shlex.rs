//! Quoting for POSIX-compatible shells.
//!
//! We want the composite command to run under any POSIX shell. There are two
//! kinds of quotes in POSIX: single and double. Single quotes cannot contain
//! another single quote, not even escaped; double-quote escaping rules differ
//! from shell to shell. The portable answer is implicit string concatenation:
//! close the single-quoted run, emit the quote inside double quotes, reopen.
//! `don't` is thus quoted as `'don'"'"'t'`.

/// Characters that never need quoting in a POSIX shell word.
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ',' | '+' | '@' | '%')
}

/// Escape a string for interpolation into a single-quoted shell word.
pub fn escape_for_single_quotes(string: &str) -> String {
    string.replace('\'', r#"'"'"'"#)
}

/// Quote a single word, if necessary, for safe use in a POSIX shell command.
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe) {
        word.to_string()
    } else {
        format!("'{}'", escape_for_single_quotes(word))
    }
}

/// Quote and join a sequence of words into one composite command string.
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
