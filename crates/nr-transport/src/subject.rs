//! NATS subject matching.
//!
//! Subjects are dot-separated tokens. In a pattern `*` matches exactly one
//! token and `>` (last token only) matches one or more remaining tokens.

/// True when `subject` is matched by `pattern`
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => {}
            (Some(p), Some(s)) if p == s && !p.is_empty() => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A subject is publishable when it has no empty tokens and no wildcards
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">" && !t.contains(char::is_whitespace))
}
