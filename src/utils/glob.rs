//! Glob-style key patterns (`*` and `?`) used by pattern invalidation.

use regex::Regex;

/// Compile a glob pattern into an anchored regex.
///
/// `*` matches any run of characters (including `:`), `?` matches one
/// character. Everything else is matched literally.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    // Every non-wildcard character is escaped, so the pattern is always valid.
    Regex::new(&re).expect("escaped glob is a valid regex")
}
