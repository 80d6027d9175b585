//! Topic-pattern matching for dot-separated routing keys.
//!
//! Patterns use the broker's topic-exchange semantics: `*` matches exactly
//! one segment, `#` matches zero or more segments. The real broker
//! evaluates bindings server-side; the in-memory transport uses this
//! module as the reference implementation of the same rules.

/// Test whether a binding pattern matches a routing key.
///
/// Both arguments are dot-separated words, e.g. pattern `"task.*"` against
/// key `"task.created"`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_at(&pattern, &key)
}

fn matches_at(pattern: &[&str], key: &[&str]) -> bool {
    // ---
    let Some((segment, rest)) = pattern.split_first() else {
        return key.is_empty();
    };

    if *segment == "#" {
        // `#` may swallow any number of key segments, including none.
        return (0..=key.len()).any(|skip| matches_at(rest, &key[skip..]));
    }

    match key.split_first() {
        Some((word, key_rest)) => {
            (*segment == "*" || segment == word) && matches_at(rest, key_rest)
        }
        None => false,
    }
}
