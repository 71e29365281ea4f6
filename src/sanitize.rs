//! Identifier sanitation and memoized SQL fragments.
//!
//! Identifiers that survive escaping are backtick-quoted; anything matching a
//! bare SQL verb maps to a quoted `invalid` sentinel that can never name a
//! real column. Placeholder groups and prefixed table names are memoized in
//! the sharded cache because batch writes rebuild the same shapes constantly.

use crate::cache::ShardedCache;

/// Sentinel returned for identifiers matching a reserved SQL verb. Callers
/// treat it as an error condition, never as a usable column name.
pub const INVALID_IDENTIFIER: &str = "`invalid`";

const RESERVED_WORDS: [&str; 4] = ["select", "insert", "update", "delete"];

/// Escape an identifier for interpolation into SQL text.
///
/// Reserved verbs yield [`INVALID_IDENTIFIER`]. All other input is filtered
/// to letters, digits, underscore and dot, then backtick-quoted. An input
/// with nothing left after filtering yields empty backticks rather than an
/// unquoted empty string.
pub fn escape_identifier(name: &str) -> String {
    if RESERVED_WORDS.iter().any(|w| name.eq_ignore_ascii_case(w)) {
        return INVALID_IDENTIFIER.to_string();
    }

    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    format!("`{safe}`")
}

/// Build `(?,?,...)` sized to `field_count`, memoized by count.
///
/// A concurrent miss on the same key builds the same string, so a double
/// store is harmless.
pub fn cached_placeholder(field_count: usize, cache: &ShardedCache) -> String {
    let key = format!("placeholder:{field_count}");
    if let Some(values) = cache.get(&key) {
        if let Some(group) = values.first() {
            return group.clone();
        }
    }

    let mut group = String::with_capacity(field_count * 2 + 1);
    group.push('(');
    for i in 0..field_count {
        if i > 0 {
            group.push(',');
        }
        group.push('?');
    }
    group.push(')');
    cache.set(key, vec![group.clone()]);
    group
}

/// Backtick-quote `prefix + name`, memoized per prefixed name.
///
/// Table names come from application code, not user input; they are quoted
/// verbatim without the identifier filter.
pub fn cached_table_name(name: &str, prefix: &str, cache: &ShardedCache) -> String {
    let key = format!("table:{prefix}{name}");
    if let Some(values) = cache.get(&key) {
        if let Some(quoted) = values.first() {
            return quoted.clone();
        }
    }

    let quoted = format!("`{prefix}{name}`");
    cache.set(key, vec![quoted.clone()]);
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_words_rejected() {
        assert_eq!(escape_identifier("select"), INVALID_IDENTIFIER);
        assert_eq!(escape_identifier("SELECT"), INVALID_IDENTIFIER);
        assert_eq!(escape_identifier("Insert"), INVALID_IDENTIFIER);
        assert_eq!(escape_identifier("update"), INVALID_IDENTIFIER);
        assert_eq!(escape_identifier("delete"), INVALID_IDENTIFIER);
    }

    #[test]
    fn test_plain_identifiers_quoted() {
        assert_eq!(escape_identifier("user_name"), "`user_name`");
        assert_eq!(escape_identifier("orders"), "`orders`");
        assert_eq!(escape_identifier("app.users"), "`app.users`");
    }

    #[test]
    fn test_illegal_characters_stripped() {
        assert_eq!(escape_identifier("a;drop"), "`adrop`");
        assert_eq!(escape_identifier("name--"), "`name`");
        assert_eq!(escape_identifier("col`1"), "`col1`");
        assert_eq!(escape_identifier("a b c"), "`abc`");
    }

    #[test]
    fn test_empty_after_filter() {
        assert_eq!(escape_identifier(""), "``");
        assert_eq!(escape_identifier(";;--"), "``");
    }

    #[test]
    fn test_placeholder_shapes() {
        let cache = ShardedCache::new();
        assert_eq!(cached_placeholder(1, &cache), "(?)");
        assert_eq!(cached_placeholder(3, &cache), "(?,?,?)");
        assert_eq!(cached_placeholder(0, &cache), "()");
    }

    #[test]
    fn test_placeholder_idempotent_and_cached() {
        let cache = ShardedCache::new();
        let first = cached_placeholder(5, &cache);
        let second = cached_placeholder(5, &cache);
        assert_eq!(first, second);
        assert_eq!(first, "(?,?,?,?,?)");

        let stats = cache.stats();
        assert_eq!(stats.total_misses(), 1);
        assert_eq!(stats.total_hits(), 1);
    }

    #[test]
    fn test_table_name_prefixed_and_cached() {
        let cache = ShardedCache::new();
        assert_eq!(cached_table_name("users", "app_", &cache), "`app_users`");
        assert_eq!(cached_table_name("users", "app_", &cache), "`app_users`");
        assert_eq!(cached_table_name("users", "", &cache), "`users`");

        let stats = cache.stats();
        assert_eq!(stats.total_hits(), 1);
        assert_eq!(stats.total_misses(), 2);
    }
}
