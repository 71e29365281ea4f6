//! Integration tests for statement assembly: builder composition,
//! condition tie-breaks, identifier escaping, and the argument macros.

use joist::{QueryBuilder, SqlValue, params, record};

#[test]
fn test_bare_select() {
    let (sql, args) = QueryBuilder::new("`users`").build();
    assert_eq!(sql, "SELECT * FROM `users`");
    assert!(args.is_empty());
}

#[test]
fn test_chained_and_conditions() {
    let (sql, args) = QueryBuilder::new("`users`")
        .where_("age > ?", params![18])
        .where_("status = ?", params![1])
        .build();
    assert_eq!(
        sql,
        "SELECT * FROM `users` WHERE age > ? AND status = ?"
    );
    assert_eq!(args, params![18, 1]);
}

#[test]
fn test_or_rewrites_the_whole_clause() {
    let (sql, _) = QueryBuilder::new("`users`")
        .where_("age > ?", params![18])
        .or_where("vip = ?", params![true])
        .build();
    assert_eq!(
        sql,
        "SELECT * FROM `users` WHERE (age > ? OR vip = ?)"
    );
}

#[test]
fn test_not_wraps_in_and_parens() {
    let (sql, _) = QueryBuilder::new("`users`")
        .where_("age > ?", params![18])
        .not_where("banned = ?", params![true])
        .build();
    assert_eq!(
        sql,
        "SELECT * FROM `users` WHERE (age > ? AND NOT (banned = ?))"
    );
}

#[test]
fn test_or_beats_not_when_both_present() {
    let (sql, _) = QueryBuilder::new("`users`")
        .not_where("banned = ?", params![true])
        .or_where("vip = ?", params![true])
        .build();
    assert_eq!(
        sql,
        "SELECT * FROM `users` WHERE (NOT (banned = ?) OR vip = ?)"
    );
}

#[test]
fn test_projection_quotes_fields() {
    let (sql, _) = QueryBuilder::new("`users`")
        .fields(["id", "name"])
        .build();
    assert_eq!(sql, "SELECT `id`, `name` FROM `users`");
}

#[test]
fn test_pagination_is_one_based() {
    let (page1, _) = QueryBuilder::new("`users`").page(1, 20).build();
    assert_eq!(page1, "SELECT * FROM `users` LIMIT 20");

    let (page3, _) = QueryBuilder::new("`users`").page(3, 20).build();
    assert_eq!(page3, "SELECT * FROM `users` LIMIT 20 OFFSET 40");
}

#[test]
fn test_count_matches_conditions_only() {
    let builder = QueryBuilder::new("`users`")
        .fields(["id"])
        .where_("age > ?", params![18])
        .order_by("id DESC")
        .page(2, 50);
    let (count_sql, count_args) = builder.build_count();
    assert_eq!(count_sql, "SELECT COUNT(*) FROM `users` WHERE age > ?");
    assert_eq!(count_args, params![18]);

    let (sql, _) = builder.build();
    assert_eq!(
        sql,
        "SELECT `id` FROM `users` WHERE age > ? ORDER BY id DESC LIMIT 50 OFFSET 50"
    );
}

#[test]
fn test_for_update_comes_last() {
    let (sql, _) = QueryBuilder::new("`jobs`")
        .where_("state = ?", params!["queued"])
        .limit(1)
        .for_update()
        .build();
    assert_eq!(
        sql,
        "SELECT * FROM `jobs` WHERE state = ? LIMIT 1 FOR UPDATE"
    );
}

#[test]
fn test_params_macro_conversions() {
    let args = params![42, "name", 2.5, true, None::<i64>, Some(7)];
    assert_eq!(args[0], SqlValue::Int(42));
    assert_eq!(args[1], SqlValue::Str("name".to_string()));
    assert_eq!(args[2], SqlValue::Float(2.5));
    assert_eq!(args[3], SqlValue::Bool(true));
    assert_eq!(args[4], SqlValue::Null);
    assert_eq!(args[5], SqlValue::Int(7));
}

#[test]
fn test_record_macro_orders_keys() {
    let rec = record! { "zeta" => 1, "alpha" => 2 };
    let keys: Vec<&str> = rec.keys().map(String::as_str).collect();
    assert_eq!(keys, ["alpha", "zeta"]);
}

#[test]
fn test_escape_identifier_strips_injection() {
    assert_eq!(joist::sanitize::escape_identifier("name"), "`name`");
    assert_eq!(
        joist::sanitize::escape_identifier("name; DROP TABLE users"),
        "`nameDROPTABLEusers`"
    );
    assert_eq!(joist::sanitize::escape_identifier("select"), "`invalid`");
}

#[test]
fn test_placeholder_groups_are_cached() {
    let cache = joist::cache::ShardedCache::new();
    assert_eq!(joist::sanitize::cached_placeholder(3, &cache), "(?,?,?)");
    assert_eq!(joist::sanitize::cached_placeholder(3, &cache), "(?,?,?)");
    let stats = cache.stats();
    assert_eq!(stats.total_misses(), 1);
    assert_eq!(stats.total_hits(), 1);
}
