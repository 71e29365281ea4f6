//! SELECT statement builder.
//!
//! Conditions accumulate with one of three combinators. At build time a
//! single tie-break decides the join: if any `or_where` was used, every
//! condition is parenthesized and joined with OR; otherwise if any
//! `not_where` was used, conditions are parenthesized and joined with AND
//! (the NOT wraps each condition at the call site); otherwise plain AND.
//! Mixed AND/OR precedence inside one statement is out of scope — a known
//! limitation, not a bug.
//!
//! `build` consumes the builder: the resulting SQL and argument list are the
//! only things that survive it.

use crate::params::SqlValue;

/// Accumulated WHERE state shared by [`QueryBuilder`] and the table
/// accessor. Tracks which combinators were ever used; the disjunction of
/// those flags picks the join policy at render time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConditionSet {
    conditions: Vec<String>,
    args: Vec<SqlValue>,
    or_seen: bool,
    not_seen: bool,
}

impl ConditionSet {
    pub(crate) fn push_and(&mut self, condition: impl Into<String>, args: Vec<SqlValue>) {
        self.conditions.push(condition.into());
        self.args.extend(args);
    }

    pub(crate) fn push_or(&mut self, condition: impl Into<String>, args: Vec<SqlValue>) {
        self.conditions.push(condition.into());
        self.args.extend(args);
        self.or_seen = true;
    }

    pub(crate) fn push_not(&mut self, condition: impl Into<String>, args: Vec<SqlValue>) {
        self.conditions.push(format!("NOT ({})", condition.into()));
        self.args.extend(args);
        self.not_seen = true;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub(crate) fn args(&self) -> &[SqlValue] {
        &self.args
    }

    pub(crate) fn into_args(self) -> Vec<SqlValue> {
        self.args
    }

    /// Join the accumulated conditions per the combinator tie-break.
    pub(crate) fn render(&self) -> String {
        if self.or_seen {
            let mut out = String::with_capacity(32);
            out.push('(');
            for (i, condition) in self.conditions.iter().enumerate() {
                if i > 0 {
                    out.push_str(" OR ");
                }
                out.push_str(condition);
            }
            out.push(')');
            out
        } else if self.not_seen {
            let mut out = String::with_capacity(32);
            out.push('(');
            for (i, condition) in self.conditions.iter().enumerate() {
                if i > 0 {
                    out.push_str(" AND ");
                }
                out.push_str(condition);
            }
            out.push(')');
            out
        } else {
            self.conditions.join(" AND ")
        }
    }
}

/// Fluent SELECT builder.
///
/// The table name is written into the statement verbatim; `Db::table`
/// passes the prefixed, backtick-quoted name.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    fields: Vec<String>,
    where_set: ConditionSet,
    joins: Vec<String>,
    group_by: String,
    having: String,
    order_by: String,
    limit: i64,
    offset: i64,
    for_update: bool,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            where_set: ConditionSet::default(),
            joins: Vec::new(),
            group_by: String::new(),
            having: String::new(),
            order_by: String::new(),
            limit: 0,
            offset: 0,
            for_update: false,
        }
    }

    /// Set the projected fields. Each name is backtick-quoted in the
    /// statement; an empty list selects `*`.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Add a condition joined with AND (subject to the tie-break policy).
    pub fn where_(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.where_set.push_and(condition, args);
        self
    }

    /// Add a condition joined with OR. Using this at least once switches
    /// every accumulated condition to OR joining.
    pub fn or_where(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.where_set.push_or(condition, args);
        self
    }

    /// Add a negated condition: the condition is stored as `NOT (...)`.
    pub fn not_where(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.where_set.push_not(condition, args);
        self
    }

    /// Add a join clause, written verbatim after the table name.
    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.joins.push(join.into());
        self
    }

    pub fn group_by(mut self, group_by: impl Into<String>) -> Self {
        self.group_by = group_by.into();
        self
    }

    pub fn having(mut self, having: impl Into<String>) -> Self {
        self.having = having.into();
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = order_by.into();
        self
    }

    /// Set LIMIT. Values of zero or below render no clause.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set OFFSET. Values of zero or below render no clause.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// 1-based pagination: LIMIT `page_size`, OFFSET `(page-1)*page_size`.
    /// Page 1 renders no OFFSET; a page below 1 behaves like page 1.
    pub fn page(self, page: i64, page_size: i64) -> Self {
        self.limit(page_size).offset((page - 1) * page_size)
    }

    /// Append `FOR UPDATE` for pessimistic row locking.
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// Assemble the statement and its positional arguments, consuming the
    /// builder. Clause order: fields, table, joins, WHERE, GROUP BY,
    /// HAVING, ORDER BY, LIMIT, OFFSET, FOR UPDATE.
    pub fn build(self) -> (String, Vec<SqlValue>) {
        let mut sql = String::with_capacity(64);
        sql.push_str("SELECT ");

        if self.fields.is_empty() {
            sql.push('*');
        } else {
            sql.push('`');
            sql.push_str(&self.fields.join("`, `"));
            sql.push('`');
        }

        sql.push_str(" FROM ");
        sql.push_str(&self.table);

        if !self.joins.is_empty() {
            sql.push(' ');
            sql.push_str(&self.joins.join(" "));
        }

        if !self.where_set.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_set.render());
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by);
        }

        if !self.having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.having);
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by);
        }

        if self.limit > 0 {
            sql.push_str(" LIMIT ");
            sql.push_str(&self.limit.to_string());
        }

        if self.offset > 0 {
            sql.push_str(" OFFSET ");
            sql.push_str(&self.offset.to_string());
        }

        if self.for_update {
            sql.push_str(" FOR UPDATE");
        }

        (sql, self.where_set.into_args())
    }

    /// Assemble the COUNT statement matching the current conditions:
    /// same table, joins, and WHERE clause, with projection, grouping,
    /// ordering, and pagination dropped.
    pub fn build_count(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::with_capacity(64);
        sql.push_str("SELECT COUNT(*) FROM ");
        sql.push_str(&self.table);

        if !self.joins.is_empty() {
            sql.push(' ');
            sql.push_str(&self.joins.join(" "));
        }

        if !self.where_set.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_set.render());
        }

        (sql, self.where_set.args().to_vec())
    }

    pub(crate) fn table_name(&self) -> &str {
        &self.table
    }

    pub(crate) fn has_conditions(&self) -> bool {
        !self.where_set.is_empty()
    }

    /// Rendered WHERE clause and a copy of its arguments, for statements
    /// assembled outside the builder (UPDATE, DELETE).
    pub(crate) fn where_parts(&self) -> (String, Vec<SqlValue>) {
        (self.where_set.render(), self.where_set.args().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_minimal_select() {
        let (sql, args) = QueryBuilder::new("`users`").build();
        assert_eq!(sql, "SELECT * FROM `users`");
        assert!(args.is_empty());
    }

    #[test]
    fn test_fields_are_quoted() {
        let (sql, _) = QueryBuilder::new("`users`").fields(["id", "name"]).build();
        assert_eq!(sql, "SELECT `id`, `name` FROM `users`");
    }

    #[test]
    fn test_and_conditions_join_plain() {
        let (sql, args) = QueryBuilder::new("`users`")
            .where_("age > ?", params![18])
            .where_("active = ?", params![true])
            .build();
        assert_eq!(
            sql,
            "SELECT * FROM `users` WHERE age > ? AND active = ?"
        );
        assert_eq!(args, params![18, true]);
    }

    #[test]
    fn test_or_parenthesizes_all_conditions() {
        let (sql, args) = QueryBuilder::new("`users`")
            .where_("a = ?", params![1])
            .or_where("b = ?", params![2])
            .build();
        assert_eq!(sql, "SELECT * FROM `users` WHERE (a = ? OR b = ?)");
        assert_eq!(args, params![1, 2]);
    }

    #[test]
    fn test_not_wraps_condition() {
        let (sql, _) = QueryBuilder::new("`users`")
            .where_("a = ?", params![1])
            .not_where("b = ?", params![2])
            .build();
        assert_eq!(
            sql,
            "SELECT * FROM `users` WHERE (a = ? AND NOT (b = ?))"
        );
    }

    #[test]
    fn test_or_wins_the_tie_break() {
        let (sql, _) = QueryBuilder::new("`users`")
            .where_("a = ?", params![1])
            .not_where("b = ?", params![2])
            .or_where("c = ?", params![3])
            .build();
        assert_eq!(
            sql,
            "SELECT * FROM `users` WHERE (a = ? OR NOT (b = ?) OR c = ?)"
        );
    }

    #[test]
    fn test_first_page_renders_no_offset() {
        let (sql, _) = QueryBuilder::new("`users`").page(1, 20).build();
        assert_eq!(sql, "SELECT * FROM `users` LIMIT 20");
    }

    #[test]
    fn test_later_page_offset() {
        let (sql, _) = QueryBuilder::new("`users`").page(3, 20).build();
        assert_eq!(sql, "SELECT * FROM `users` LIMIT 20 OFFSET 40");
    }

    #[test]
    fn test_zero_limit_and_offset_render_nothing() {
        let (sql, _) = QueryBuilder::new("`users`").limit(0).offset(0).build();
        assert_eq!(sql, "SELECT * FROM `users`");
    }

    #[test]
    fn test_full_clause_order() {
        let (sql, args) = QueryBuilder::new("`orders`")
            .fields(["o.id", "u.name"])
            .join("LEFT JOIN `users` u ON u.id = o.user_id")
            .where_("o.total > ?", params![100])
            .group_by("u.id")
            .having("COUNT(*) > 1")
            .order_by("o.id DESC")
            .limit(10)
            .offset(5)
            .for_update()
            .build();
        assert_eq!(
            sql,
            "SELECT `o.id`, `u.name` FROM `orders` \
             LEFT JOIN `users` u ON u.id = o.user_id \
             WHERE o.total > ? \
             GROUP BY u.id \
             HAVING COUNT(*) > 1 \
             ORDER BY o.id DESC \
             LIMIT 10 OFFSET 5 \
             FOR UPDATE"
        );
        assert_eq!(args, params![100]);
    }

    #[test]
    fn test_count_drops_pagination_and_ordering() {
        let builder = QueryBuilder::new("`users`")
            .fields(["id", "name"])
            .where_("age > ?", params![30])
            .order_by("id DESC")
            .limit(10)
            .offset(20);
        let (sql, args) = builder.build_count();
        assert_eq!(sql, "SELECT COUNT(*) FROM `users` WHERE age > ?");
        assert_eq!(args, params![30]);
    }

    #[test]
    fn test_count_keeps_joins() {
        let (sql, _) = QueryBuilder::new("`orders`")
            .join("INNER JOIN `users` u ON u.id = o.user_id")
            .build_count();
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM `orders` INNER JOIN `users` u ON u.id = o.user_id"
        );
    }
}
