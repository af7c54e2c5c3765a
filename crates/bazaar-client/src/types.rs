//! Wire-level types shared by the query and change-feed contracts.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One table row as delivered by the backend.
pub type Row = serde_json::Map<String, Value>;

/// Row-level event class a change-feed subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl EventClass {
    /// Wire name used in channel configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Insert => "INSERT",
            EventClass::Update => "UPDATE",
            EventClass::Delete => "DELETE",
            EventClass::All => "*",
        }
    }

    /// Whether a subscription for `self` wants an event of class `event`.
    pub fn accepts(&self, event: EventClass) -> bool {
        *self == EventClass::All || *self == event
    }

    /// Parse a wire name (`INSERT`, `UPDATE`, `DELETE`, `*`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(EventClass::Insert),
            "UPDATE" => Some(EventClass::Update),
            "DELETE" => Some(EventClass::Delete),
            "*" => Some(EventClass::All),
            _ => None,
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operator of a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Membership in a parenthesised list: `(a,b,c)`.
    In,
    /// `IS NULL` / `IS TRUE` style checks.
    Is,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::In => "in",
            FilterOp::Is => "is",
        }
    }
}

/// A single `column op value` row filter.
///
/// Renders as `column=op.value`, the expression syntax shared by the REST
/// query string and the change-feed channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.to_string(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn neq(column: impl Into<String>, value: impl ToString) -> Self {
        Self::new(column, FilterOp::Neq, value)
    }

    pub fn lt(column: impl Into<String>, value: impl ToString) -> Self {
        Self::new(column, FilterOp::Lt, value)
    }

    pub fn gt(column: impl Into<String>, value: impl ToString) -> Self {
        Self::new(column, FilterOp::Gt, value)
    }

    /// `column IS NULL`.
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Is, "null")
    }

    /// Membership filter. Values are sorted so equal sets render equally.
    pub fn in_list<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let mut values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        values.sort();
        values.dedup();
        Self::new(column, FilterOp::In, format!("({})", values.join(",")))
    }

    /// Operator and value as a query-string value (`eq.42`).
    pub fn query_value(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.value)
    }

    /// Full filter expression (`conversation_id=eq.42`).
    pub fn expression(&self) -> String {
        format!("{}={}", self.column, self.query_value())
    }

    /// Operand inside a logical group (`created_at.lt.X`). Values holding
    /// reserved characters are double-quoted; `in` lists keep their parens.
    pub fn group_operand(&self) -> String {
        let reserved = self.op != FilterOp::In && self.value.contains([',', '(', ')']);
        if reserved {
            format!("{}.{}.\"{}\"", self.column, self.op.as_str(), self.value)
        } else {
            format!("{}.{}.{}", self.column, self.op.as_str(), self.value)
        }
    }

    /// Evaluate the filter against a row.
    pub fn matches(&self, row: &Row) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Is => match self.value.as_str() {
                "null" => field.is_null(),
                "true" => field == &Value::Bool(true),
                "false" => field == &Value::Bool(false),
                _ => false,
            },
            FilterOp::In => {
                let Some(text) = value_text(field) else {
                    return false;
                };
                self.value
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .split(',')
                    .any(|candidate| candidate == text)
            }
            op => {
                if field.is_null() {
                    return false;
                }
                let ordering = compare_json(field, &Value::String(self.value.clone()));
                match op {
                    FilterOp::Eq => ordering == Ordering::Equal,
                    FilterOp::Neq => ordering != Ordering::Equal,
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Lte => ordering != Ordering::Greater,
                    FilterOp::Gt => ordering == Ordering::Greater,
                    FilterOp::Gte => ordering != Ordering::Less,
                    FilterOp::In | FilterOp::Is => unreachable!("handled above"),
                }
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    pub(crate) fn query_value(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

/// A filtered, ordered, limited read of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub table: String,
    /// Column list, including embedded joins (`*, sender:profiles(*)`).
    pub columns: String,
    pub filters: Vec<Filter>,
    /// Alternatives: when non-empty, a row must satisfy every filter of at
    /// least one group.
    pub any_of: Vec<Vec<Filter>>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            any_of: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn any_of(mut self, groups: Vec<Vec<Filter>>) -> Self {
        self.any_of = groups;
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    /// Whether `row` satisfies the alternatives. True when there are none.
    pub fn matches_any(&self, row: &Row) -> bool {
        self.any_of.is_empty()
            || self
                .any_of
                .iter()
                .any(|group| group.iter().all(|f| f.matches(row)))
    }

    /// The alternatives as a PostgREST `or` value: `(a.lt.1,and(a.eq.1,id.lt.x))`.
    pub fn any_of_expression(&self) -> Option<String> {
        if self.any_of.is_empty() {
            return None;
        }
        let groups: Vec<String> = self
            .any_of
            .iter()
            .map(|group| {
                let operands: Vec<String> = group.iter().map(Filter::group_operand).collect();
                match operands.as_slice() {
                    [single] => single.clone(),
                    _ => format!("and({})", operands.join(",")),
                }
            })
            .collect();
        Some(format!("({})", groups.join(",")))
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Identifies one logical change-feed subscription.
///
/// Two scopes are equal iff table, event class and filter are all equal.
/// A scope never changes after a subscription is created from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    table: String,
    event: EventClass,
    filter: Option<Filter>,
}

impl Scope {
    pub fn new(table: impl Into<String>, event: EventClass) -> Self {
        Self {
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn event(&self) -> EventClass {
        self.event
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Whether a change event falls inside this scope.
    pub fn admits(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.event.accepts(event.event) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => {
                event.new_row.as_ref().is_some_and(|row| filter.matches(row))
                    || event.old_row.as_ref().is_some_and(|row| filter.matches(row))
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.event)?;
        if let Some(filter) = &self.filter {
            write!(f, ":{}", filter)?;
        }
        Ok(())
    }
}

/// One row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Never [`EventClass::All`].
    pub event: EventClass,
    pub table: String,
    /// Row after the change (inserts and updates).
    pub new_row: Option<Row>,
    /// Row before the change (updates and deletes, when replica identity allows).
    pub old_row: Option<Row>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            event: EventClass::Insert,
            table: table.into(),
            new_row: Some(row),
            old_row: None,
            commit_timestamp: None,
        }
    }

    pub fn update(table: impl Into<String>, row: Row) -> Self {
        Self {
            event: EventClass::Update,
            table: table.into(),
            new_row: Some(row),
            old_row: None,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: impl Into<String>, old_row: Row) -> Self {
        Self {
            event: EventClass::Delete,
            table: table.into(),
            new_row: None,
            old_row: Some(old_row),
            commit_timestamp: None,
        }
    }

    /// Value of `column` in the new row, falling back to the old row.
    pub fn column(&self, column: &str) -> Option<&Value> {
        self.new_row
            .as_ref()
            .and_then(|row| row.get(column))
            .or_else(|| self.old_row.as_ref().and_then(|row| row.get(column)))
    }
}

/// Message delivered to a change-feed callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A row changed inside the subscribed scope.
    Change(ChangeEvent),
    /// The remote stream was lost without the subscriber asking for it.
    Disconnected { reason: String },
}

/// Callback invoked once per change-feed message until unsubscribed.
pub type FeedCallback = Arc<dyn Fn(FeedMessage) + Send + Sync>;

/// Transport-side token for one confirmed remote subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteSubscription {
    pub id: u64,
    pub topic: String,
}

/// Render a scalar JSON value the way filters compare it.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Total order over scalar JSON values.
///
/// Timestamps compare chronologically and numbers numerically, even when
/// one side is a string; everything else falls back to text order.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    let (Some(a), Some(b)) = (value_text(a), value_text(b)) else {
        return a.to_string().cmp(&b.to_string());
    };

    if let (Ok(x), Ok(y)) = (
        DateTime::parse_from_rfc3339(&a),
        DateTime::parse_from_rfc3339(&b),
    ) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_expression() {
        assert_eq!(
            Filter::eq("conversation_id", 42).expression(),
            "conversation_id=eq.42"
        );
        assert_eq!(Filter::is_null("read_at").expression(), "read_at=is.null");
    }

    #[test]
    fn test_in_list_is_order_insensitive() {
        let a = Filter::in_list("id", ["p2", "p1", "p3"]);
        let b = Filter::in_list("id", ["p3", "p1", "p2", "p1"]);
        assert_eq!(a, b);
        assert_eq!(a.expression(), "id=in.(p1,p2,p3)");
    }

    #[test]
    fn test_filter_matches_numbers_and_strings() {
        let r = row(json!({"id": 7, "user_id": "u1", "read": false}));
        assert!(Filter::eq("id", 7).matches(&r));
        assert!(Filter::eq("user_id", "u1").matches(&r));
        assert!(Filter::neq("user_id", "u2").matches(&r));
        assert!(Filter::lt("id", 10).matches(&r));
        assert!(!Filter::gt("id", 10).matches(&r));
        assert!(Filter::new("read", FilterOp::Is, "false").matches(&r));
        assert!(Filter::in_list("id", [1, 7]).matches(&r));
        assert!(!Filter::eq("missing", "x").matches(&r));
    }

    #[test]
    fn test_filter_compares_timestamps_chronologically() {
        // Lexicographic order would put ".5Z" before "Z".
        let r = row(json!({"created_at": "2024-05-01T10:00:00.5Z"}));
        assert!(Filter::gt("created_at", "2024-05-01T10:00:00Z").matches(&r));
        assert!(Filter::lt("created_at", "2024-05-01T10:00:01+00:00").matches(&r));
    }

    #[test]
    fn test_is_null() {
        let r = row(json!({"read_at": null, "other": 1}));
        assert!(Filter::is_null("read_at").matches(&r));
        assert!(Filter::is_null("absent").matches(&r));
        assert!(!Filter::is_null("other").matches(&r));
    }

    #[test]
    fn test_scope_equality_covers_all_fields() {
        let a = Scope::new("messages", EventClass::Insert).with_filter(Filter::eq("c", 1));
        let b = Scope::new("messages", EventClass::Insert).with_filter(Filter::eq("c", 1));
        let c = Scope::new("messages", EventClass::All).with_filter(Filter::eq("c", 1));
        let d = Scope::new("messages", EventClass::Insert).with_filter(Filter::eq("c", 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.to_string(), "messages:INSERT:c=eq.1");
    }

    #[test]
    fn test_scope_admits() {
        let scope = Scope::new("messages", EventClass::Insert)
            .with_filter(Filter::eq("conversation_id", "c1"));

        let inside = ChangeEvent::insert("messages", row(json!({"id": "m1", "conversation_id": "c1"})));
        let other_conversation =
            ChangeEvent::insert("messages", row(json!({"id": "m2", "conversation_id": "c2"})));
        let wrong_class = ChangeEvent::update("messages", row(json!({"id": "m1", "conversation_id": "c1"})));
        let wrong_table = ChangeEvent::insert("likes", row(json!({"conversation_id": "c1"})));

        assert!(scope.admits(&inside));
        assert!(!scope.admits(&other_conversation));
        assert!(!scope.admits(&wrong_class));
        assert!(!scope.admits(&wrong_table));
    }

    #[test]
    fn test_keyset_alternatives() {
        let query = Select::new("messages").any_of(vec![
            vec![Filter::lt("created_at", "2024-05-01T10:00:00Z")],
            vec![
                Filter::eq("created_at", "2024-05-01T10:00:00Z"),
                Filter::lt("id", "m10"),
            ],
        ]);
        assert_eq!(
            query.any_of_expression().as_deref(),
            Some("(created_at.lt.2024-05-01T10:00:00Z,and(created_at.eq.2024-05-01T10:00:00Z,id.lt.m10))")
        );

        let older = row(json!({"id": "m99", "created_at": "2024-05-01T09:59:59Z"}));
        let tie_before = row(json!({"id": "m09", "created_at": "2024-05-01T10:00:00+00:00"}));
        let tie_after = row(json!({"id": "m11", "created_at": "2024-05-01T10:00:00Z"}));
        assert!(query.matches_any(&older));
        assert!(query.matches_any(&tie_before));
        assert!(!query.matches_any(&tie_after));
        assert!(Select::new("messages").matches_any(&tie_after));
        assert_eq!(Select::new("messages").any_of_expression(), None);
    }

    #[test]
    fn test_group_operand_quotes_reserved_values() {
        assert_eq!(Filter::eq("body", "a,b").group_operand(), "body.eq.\"a,b\"");
        assert_eq!(Filter::in_list("id", ["b", "a"]).group_operand(), "id.in.(a,b)");
    }

    #[test]
    fn test_event_class_wire_names() {
        for class in [
            EventClass::Insert,
            EventClass::Update,
            EventClass::Delete,
            EventClass::All,
        ] {
            assert_eq!(EventClass::parse(class.as_str()), Some(class));
        }
        assert!(EventClass::All.accepts(EventClass::Delete));
        assert!(!EventClass::Insert.accepts(EventClass::Update));
    }
}
