//! Provider-agnostic request query model.
//!
//! A `Search` is a conjunction of `field operator value` predicates plus an
//! optional pagination window. Fields and operators are closed enums so a
//! search can be rendered to SQL with bound parameters only, or evaluated in
//! memory against a `Request`.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use crate::models::{Request, RequestStatus};

/// Queryable request column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// `request_id` column.
    RequestId,
    /// `postage_code` column.
    PostageCode,
    /// `tracking_code` column.
    TrackingCode,
    /// `status` column.
    Status,
    /// `retries` column.
    Retries,
    /// `callback` column.
    Callback,
}

impl Field {
    /// Database column backing the field.
    pub fn column(&self) -> &'static str {
        match self {
            Self::RequestId => "request_id",
            Self::PostageCode => "postage_code",
            Self::TrackingCode => "tracking_code",
            Self::Status => "status",
            Self::Retries => "retries",
            Self::Callback => "callback",
        }
    }

    fn value_of(&self, request: &Request) -> FilterValue {
        match self {
            Self::RequestId => FilterValue::Text(request.request_id.to_string()),
            Self::PostageCode => FilterValue::Text(request.postage_code.clone()),
            Self::TrackingCode => FilterValue::Text(request.tracking_code.clone()),
            Self::Status => FilterValue::Status(request.status),
            Self::Retries => FilterValue::Int(i64::from(request.retries)),
            Self::Callback => FilterValue::Text(request.callback.clone()),
        }
    }
}

/// Comparison operator for a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Operator {
    /// SQL spelling of the operator.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::NotEq => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Text value.
    Text(String),
    /// Integer value.
    Int(i64),
    /// Request status, stored as text.
    Status(RequestStatus),
}

impl FilterValue {
    /// Compares two values the way the database compares the columns.
    ///
    /// Statuses compare as their stored text. Mixing integers with text
    /// is not comparable.
    fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(_), _) | (_, Self::Int(_)) => None,
            (a, b) => Some(a.as_text().cmp(b.as_text())),
        }
    }

    fn as_text(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::Status(status) => status.as_str(),
            Self::Int(_) => "",
        }
    }
}

impl From<RequestStatus> for FilterValue {
    fn from(status: RequestStatus) -> Self {
        Self::Status(status)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Single `field operator value` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    /// Column being compared.
    pub field: Field,
    /// Comparison operator.
    pub operator: Operator,
    /// Value compared against.
    pub value: FilterValue,
}

impl Predicate {
    /// Evaluates the predicate against a request.
    pub fn matches(&self, request: &Request) -> bool {
        self.field
            .value_of(request)
            .compare(&self.value)
            .is_some_and(|ordering| self.operator.accepts(ordering))
    }
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Rows skipped before the window.
    pub offset: usize,
    /// Maximum rows returned.
    pub limit: usize,
}

/// Conjunction of predicates with an optional pagination window.
///
/// # Example
///
/// ```
/// use postback_core::{Field, Operator, RequestStatus, Search};
///
/// let search = Search::new()
///     .and(Field::Status, Operator::Eq, RequestStatus::Used)
///     .paginate(0, 50);
/// assert_eq!(search.predicates.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    /// Predicates that must all hold.
    pub predicates: Vec<Predicate>,
    /// Optional pagination window.
    pub window: Option<Page>,
}

impl Search {
    /// Creates a search matching every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate to the conjunction.
    #[must_use]
    pub fn and(mut self, field: Field, operator: Operator, value: impl Into<FilterValue>) -> Self {
        self.predicates.push(Predicate { field, operator, value: value.into() });
        self
    }

    /// Restricts results to `limit` rows starting at `offset`.
    #[must_use]
    pub fn paginate(mut self, offset: usize, limit: usize) -> Self {
        self.window = Some(Page { offset, limit });
        self
    }

    /// Whether every predicate holds for the request.
    pub fn matches(&self, request: &Request) -> bool {
        self.predicates.iter().all(|predicate| predicate.matches(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: RequestStatus, retries: i32) -> Request {
        let mut request = Request::new("PC1", "TC1", "https://example.com/cb");
        request.status = status;
        request.retries = retries;
        request
    }

    #[test]
    fn errored_search_selects_by_status_and_ceiling() {
        let search = Search::new()
            .and(Field::Retries, Operator::Le, 3)
            .and(Field::Status, Operator::Eq, RequestStatus::Error);

        assert!(search.matches(&request(RequestStatus::Error, 0)));
        assert!(search.matches(&request(RequestStatus::Error, 3)));
        assert!(!search.matches(&request(RequestStatus::Error, 4)));
        assert!(!search.matches(&request(RequestStatus::Used, 1)));
    }

    #[test]
    fn empty_search_matches_everything() {
        assert!(Search::new().matches(&request(RequestStatus::Delivered, 9)));
    }

    #[test]
    fn status_compares_with_text_values() {
        let search = Search::new().and(Field::Status, Operator::Eq, "used");
        assert!(search.matches(&request(RequestStatus::Used, 0)));

        let search = Search::new().and(Field::Status, Operator::NotEq, RequestStatus::Used);
        assert!(!search.matches(&request(RequestStatus::Used, 0)));
    }

    #[test]
    fn mismatched_value_types_never_match() {
        let search = Search::new().and(Field::Retries, Operator::Eq, "1");
        assert!(!search.matches(&request(RequestStatus::Error, 1)));
    }

    #[test]
    fn paginate_sets_window() {
        let search = Search::new().paginate(100, 50);
        assert_eq!(search.window, Some(Page { offset: 100, limit: 50 }));
    }
}
