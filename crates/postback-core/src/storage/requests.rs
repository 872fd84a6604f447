//! Repository for request database operations.
//!
//! Searches are rendered from the provider-agnostic `Search` model with
//! bound parameters only. Status updates are single-row writes keyed by
//! `request_id`, so concurrent engine runs never interleave within a row.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    error::{CoreError, Result},
    filter::{Field, FilterValue, Search},
    models::{Request, RequestId, RequestStatus},
};

const SELECT_COLUMNS: &str = "SELECT request_id, postage_code, tracking_code, status, retries, \
                              callback, reason, created_at, updated_at FROM requests";

/// Repository for request database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Finds requests matching every predicate of `search`.
    ///
    /// Rows are ordered by creation time and ID so offset pagination is
    /// stable across calls.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn search(&self, search: &Search) -> Result<Vec<Request>> {
        let mut builder = build_search_query(search)?;
        let requests = builder.build_query_as::<Request>().fetch_all(&*self.pool).await?;

        Ok(requests)
    }

    /// Finds a request by the provider's postage code.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_postage_code(&self, postage_code: &str) -> Result<Option<Request>> {
        let request =
            sqlx::query_as::<_, Request>(&format!("{SELECT_COLUMNS} WHERE postage_code = $1"))
                .bind(postage_code)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(request)
    }

    /// Writes a new status for a request.
    ///
    /// Persists `status` and `reason` together with the request's current
    /// retry count and provider codes in one row update.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row has the request's ID.
    pub async fn update_status(
        &self,
        request: &Request,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE requests
            SET status = $2, reason = $3, retries = $4, postage_code = $5,
                tracking_code = $6, updated_at = NOW()
            WHERE request_id = $1
            ",
        )
        .bind(request.request_id)
        .bind(status)
        .bind(reason)
        .bind(request.retries)
        .bind(&request.postage_code)
        .bind(&request.tracking_code)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("request {} not found", request.request_id)));
        }

        Ok(())
    }
}

/// Renders a `Search` into a parameterized query.
fn build_search_query(search: &Search) -> Result<QueryBuilder<'_, Postgres>> {
    let mut builder = QueryBuilder::new(SELECT_COLUMNS);

    for (index, predicate) in search.predicates.iter().enumerate() {
        builder.push(if index == 0 { " WHERE " } else { " AND " });
        builder.push(predicate.field.column());
        builder.push(" ");
        builder.push(predicate.operator.sql());
        builder.push(" ");

        let integer_column = predicate.field == Field::Retries;
        if integer_column != matches!(predicate.value, FilterValue::Int(_)) {
            return Err(CoreError::InvalidInput(format!(
                "value {:?} does not fit column {}",
                predicate.value,
                predicate.field.column()
            )));
        }

        match &predicate.value {
            FilterValue::Text(text) => {
                if predicate.field == Field::RequestId {
                    let uuid = uuid::Uuid::parse_str(text).map_err(|e| {
                        CoreError::InvalidInput(format!("invalid request id {text}: {e}"))
                    })?;
                    builder.push_bind(RequestId(uuid));
                } else {
                    builder.push_bind(text.as_str());
                }
            },
            FilterValue::Int(value) => {
                let value = i32::try_from(*value).map_err(|_| {
                    CoreError::InvalidInput(format!("integer filter value out of range: {value}"))
                })?;
                builder.push_bind(value);
            },
            FilterValue::Status(status) => {
                builder.push_bind(*status);
            },
        }
    }

    builder.push(" ORDER BY created_at ASC, request_id ASC");

    if let Some(page) = search.window {
        let limit = i64::try_from(page.limit)
            .map_err(|_| CoreError::InvalidInput("page limit out of range".to_string()))?;
        let offset = i64::try_from(page.offset)
            .map_err(|_| CoreError::InvalidInput("page offset out of range".to_string()))?;
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Operator;

    #[test]
    fn paginated_used_search_renders_bound_parameters() {
        let search =
            Search::new().and(Field::Status, Operator::Eq, RequestStatus::Used).paginate(50, 50);
        let builder = build_search_query(&search).unwrap();

        assert_eq!(
            builder.sql(),
            format!(
                "{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at ASC, request_id ASC \
                 LIMIT $2 OFFSET $3"
            )
        );
    }

    #[test]
    fn errored_search_joins_predicates_with_and() {
        let search = Search::new()
            .and(Field::Retries, Operator::Le, 3)
            .and(Field::Status, Operator::Eq, RequestStatus::Error);
        let builder = build_search_query(&search).unwrap();

        assert_eq!(
            builder.sql(),
            format!(
                "{SELECT_COLUMNS} WHERE retries <= $1 AND status = $2 \
                 ORDER BY created_at ASC, request_id ASC"
            )
        );
    }

    #[test]
    fn malformed_request_id_is_rejected() {
        let search = Search::new().and(Field::RequestId, Operator::Eq, "not-a-uuid");
        assert!(matches!(build_search_query(&search), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn value_type_must_fit_column() {
        let text_for_int = Search::new().and(Field::Retries, Operator::Eq, "1");
        assert!(matches!(build_search_query(&text_for_int), Err(CoreError::InvalidInput(_))));

        let int_for_text = Search::new().and(Field::TrackingCode, Operator::Eq, 7);
        assert!(matches!(build_search_query(&int_for_text), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn oversized_integer_is_rejected() {
        let search = Search::new().and(Field::Retries, Operator::Eq, i64::MAX);
        assert!(matches!(build_search_query(&search), Err(CoreError::InvalidInput(_))));
    }
}
