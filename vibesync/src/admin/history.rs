//! Debug query against change history.

use std::str::FromStr;

use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use super::response::{ok, ApiError};
use crate::backend::replication::Lsn;
use crate::frontend::listener::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "fromLsn")]
    from_lsn: Option<String>,
    #[serde(rename = "toLsn")]
    to_lsn: Option<String>,
    limit: Option<i64>,
}

/// `GET /history?fromLsn=&toLsn=&limit=`.
pub async fn history(
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let from = parse_lsn(query.from_lsn.as_deref())?.unwrap_or(Lsn::ZERO);
    let to = parse_lsn(query.to_lsn.as_deref())?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit <= 0 || limit > MAX_LIMIT {
        return Err(ApiError::validation(&format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    let records = state.context.history.by_lsn_range(from, to, limit).await?;
    Ok(ok(records))
}

fn parse_lsn(value: Option<&str>) -> Result<Option<Lsn>, ApiError> {
    value
        .map(|value| {
            Lsn::from_str(value).map_err(|_| {
                ApiError::validation(&format!("malformed lsn \"{}\"", value))
            })
        })
        .transpose()
}
