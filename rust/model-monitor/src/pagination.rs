//! Keyset cursors for history pages. Pages are ordered newest first, so a
//! cursor names the last row already returned and the next page starts below it.

use crate::error::{MonitorError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub ts: DateTime<Utc>,
    pub id: i64,
}

impl Cursor {
    /// True when a row keyed `(ts, id)` sorts strictly after this cursor in descending order.
    pub fn precedes(&self, ts: DateTime<Utc>, id: i64) -> bool {
        (ts, id) < (self.ts, self.id)
    }
}

pub fn decode_cursor(cursor: &str) -> Result<Cursor> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| MonitorError::InvalidRequest("invalid cursor".into()))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| MonitorError::InvalidRequest("invalid cursor payload".into()))
}

pub fn encode_cursor(cursor: &Cursor) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: i64,
    pub after: Option<Cursor>,
}

impl PageRequest {
    pub fn first(limit: i64) -> Self {
        Self {
            limit: limit.max(1),
            after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Builds a page from up to `limit + 1` fetched rows; the extra row only signals more data.
    pub fn from_rows(mut rows: Vec<T>, limit: i64, key: impl Fn(&T) -> Cursor) -> Self {
        let limit = limit.max(1) as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|row| encode_cursor(&key(row)))
        } else {
            None
        };
        Self {
            results: rows,
            next_cursor,
        }
    }
}
