use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Error;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

/// API error carrying the wire shape `{detail, code, fields?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    pub code: &'static str,
    pub fields: Option<serde_json::Value>,
}

impl ApiError {
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
            code: "validation",
            fields: None,
        }
    }

    #[must_use]
    pub fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            detail: "Authentication required".to_string(),
            code: "unauthenticated",
            fields: None,
        }
    }

    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            detail: detail.into(),
            code: "forbidden",
            fields: None,
        }
    }

    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
            code: "not_found",
            fields: None,
        }
    }

    #[must_use]
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            detail: detail.into(),
            code: "conflict",
            fields: None,
        }
    }

    #[must_use]
    pub fn precondition_failed(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PRECONDITION_FAILED,
            detail: detail.into(),
            code: "precondition_failed",
            fields: None,
        }
    }

    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
            code: "internal",
            fields: None,
        }
    }

    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            detail: detail.into(),
            code: "unavailable",
            fields: None,
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = Some(fields);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "detail": self.detail, "code": self.code });
        if let Some(fields) = self.fields {
            body["fields"] = fields;
        }
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "WWW-Authenticate",
                "Bearer realm=\"beadhub\"".parse().expect("static header"),
            );
        }
        response
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(_) | Error::Io(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let detail = match &err {
            Error::NotFound => "Not found".to_string(),
            Error::Unauthenticated => "Authentication required".to_string(),
            Error::Database(_) | Error::Io(_) | Error::Internal(_) => {
                tracing::error!("internal error: {err}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status,
            detail,
            code: err.code(),
            fields: None,
        }
    }
}

/// Opaque pagination cursor: URL-safe base64 of `{"k": sort_key, "id": id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub k: String,
    pub id: String,
}

pub fn encode_cursor(cursor: &Cursor) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

pub fn decode_cursor(raw: &str) -> Result<Cursor, ApiError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| ApiError::bad_request("Invalid cursor"))?;
    serde_json::from_slice(&bytes).map_err(|_| ApiError::bad_request("Invalid cursor"))
}

/// Clamp a requested page size into `[1, MAX_PAGE_SIZE]`.
pub fn effective_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Trim an over-fetched page (`limit + 1` rows) down to `limit`, deriving
/// the next cursor from the last visible row.
pub fn paginate<T, F>(mut items: Vec<T>, limit: usize, cursor_of: F) -> (Vec<T>, Option<String>, bool)
where
    F: Fn(&T) -> Cursor,
{
    let has_more = items.len() > limit;
    items.truncate(limit);
    let next_cursor = if has_more {
        items.last().map(|item| encode_cursor(&cursor_of(item)))
    } else {
        None
    };
    (items, next_cursor, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            k: "2026-01-02T03:04:05Z".to_string(),
            id: "bd-42".to_string(),
        };
        let decoded = decode_cursor(&encode_cursor(&cursor)).unwrap();
        assert_eq!(decoded.k, cursor.k);
        assert_eq!(decoded.id, cursor.id);
    }

    #[test]
    fn bad_cursor_is_validation_error() {
        assert!(decode_cursor("not base64 at all!").is_err());
    }

    #[test]
    fn limits_clamp() {
        assert_eq!(effective_limit(None), DEFAULT_PAGE_SIZE);
        assert_eq!(effective_limit(Some(0)), 1);
        assert_eq!(effective_limit(Some(10_000)), MAX_PAGE_SIZE);
    }

    #[test]
    fn paginate_trims_and_links() {
        let items = vec![1, 2, 3];
        let (page, next, has_more) = paginate(items, 2, |n| Cursor {
            k: n.to_string(),
            id: n.to_string(),
        });
        assert_eq!(page, vec![1, 2]);
        assert!(has_more);
        let cursor = decode_cursor(&next.unwrap()).unwrap();
        assert_eq!(cursor.id, "2");
    }
}
