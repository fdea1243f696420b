//! REST API handlers

use super::dto::*;
use super::state::AppState;
use crate::cidr::{self, MAX_PREFIX_LEN};
use crate::Error;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

type ApiResult<T> = Result<Json<DataPayload<T>>, (StatusCode, Json<ErrorPayload>)>;

/// Convert internal error to API response
pub fn error_response(err: Error) -> (StatusCode, Json<ErrorPayload>) {
    let status = match &err {
        Error::Validation(_) | Error::Parse(_) | Error::InvalidArgument(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::PoolExhausted { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::LockTimeout { .. } | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::info!(error = %err, "Request rejected");
    }

    (status, Json(ErrorPayload::new(err.kind(), err.to_string())))
}

fn parse_prefix_lengths(raw: &[i64]) -> Result<Vec<u8>, Error> {
    if raw.is_empty() {
        return Err(Error::Validation(
            "Missing mandatory field 'prefix_lengths'".into(),
        ));
    }
    raw.iter()
        .map(|&p| {
            u8::try_from(p)
                .ok()
                .filter(|&p| p <= MAX_PREFIX_LEN)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Prefix length {} is out of range (0-{})",
                        p, MAX_PREFIX_LEN
                    ))
                })
        })
        .collect()
}

/// Allocate subnets under a key
pub async fn allocate(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> ApiResult<Vec<String>> {
    let Json(req) = payload
        .map_err(|e| error_response(Error::Validation(e.body_text())))?;

    let prefix_lengths = parse_prefix_lengths(&req.prefix_lengths).map_err(error_response)?;
    let pool = state
        .pools
        .select(req.environment.as_deref())
        .map_err(error_response)?;

    let networks = state
        .service
        .allocate(&key, &pool, &prefix_lengths)
        .await
        .map_err(error_response)?;

    Ok(Json(DataPayload::new(
        networks.iter().map(cidr::format).collect(),
    )))
}

/// List subnets held under a key
pub async fn list_allocations(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Vec<String>> {
    let records = state.service.list(&key).await.map_err(error_response)?;
    Ok(Json(DataPayload::new(
        records.iter().map(|r| cidr::format(&r.network)).collect(),
    )))
}

/// Release every subnet held under a key
pub async fn release_allocations(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<ReleaseResponse> {
    let released = state.service.release(&key).await.map_err(error_response)?;
    Ok(Json(DataPayload::new(ReleaseResponse { released })))
}

/// Liveness check
pub async fn health() -> Json<DataPayload<HealthResponse>> {
    Json(DataPayload::new(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefix_lengths() {
        assert_eq!(parse_prefix_lengths(&[24, 0, 32]).unwrap(), vec![24, 0, 32]);
        let bad_inputs: [Vec<i64>; 4] = [vec![], vec![33], vec![-1], vec![24, 300]];
        for bad in bad_inputs {
            assert!(matches!(
                parse_prefix_lengths(&bad),
                Err(Error::Validation(_))
            ));
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Parse("x".into()), StatusCode::BAD_REQUEST),
            (Error::PoolExhausted { prefix_len: 24 }, StatusCode::CONFLICT),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (
                Error::LockTimeout {
                    lock_id: "Allocation".into(),
                    timeout_secs: 1.0,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let kind = err.kind();
            let (status, Json(body)) = error_response(err);
            assert_eq!(status, expected);
            assert_eq!(body.error_type, kind);
        }
    }
}
