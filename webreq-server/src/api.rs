//! Thin HTTP shell over [`webreq_core::Handler`], matching the wire format
//! of the original `WebRequestAPIServer`: hex-encoded URL/header on the way
//! in, hex-encoded gzip content on the way out, `%Y-%m-%d %H:%M:%S` dates.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use webreq_common::AcceptedStatus;
use webreq_core::Handler;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<Handler>,
}

#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> AxumResponse {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<webreq_common::Error> for ApiError {
    fn from(e: webreq_common::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

fn hex_decode_utf8(field: &str, value: &str) -> Result<String, ApiError> {
    let bytes = hex::decode(value).map_err(|e| bad_request(format!("{field} is not valid hex: {e}")))?;
    String::from_utf8(bytes).map_err(|e| bad_request(format!("{field} is not valid UTF-8: {e}")))
}

fn parse_status_codes(raw: &str) -> Result<AcceptedStatus, ApiError> {
    AcceptedStatus::parse(raw).map_err(|e| bad_request(format!("invalid status_code: {e}")))
}

fn parse_naive_datetime(field: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let naive = NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .map_err(|e| bad_request(format!("invalid {field} (expected '{DATETIME_FORMAT}'): {e}")))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// `POST /` form fields: `url` (hex-encoded UTF-8), `header` (hex-encoded
/// JSON), optional `status_code` (comma-separated ints, default `"200"`),
/// optional `min_date`/`max_date`.
#[derive(Debug, Deserialize)]
pub struct AddRequestForm {
    url: String,
    header: String,
    status_code: Option<String>,
    min_date: Option<String>,
    max_date: Option<String>,
}

pub async fn add_request(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<AddRequestForm>,
) -> Result<Json<Value>, ApiError> {
    let url = hex_decode_utf8("url", &form.url)?;
    let header_json = hex_decode_utf8("header", &form.header)?;
    let header: Value = serde_json::from_str(&header_json)
        .map_err(|e| bad_request(format!("header is not valid JSON: {e}")))?;
    let accepted_status = parse_status_codes(form.status_code.as_deref().unwrap_or("200"))?;
    let min_date = form
        .min_date
        .as_deref()
        .map(|s| parse_naive_datetime("min_date", s))
        .transpose()?;
    let max_date = form
        .max_date
        .as_deref()
        .map(|s| parse_naive_datetime("max_date", s))
        .transpose()?;

    let request_id = state
        .handler
        .add_request(&url, &header, &accepted_status, min_date, max_date)
        .await?;

    Ok(Json(json!({ "request_id": request_id })))
}

#[derive(Debug, Deserialize)]
pub struct GetResponseQuery {
    request_id: Option<i64>,
}

pub async fn get_response(
    State(state): State<AppState>,
    Query(query): Query<GetResponseQuery>,
) -> Result<Json<Value>, ApiError> {
    let request_id = query
        .request_id
        .ok_or_else(|| bad_request("request_id is required"))?;

    let response = state.handler.get_response(request_id).await?;

    Ok(Json(match response {
        Some(r) => json!({
            "ResponseId": r.id,
            "RequestId": r.request_id,
            "Timestamp": r.created_at.to_rfc3339(),
            "StatusCode": r.status_code,
            "Header": r.header,
            "Content": r.content.as_deref().map(hex::encode).unwrap_or_default(),
        }),
        None => json!({}),
    }))
}
