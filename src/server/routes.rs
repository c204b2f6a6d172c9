use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, ClientContext};
use crate::error::Error;

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IssueRequest {
    email: String,
    content_ref: String,
}

#[derive(Deserialize)]
pub(super) struct SecretQuery {
    #[serde(default)]
    t: String,
}

#[derive(Deserialize)]
pub(super) struct VerifyRequest {
    secret: String,
    otp: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessResponse {
    status: &'static str,
    secret: String,
    email: String,
    otp_expires_at: DateTime<Utc>,
    otp_delivered: bool,
    verify_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeemedResponse {
    content_ref: String,
    used_at: DateTime<Utc>,
}

fn parse_json<T>(body: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError(Error::validation(rejection.body_text())))
}

pub(super) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /tokens`
pub(super) async fn issue_token(
    State(state): State<AppState>,
    body: std::result::Result<Json<IssueRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = parse_json(body)?;
    let issued = state
        .service
        .issuer()
        .issue(&request.email, &request.content_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

/// `GET /tokens/access?t=`
pub(super) async fn access_link(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    Query(query): Query<SecretQuery>,
) -> ApiResult<Response> {
    let challenge = state.service.gate().visit_link(&query.t, &ctx).await?;
    let verify_url = format!(
        "{}/otp/verify",
        state.service.config().base_url.trim_end_matches('/')
    );

    Ok(Json(AccessResponse {
        status: "otp_sent",
        secret: query.t.trim().to_string(),
        email: challenge.masked_email,
        otp_expires_at: challenge.otp_expires_at,
        otp_delivered: challenge.otp_delivered,
        verify_url,
    })
    .into_response())
}

/// `POST /otp/verify`
///
/// `inline` 模式直接返回内容引用；`redirect` 模式返回 303 到内容查看地址。
pub(super) async fn verify_otp(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    body: std::result::Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = parse_json(body)?;
    let redemption = state
        .service
        .gate()
        .submit_otp(&request.secret, &request.otp, request.email.as_deref(), &ctx)
        .await?;

    if redemption.grant.is_some() {
        return Ok(Json(RedeemedResponse {
            content_ref: redemption.content_ref,
            used_at: redemption.used_at,
        })
        .into_response());
    }

    let location = state
        .service
        .config()
        .content_view_link(request.secret.trim())?;
    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response())
}

/// `GET /content/view?t=`
pub(super) async fn view_content(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    Query(query): Query<SecretQuery>,
) -> ApiResult<Response> {
    let grant = state.service.gate().view_content(&query.t, &ctx).await?;
    Ok(Json(grant).into_response())
}
