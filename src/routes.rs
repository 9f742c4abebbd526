use std::sync::Arc;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::authz::{self, PointerKey};
use crate::config::Limits;
use crate::error::ApiError;
use crate::external::ExternalSource;
use crate::models::*;
use crate::query;
use crate::rate_limit::{client_identity, RateLimiterFacade};
use crate::repo::{Repo, RepoError};
use crate::slug;

pub fn config(cfg: &mut web::ServiceConfig) {
    // malformed bodies / query strings come back as the usual {error} JSON
    cfg.app_data(
        web::JsonConfig::default()
            .content_type_required(false)
            .error_handler(|err, _req| ApiError::Validation(format!("invalid JSON body: {err}")).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::Validation(format!("invalid query string: {err}")).into()),
    );
    cfg.service(
        web::scope("/api")
            .service(web::resource("/comments").route(web::get().to(list_comments)))
            .service(
                web::resource("/index")
                    .route(web::post().to(index_pointer))
                    .route(web::delete().to(delete_pointer)),
            )
            .service(
                web::resource("/comment")
                    .route(web::post().to(create_comment))
                    .route(web::delete().to(delete_comment)),
            ),
    );
    cfg.route("/healthz", web::get().to(healthz));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub external: Option<Arc<dyn ExternalSource>>,
    pub rate_limiter: Option<RateLimiterFacade>,
    pub limits: Limits,
}

impl AppState {
    /// No external source, no rate limiting, default limits.
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo, external: None, rate_limiter: None, limits: Limits::default() }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalSource>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiterFacade) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
}

/// Body of `POST /api/index`. `did`/`rkey` are accepted as aliases.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequest {
    #[serde(alias = "did")]
    pub author_id: Option<String>,
    #[serde(alias = "rkey")]
    pub record_key: Option<String>,
    pub page: Option<String>,
    pub position_x: Option<i64>,
    pub position_y: Option<i64>,
    pub text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub handle: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexDeleteRequest {
    #[serde(alias = "did")]
    pub author_id: Option<String>,
    #[serde(alias = "rkey")]
    pub record_key: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewCommentRequest {
    pub page: Option<String>,
    pub text: Option<String>,
    pub position_x: Option<i64>,
    pub position_y: Option<i64>,
    /// Display name, unauthenticated.
    pub author: Option<String>,
    /// Only its salted hash is kept.
    pub email: Option<String>,
    pub reply_to: Option<Id>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct DeleteCommentRequest {
    pub id: Option<Id>,
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RemovedResponse {
    pub ok: bool,
    pub removed: u64,
}

/// The delete token is only ever returned here.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatedCommentResponse {
    pub ok: bool,
    pub id: Id,
    pub token: String,
    pub hash: String,
}

/// Every field flagged as absent, in declaration order.
fn missing(fields: &[(&'static str, bool)]) -> ApiError {
    ApiError::MissingFields(fields.iter().filter(|(_, absent)| *absent).map(|(name, _)| *name).collect())
}

fn check_text_len(text: &str, limits: &Limits) -> Result<(), ApiError> {
    if text.chars().count() > limits.max_text_len {
        return Err(ApiError::Validation(format!("text exceeds maximum length of {} characters", limits.max_text_len)));
    }
    Ok(())
}

/// Short public hash for avatars: salted SHA-256 of the email, or of the client identity.
pub fn author_hash(salt: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(seed.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

#[utoipa::path(
    get,
    path = "/api/comments",
    params(("page" = String, Query, description = "Page identifier (sanitized to a slug)")),
    responses(
        (status = 200, description = "Pointers, then anonymous comments, then external comments", body = [CommentView]),
        (status = 400, description = "Missing page parameter")
    )
)]
pub async fn list_comments(data: web::Data<AppState>, params: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    let page = params
        .page
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::Validation("missing ?page= parameter".into()))?;
    let slug = slug::sanitize(page);
    let views = query::list_comments(data.repo.as_ref(), data.external.as_deref(), &slug).await?;
    Ok(HttpResponse::Ok().json(views))
}

#[utoipa::path(
    post,
    path = "/api/index",
    request_body = IndexRequest,
    responses(
        (status = 200, description = "Pointer stored (replaces any pointer with the same authorId + recordKey)", body = OkResponse),
        (status = 400, description = "Missing or invalid fields"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn index_pointer(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<IndexRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let (author_id, record_key, page) = match (body.author_id, body.record_key, body.page) {
        (Some(a), Some(r), Some(p)) => (a, r, p),
        (a, r, p) => return Err(missing(&[("authorId", a.is_none()), ("recordKey", r.is_none()), ("page", p.is_none())])),
    };
    if author_id.trim().is_empty() || record_key.trim().is_empty() {
        return Err(ApiError::Validation("authorId and recordKey must not be empty".into()));
    }
    if let Some(text) = &body.text {
        check_text_len(text, &data.limits)?;
    }

    if let Some(rl) = &data.rate_limiter {
        let ip = client_identity(&req, data.limits.trust_proxy);
        if !rl.allow_index(&ip) {
            metrics::increment_counter!("smudge_rate_limited_total", "action" => "index");
            tracing::info!(%ip, "pointer index rate limited");
            return Err(ApiError::RateLimited);
        }
    }

    let pointer = ProtocolPointer {
        page: slug::sanitize(&page),
        author_id,
        record_key,
        position_x: body.position_x,
        position_y: body.position_y,
        text: body.text,
        created_at: body.created_at,
        handle: body.handle.filter(|h| !h.is_empty()),
        reply_to: body.reply_to,
    };
    tracing::debug!(page = %pointer.page, author = %pointer.author_id, rkey = %pointer.record_key, "indexing pointer");
    data.repo.upsert_pointer(pointer).await?;
    metrics::increment_counter!("smudge_pointers_indexed_total");
    Ok(HttpResponse::Ok().json(OkResponse { ok: true }))
}

#[utoipa::path(
    delete,
    path = "/api/index",
    request_body = IndexDeleteRequest,
    responses(
        (status = 200, description = "Number of pointers removed (0 when nothing matched)", body = RemovedResponse),
        (status = 400, description = "Missing fields")
    )
)]
pub async fn delete_pointer(data: web::Data<AppState>, payload: web::Json<IndexDeleteRequest>) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let (author_id, record_key, page) = match (body.author_id, body.record_key, body.page) {
        (Some(a), Some(r), Some(p)) => (a, r, p),
        (a, r, p) => return Err(missing(&[("authorId", a.is_none()), ("recordKey", r.is_none()), ("page", p.is_none())])),
    };
    let key = PointerKey { page: slug::sanitize(&page), author_id, record_key };
    let removed = authz::delete_pointer(data.repo.as_ref(), &key).await?;
    Ok(HttpResponse::Ok().json(RemovedResponse { ok: true, removed }))
}

#[utoipa::path(
    post,
    path = "/api/comment",
    request_body = NewCommentRequest,
    responses(
        (status = 201, description = "Comment stored; the token is the only way to delete it", body = CreatedCommentResponse),
        (status = 400, description = "Missing or invalid fields"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_comment(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<NewCommentRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    let (page, text, position_x, position_y) = match (body.page, body.text, body.position_x, body.position_y) {
        (Some(p), Some(t), Some(x), Some(y)) => (p, t, x, y),
        (p, t, x, y) => {
            return Err(missing(&[
                ("page", p.is_none()),
                ("text", t.is_none()),
                ("positionX", x.is_none()),
                ("positionY", y.is_none()),
            ]))
        }
    };

    let limits = &data.limits;
    if text.trim().is_empty() {
        return Err(ApiError::Validation("text must not be empty".into()));
    }
    check_text_len(&text, limits)?;
    let author = body.author.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
    if author.as_ref().map_or(false, |a| a.chars().count() > limits.max_author_len) {
        return Err(ApiError::Validation(format!("author exceeds maximum length of {} characters", limits.max_author_len)));
    }

    // rejected before the store is touched
    let ip = client_identity(&req, limits.trust_proxy);
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_anonymous(&ip) {
            metrics::increment_counter!("smudge_rate_limited_total", "action" => "anonymous");
            tracing::info!(%ip, "anonymous comment rate limited");
            return Err(ApiError::RateLimited);
        }
    }

    let slug = slug::sanitize(&page);
    if let Some(parent) = body.reply_to {
        match data.repo.get_anonymous(parent).await {
            Ok(p) if p.page == slug => {}
            Ok(_) | Err(RepoError::NotFound) => {
                return Err(ApiError::Validation("replyTo must reference a comment on the same page".into()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    let email = body.email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());
    let hash = author_hash(&limits.hash_salt, email.as_deref().unwrap_or(&ip));
    let comment = data
        .repo
        .insert_anonymous(NewAnonymousComment {
            page: slug,
            text,
            position_x,
            position_y,
            created_at: None,
            author,
            email_hash: Some(hash.clone()),
            reply_to: body.reply_to,
            client_ip: ip,
        })
        .await?;
    metrics::increment_counter!("smudge_anonymous_created_total");
    tracing::info!(id = comment.id, page = %comment.page, "anonymous comment created");
    Ok(HttpResponse::Created().json(CreatedCommentResponse { ok: true, id: comment.id, token: comment.delete_token, hash }))
}

#[utoipa::path(
    delete,
    path = "/api/comment",
    request_body = DeleteCommentRequest,
    responses(
        (status = 200, description = "Comment deleted", body = OkResponse),
        (status = 400, description = "Missing id or token"),
        (status = 403, description = "Unknown id or wrong token (indistinguishable)")
    )
)]
pub async fn delete_comment(data: web::Data<AppState>, payload: web::Json<DeleteCommentRequest>) -> Result<HttpResponse, ApiError> {
    let body = payload.into_inner();
    authz::delete_anonymous(data.repo.as_ref(), body.id, body.token.as_deref()).await?;
    metrics::increment_counter!("smudge_anonymous_deleted_total");
    Ok(HttpResponse::Ok().json(OkResponse { ok: true }))
}

pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_hash_is_short_salted_and_stable() {
        let a = author_hash("salt", "me@example.org");
        assert_eq!(a.len(), 12);
        assert_eq!(a, author_hash("salt", "me@example.org"));
        assert_ne!(a, author_hash("other", "me@example.org"));
    }
}
