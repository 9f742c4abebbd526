use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Id = i64;

/// Index entry for a comment whose content lives on the author's own data server.
/// Unique across the whole store by `(author_id, record_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolPointer {
    /// Sanitized page slug.
    pub page: String,
    pub author_id: String,
    pub record_key: String,
    pub position_x: Option<i64>,
    pub position_y: Option<i64>,
    pub text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub handle: Option<String>,
    pub reply_to: Option<String>,
}

/// Locally stored anonymous comment.
///
/// This is the storage record and carries write-only fields (`delete_token`,
/// `client_ip`); it is never serialized to API clients. Handlers convert to
/// [`CommentView`] before responding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnonymousComment {
    pub id: Id,
    pub page: String,
    pub text: String,
    pub position_x: i64,
    pub position_y: i64,
    pub created_at: DateTime<Utc>,
    pub author: Option<String>,
    pub email_hash: Option<String>,
    pub reply_to: Option<Id>,
    pub delete_token: String,
    pub client_ip: String,
}

#[derive(Debug, Clone)]
pub struct NewAnonymousComment {
    pub page: String,
    pub text: String,
    pub position_x: i64,
    pub position_y: i64,
    /// Server clock is used when `None`.
    pub created_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub email_hash: Option<String>,
    pub reply_to: Option<Id>,
    pub client_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommentSource {
    Atproto,
    Anonymous,
    External,
}

/// Parent reference: a local comment id or an opaque remote record reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum ReplyRef {
    Local(Id),
    Remote(String),
}

/// Public, read-only shape of any comment returned by `GET /api/comments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub source: CommentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    /// Protocol wire name of `author_id`, read by the embed widget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    /// Protocol wire name of `record_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
}

impl CommentView {
    fn empty(source: CommentSource) -> Self {
        Self {
            source,
            id: None,
            author_id: None,
            record_key: None,
            did: None,
            rkey: None,
            handle: None,
            text: None,
            position_x: None,
            position_y: None,
            created_at: None,
            author: None,
            hash: None,
            reply_to: None,
        }
    }

    pub fn external(
        id: Option<Id>,
        text: String,
        position: (i64, i64),
        created_at: Option<DateTime<Utc>>,
        author: Option<String>,
    ) -> Self {
        Self {
            id,
            text: Some(text),
            position_x: Some(position.0),
            position_y: Some(position.1),
            created_at,
            author,
            ..Self::empty(CommentSource::External)
        }
    }
}

impl From<ProtocolPointer> for CommentView {
    fn from(p: ProtocolPointer) -> Self {
        Self {
            did: Some(p.author_id.clone()),
            rkey: Some(p.record_key.clone()),
            author_id: Some(p.author_id),
            record_key: Some(p.record_key),
            handle: p.handle,
            text: p.text,
            position_x: p.position_x,
            position_y: p.position_y,
            created_at: p.created_at,
            reply_to: p.reply_to.map(ReplyRef::Remote),
            ..Self::empty(CommentSource::Atproto)
        }
    }
}

impl From<AnonymousComment> for CommentView {
    fn from(c: AnonymousComment) -> Self {
        // delete_token and client_ip never leave the store
        Self {
            id: Some(c.id),
            text: Some(c.text),
            position_x: Some(c.position_x),
            position_y: Some(c.position_y),
            created_at: Some(c.created_at),
            author: c.author,
            hash: c.email_hash,
            reply_to: c.reply_to.map(ReplyRef::Local),
            ..Self::empty(CommentSource::Anonymous)
        }
    }
}
