use crate::models::{CommentSource, CommentView, ProtocolPointer, ReplyRef};
use crate::routes::{
    CreatedCommentResponse, DeleteCommentRequest, IndexDeleteRequest, IndexRequest, NewCommentRequest, OkResponse,
    RemovedResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_comments,
        crate::routes::index_pointer,
        crate::routes::delete_pointer,
        crate::routes::create_comment,
        crate::routes::delete_comment,
    ),
    components(schemas(
        CommentView, CommentSource, ReplyRef, ProtocolPointer,
        IndexRequest, IndexDeleteRequest, NewCommentRequest, DeleteCommentRequest,
        OkResponse, RemovedResponse, CreatedCommentResponse
    )),
    tags(
        (name = "comments", description = "Spatial comment index"),
    )
)]
pub struct ApiDoc;
