use crate::external::ExternalSource;
use crate::models::CommentView;
use crate::repo::{Repo, RepoError, RepoResult};

/// Every comment on a page, in a fixed group order:
/// protocol pointers, then local anonymous comments (oldest first), then
/// external comments in the order the external service returned them.
///
/// The external fetch runs concurrently with the store reads and cannot fail
/// the listing; only a store error does.
pub async fn list_comments(
    repo: &dyn Repo,
    external: Option<&dyn ExternalSource>,
    slug: &str,
) -> RepoResult<Vec<CommentView>> {
    let local = async {
        let pointers = repo.list_pointers(slug).await?;
        let anonymous = repo.list_anonymous(slug).await?;
        Ok::<_, RepoError>((pointers, anonymous))
    };
    let remote = async {
        match external {
            Some(source) => source.fetch_comments(slug).await,
            None => Vec::new(),
        }
    };
    let (local, remote) = futures_util::join!(local, remote);
    let (pointers, anonymous) = local?;

    let mut views = Vec::with_capacity(pointers.len() + anonymous.len() + remote.len());
    views.extend(pointers.into_iter().map(CommentView::from));
    views.extend(anonymous.into_iter().map(CommentView::from));
    views.extend(remote);
    Ok(views)
}
