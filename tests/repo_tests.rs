#![cfg(feature = "inmem-store")]

use chrono::{TimeZone, Utc};
use smudge::{
    models::{NewAnonymousComment, ProtocolPointer},
    repo::{inmem::InMemRepo, RepoError},
};
// Bring trait method namespaces into scope so calls on InMemRepo resolve.
use smudge::repo::{AnonymousRepo, PointerRepo};

fn pointer(page: &str, author: &str, rkey: &str) -> ProtocolPointer {
    ProtocolPointer {
        page: page.into(),
        author_id: author.into(),
        record_key: rkey.into(),
        position_x: Some(10),
        position_y: Some(20),
        text: Some(format!("{author}/{rkey}")),
        created_at: None,
        handle: None,
        reply_to: None,
    }
}

fn anon(page: &str, text: &str) -> NewAnonymousComment {
    NewAnonymousComment {
        page: page.into(),
        text: text.into(),
        position_x: 1,
        position_y: 2,
        created_at: None,
        author: None,
        email_hash: None,
        reply_to: None,
        client_ip: "127.0.0.1".into(),
    }
}

#[tokio::test]
async fn upsert_replaces_across_pages() {
    let r = InMemRepo::ephemeral();
    r.upsert_pointer(pointer("a", "did:plc:x", "k1")).await.unwrap();
    r.upsert_pointer(pointer("b", "did:plc:x", "k1")).await.unwrap();

    // (author_id, record_key) is unique store-wide, the later page wins
    assert!(r.list_pointers("a").await.unwrap().is_empty());
    let on_b = r.list_pointers("b").await.unwrap();
    assert_eq!(on_b.len(), 1);
    assert_eq!(on_b[0].page, "b");

    // same page, new content replaces in place
    let mut edited = pointer("b", "did:plc:x", "k1");
    edited.text = Some("edited".into());
    r.upsert_pointer(edited).await.unwrap();
    let on_b = r.list_pointers("b").await.unwrap();
    assert_eq!(on_b.len(), 1);
    assert_eq!(on_b[0].text.as_deref(), Some("edited"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_upserts_leave_one_pointer() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::open(dir.path()).unwrap();
    let pages: Vec<String> = (0..16).map(|i| format!("page-{i}")).collect();

    let handles: Vec<_> = pages
        .iter()
        .cloned()
        .map(|page| {
            let r = r.clone();
            tokio::spawn(async move { r.upsert_pointer(pointer(&page, "did:plc:race", "same")).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let mut total = 0;
    for page in &pages {
        total += r.list_pointers(page).await.unwrap().len();
    }
    assert_eq!(total, 1);

    // the snapshot agrees with memory
    let reopened = InMemRepo::open(dir.path()).unwrap();
    let mut on_disk = 0;
    for page in &pages {
        on_disk += reopened.list_pointers(page).await.unwrap().len();
    }
    assert_eq!(on_disk, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_insert_still_commits_before_the_next_write() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::open(dir.path()).unwrap();

    // poll once so the commit is handed off, then abandon it like a cancelled request
    let mut abandoned = Box::pin(r.insert_anonymous(anon("p", "abandoned")));
    let _ = futures_util::poll!(&mut abandoned);
    drop(abandoned);

    let next = r.insert_anonymous(anon("p", "next")).await.unwrap();
    assert_eq!(next.id, 2);
    let texts: Vec<String> = r.list_anonymous("p").await.unwrap().into_iter().map(|c| c.text).collect();
    assert_eq!(texts.len(), 2);
    assert!(texts.contains(&"abandoned".to_string()));

    let reopened = InMemRepo::open(dir.path()).unwrap();
    assert_eq!(reopened.list_anonymous("p").await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_during_writes_never_go_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let r = InMemRepo::open(dir.path()).unwrap();

    let writers: Vec<_> = (0..12)
        .map(|i| {
            let r = r.clone();
            tokio::spawn(async move { r.insert_anonymous(anon("p", &format!("w{i}"))).await })
        })
        .collect();
    let reader = {
        let r = r.clone();
        tokio::spawn(async move {
            let mut seen = 0;
            while seen < 12 {
                let n = r.list_anonymous("p").await.unwrap().len();
                assert!(n >= seen, "listing shrank from {seen} to {n}");
                seen = n;
                tokio::task::yield_now().await;
            }
        })
    };
    for w in writers {
        w.await.unwrap().unwrap();
    }
    reader.await.unwrap();

    let reopened = InMemRepo::open(dir.path()).unwrap();
    assert_eq!(reopened.list_anonymous("p").await.unwrap().len(), 12);
}

#[tokio::test]
async fn delete_pointer_counts_and_scopes_to_page() {
    let r = InMemRepo::ephemeral();
    r.upsert_pointer(pointer("a", "did:plc:x", "k1")).await.unwrap();

    // wrong page removes nothing and is not an error
    assert_eq!(r.delete_pointer("b", "did:plc:x", "k1").await.unwrap(), 0);
    assert_eq!(r.delete_pointer("a", "did:plc:x", "k1").await.unwrap(), 1);
    assert_eq!(r.delete_pointer("a", "did:plc:x", "k1").await.unwrap(), 0);
    assert!(r.list_pointers("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn pointers_without_timestamp_come_first() {
    let r = InMemRepo::ephemeral();
    let mut late = pointer("p", "did:plc:a", "late");
    late.created_at = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
    let mut early = pointer("p", "did:plc:a", "early");
    early.created_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

    r.upsert_pointer(late).await.unwrap();
    r.upsert_pointer(pointer("p", "did:plc:a", "undated1")).await.unwrap();
    r.upsert_pointer(early).await.unwrap();
    r.upsert_pointer(pointer("p", "did:plc:a", "undated2")).await.unwrap();

    let keys: Vec<String> = r.list_pointers("p").await.unwrap().into_iter().map(|p| p.record_key).collect();
    assert_eq!(keys, vec!["undated1", "undated2", "early", "late"]);
}

#[tokio::test]
async fn anonymous_token_flow() {
    let r = InMemRepo::ephemeral();
    let c = r.insert_anonymous(anon("p", "hello")).await.unwrap();
    assert_eq!(c.id, 1);
    assert_eq!(c.delete_token.len(), 64);

    let c2 = r.insert_anonymous(anon("p", "second")).await.unwrap();
    assert_ne!(c.delete_token, c2.delete_token);
    assert!(c2.id > c.id);

    // wrong token and unknown id are both a plain `false`
    assert!(!r.delete_anonymous(c.id, "nope").await.unwrap());
    assert!(!r.delete_anonymous(999, &c.delete_token).await.unwrap());
    // another comment's token does not work either
    assert!(!r.delete_anonymous(c.id, &c2.delete_token).await.unwrap());

    assert!(r.delete_anonymous(c.id, &c.delete_token).await.unwrap());
    assert!(matches!(r.get_anonymous(c.id).await, Err(RepoError::NotFound)));
    // second delete with the right token: already gone
    assert!(!r.delete_anonymous(c.id, &c.delete_token).await.unwrap());

    let left = r.list_anonymous("p").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].text, "second");
}

#[tokio::test]
async fn anonymous_listing_is_chronological_then_by_id() {
    let r = InMemRepo::ephemeral();
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();

    let mut newer = anon("p", "newer");
    newer.created_at = Some(t1);
    let mut older_a = anon("p", "older-a");
    older_a.created_at = Some(t0);
    let mut older_b = anon("p", "older-b");
    older_b.created_at = Some(t0);

    r.insert_anonymous(newer).await.unwrap();
    r.insert_anonymous(older_a).await.unwrap();
    r.insert_anonymous(older_b).await.unwrap();
    r.insert_anonymous(anon("other", "elsewhere")).await.unwrap();

    let texts: Vec<String> = r.list_anonymous("p").await.unwrap().into_iter().map(|c| c.text).collect();
    assert_eq!(texts, vec!["older-a", "older-b", "newer"]);
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let token = {
        let r = InMemRepo::open(dir.path()).unwrap();
        r.upsert_pointer(pointer("p", "did:plc:x", "k1")).await.unwrap();
        let c = r.insert_anonymous(anon("p", "persisted")).await.unwrap();
        c.delete_token
    };
    assert!(dir.path().join("smudge.json").exists());

    let r = InMemRepo::open(dir.path()).unwrap();
    assert_eq!(r.list_pointers("p").await.unwrap().len(), 1);
    let comments = r.list_anonymous("p").await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].text, "persisted");

    // token and id counter survive too
    let next = r.insert_anonymous(anon("p", "after reopen")).await.unwrap();
    assert_eq!(next.id, comments[0].id + 1);
    assert!(r.delete_anonymous(comments[0].id, &token).await.unwrap());
}

#[tokio::test]
async fn corrupt_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("smudge.json"), b"{ not json").unwrap();
    assert!(matches!(InMemRepo::open(dir.path()), Err(RepoError::Internal(_))));
    // left untouched for an operator to inspect
    assert_eq!(std::fs::read(dir.path().join("smudge.json")).unwrap(), b"{ not json");
}

#[tokio::test]
async fn missing_data_dir_is_created_on_first_write() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("nested").join("data");
    let r = InMemRepo::open(&nested).unwrap();
    assert!(r.list_pointers("p").await.unwrap().is_empty());
    r.insert_anonymous(anon("p", "x")).await.unwrap();
    assert!(nested.join("smudge.json").exists());
}
