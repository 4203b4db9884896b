//! SQLite Store Integration Tests

use chat_relay::auth::Principal;
use chat_relay::store::{MembershipStore, MessageStore, SqliteStore, DEFAULT_BOT_EMAIL};
use tempfile::TempDir;
use tokio_test::assert_ok;

fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(&dir.path().join("chat.db"), DEFAULT_BOT_EMAIL).unwrap()
}

#[tokio::test]
async fn test_membership() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let alice = store.add_user("Alice", "alice@example.com").unwrap();
    let bob = store.add_user("Bob", "bob@example.com").unwrap();
    let cid = store.create_conversation("General", true).unwrap();
    store.add_member(cid, &alice).unwrap();
    store.add_member(cid, &alice).unwrap();

    assert!(store.is_member(&alice, cid).await.unwrap());
    assert!(!store.is_member(&bob, cid).await.unwrap());
    assert!(!store.is_member(&alice, cid + 1).await.unwrap());
    assert!(!store.is_member(&Principal::new("not-a-user"), cid).await.unwrap());
}

#[tokio::test]
async fn test_bot_setting_defaults_to_enabled() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let cid = store.create_conversation("Support", false).unwrap();

    assert!(store.is_bot_enabled(cid).await.unwrap());

    store.set_bot_enabled(cid, false).unwrap();
    assert!(!store.is_bot_enabled(cid).await.unwrap());

    store.set_bot_enabled(cid, true).unwrap();
    assert!(store.is_bot_enabled(cid).await.unwrap());
}

#[tokio::test]
async fn test_resolve_bot_principal() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    assert_eq!(store.resolve_bot_principal().await.unwrap(), None);

    let bot = store.ensure_bot_user().unwrap();
    assert_eq!(store.ensure_bot_user().unwrap(), bot);
    assert_eq!(store.resolve_bot_principal().await.unwrap(), Some(bot));
}

#[tokio::test]
async fn test_custom_bot_email() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("custom.db"), "helper@example.com").unwrap();

    store.add_user("Bot", DEFAULT_BOT_EMAIL).unwrap();
    assert_eq!(store.resolve_bot_principal().await.unwrap(), None);

    let helper = store.add_user("Helper", "helper@example.com").unwrap();
    assert_eq!(store.resolve_bot_principal().await.unwrap(), Some(helper));
}

#[tokio::test]
async fn test_append_and_read_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let bot = store.ensure_bot_user().unwrap();
    let cid = store.create_conversation("General", true).unwrap();

    let first = assert_ok!(store.append_message(cid, Some(&bot), "first").await);
    let second = assert_ok!(store.append_message(cid, None, "second").await);
    store.append_message(cid + 1, Some(&bot), "elsewhere").await.unwrap();
    assert!(second > first);

    let messages = store.recent_messages(cid, 10).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, first);
    assert_eq!(messages[0].author, Some(bot));
    assert_eq!(messages[0].content, "first");
    assert_eq!(messages[1].author, None);
    assert_eq!(messages[1].content, "second");
    assert!(messages[0].created_at.timestamp() > 0);

    let latest = store.recent_messages(cid, 1).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].content, "second");
}

#[tokio::test]
async fn test_reopen_keeps_data() {
    let dir = TempDir::new().unwrap();
    let (alice, cid) = {
        let store = open_store(&dir);
        let alice = store.add_user("Alice", "alice@example.com").unwrap();
        let cid = store.create_conversation("General", true).unwrap();
        store.add_member(cid, &alice).unwrap();
        store.set_bot_enabled(cid, false).unwrap();
        (alice, cid)
    };

    let store = open_store(&dir);
    assert!(store.is_member(&alice, cid).await.unwrap());
    assert!(!store.is_bot_enabled(cid).await.unwrap());
}

#[tokio::test]
async fn test_open_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("data").join("chat.db");

    let store = SqliteStore::open(&path, DEFAULT_BOT_EMAIL).unwrap();
    store.ensure_bot_user().unwrap();
    assert!(path.exists());
}
