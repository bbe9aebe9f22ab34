use super::core::Database;

/// A user with one enabled feed. Returns `(user_id, source_id)`.
pub(crate) async fn seed_user_source(db: &Database) -> (String, String) {
    let user_id = db
        .create_user(&format!("{}@example.com", uuid::Uuid::new_v4()))
        .await
        .unwrap();
    let source_id = db
        .create_source(&user_id, "https://news.example/feed.xml", Some("News"))
        .await
        .unwrap();
    (user_id, source_id)
}
