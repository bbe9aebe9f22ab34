//! External collaborators: the LLM worker service, the embeddings API and
//! the email provider. Each sits behind a trait so pipeline code can be
//! exercised with in-process fakes.

pub mod email;
pub mod embeddings;
pub mod worker;

pub use email::{Mailer, ResendMailer};
pub use embeddings::{Embedder, EmbeddingResult, OpenAiEmbeddings};
pub use worker::{ContentService, Credentials, WorkerClient};

/// Keeps at most `max_bytes` of an upstream body for error messages.
pub(crate) fn body_snippet(body: &str, max_bytes: usize) -> &str {
    if body.len() <= max_bytes {
        return body;
    }
    let mut end = max_bytes;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_snippet_respects_char_boundaries() {
        assert_eq!(body_snippet("short", 10), "short");
        assert_eq!(body_snippet("abcdef", 3), "abc");
        // "é" is two bytes; cutting inside it backs off.
        assert_eq!(body_snippet("aé", 2), "a");
    }
}
