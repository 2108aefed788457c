//! In-memory backend for tests and local runs

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ObjectStore, PutObjectRequest, PutObjectResponse};
use crate::error::StoreError;

#[derive(Debug)]
enum Scripted {
    Status(u16),
    Transport(String),
}

#[derive(Debug, Default)]
struct Inner {
    objects: Vec<PutObjectRequest>,
    attempts: usize,
    scripted: VecDeque<Scripted>,
    write_delay: Option<Duration>,
}

/// Keeps every successful put in memory. Clones share the same storage, so a
/// test can hand one clone to the logger and inspect through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering each put
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.lock().write_delay = Some(delay);
        self
    }

    /// The next unscripted put answers with `status` and stores nothing
    pub fn fail_next_with_status(&self, status: u16) {
        self.lock().scripted.push_back(Scripted::Status(status));
    }

    /// The next unscripted put fails before reaching the store
    pub fn fail_next_with_transport(&self, message: impl Into<String>) {
        self.lock()
            .scripted
            .push_back(Scripted::Transport(message.into()));
    }

    pub fn objects(&self) -> Vec<PutObjectRequest> {
        self.lock().objects.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.iter().map(|o| o.key.clone()).collect()
    }

    /// Number of puts received, successful or not
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectResponse, StoreError> {
        let delay = self.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        inner.attempts += 1;

        match inner.scripted.pop_front() {
            Some(Scripted::Status(status)) => Ok(PutObjectResponse {
                status_code: status,
                e_tag: None,
            }),
            Some(Scripted::Transport(message)) => Err(StoreError::Transport(message)),
            None => {
                inner.objects.push(request);
                Ok(PutObjectResponse::ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn put(key: &str) -> PutObjectRequest {
        PutObjectRequest {
            bucket: "bucket".to_string(),
            key: key.to_string(),
            body: Bytes::from_static(b"{}"),
            content_type: "application/json".to_string(),
            content_length: 2,
            server_side_encryption: true,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.fail_next_with_status(503);
        store.fail_next_with_transport("connection reset");

        let first = store.put_object(put("a")).await.unwrap();
        assert_eq!(first.status_code, 503);
        assert!(!first.is_success());

        let second = store.put_object(put("b")).await;
        assert_eq!(
            second,
            Err(StoreError::Transport("connection reset".to_string()))
        );

        let third = store.put_object(put("c")).await.unwrap();
        assert!(third.is_success());

        assert_eq!(store.attempts(), 3);
        assert_eq!(store.keys(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let store = MemoryStore::new();
        let writer = store.clone();
        writer.put_object(put("shared")).await.unwrap();
        assert_eq!(store.objects().len(), 1);
    }
}
