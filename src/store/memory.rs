//! In-memory store double used by tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use super::{AuthAttempt, NewAuthAttempt, StoreError, VoiceStore, Voiceprint};

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, Voiceprint>>,
    attempts: Mutex<Vec<AuthAttempt>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VoiceStore for MemoryStore {
    async fn upsert_user(&self, mut user: Voiceprint) -> Result<Voiceprint, StoreError> {
        self.check_available()?;
        let mut users = self.users.lock().unwrap();
        // Re-enrollment replaces the vector and timestamp but keeps the
        // originally assigned record id.
        if let Some(existing) = users.get(&user.phone) {
            user.id = existing.id;
        }
        users.insert(user.phone.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<Voiceprint>, StoreError> {
        self.check_available()?;
        Ok(self.users.lock().unwrap().get(phone).cloned())
    }

    async fn delete_user(&self, phone: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.users.lock().unwrap().remove(phone).is_some())
    }

    async fn log_attempt(&self, attempt: NewAuthAttempt) -> Result<AuthAttempt, StoreError> {
        self.check_available()?;
        let record = AuthAttempt {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            phone: attempt.phone,
            success: attempt.success,
            score: attempt.score,
            created_at: Utc::now(),
        };
        self.attempts.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn attempts_by_phone(&self, phone: &str, limit: i64) -> Result<Vec<AuthAttempt>, StoreError> {
        self.check_available()?;
        let attempts = self.attempts.lock().unwrap();
        let mut matching: Vec<AuthAttempt> = attempts
            .iter()
            .filter(|attempt| attempt.phone == phone)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn recent_failure_count(&self, phone: &str, window_minutes: i64) -> Result<i64, StoreError> {
        self.check_available()?;
        let cutoff = Utc::now() - ChronoDuration::minutes(window_minutes);
        let attempts = self.attempts.lock().unwrap();
        Ok(attempts
            .iter()
            .filter(|attempt| {
                attempt.phone == phone && !attempt.success && attempt.created_at >= cutoff
            })
            .count() as i64)
    }

    async fn health_check(&self) -> bool {
        self.check_available().is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    fn voiceprint(phone: &str, value: f64) -> Voiceprint {
        Voiceprint {
            phone: phone.to_string(),
            id: Uuid::new_v4(),
            embedding: vec![value; 192],
            enrolled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_embedding() {
        let store = MemoryStore::new();
        let first = store.upsert_user(voiceprint("+15551230000", 0.1)).await.unwrap();
        let second = store.upsert_user(voiceprint("+15551230000", 0.9)).await.unwrap();
        assert_eq!(first.id, second.id);

        let fetched = store.get_user_by_phone("+15551230000").await.unwrap().unwrap();
        assert_eq!(fetched, second);
        assert_eq!(fetched.embedding[0], 0.9);
    }

    #[tokio::test]
    async fn test_get_missing_user() {
        let store = MemoryStore::new();
        assert!(store.get_user_by_phone("+15550000001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_user() {
        let store = MemoryStore::new();
        store.upsert_user(voiceprint("+15551230000", 0.5)).await.unwrap();
        assert!(store.delete_user("+15551230000").await.unwrap());
        assert!(!store.delete_user("+15551230000").await.unwrap());
    }

    #[tokio::test]
    async fn test_attempts_ordering_and_limit() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store
                .log_attempt(NewAuthAttempt {
                    phone: "+15551230000".into(),
                    success: n % 2 == 0,
                    score: n as f64 / 10.0,
                })
                .await
                .unwrap();
        }
        let attempts = store.attempts_by_phone("+15551230000", 3).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].id > attempts[1].id);
        assert!(attempts[1].id > attempts[2].id);
    }

    #[tokio::test]
    async fn test_recent_failure_count() {
        let store = MemoryStore::new();
        for success in [true, false, false] {
            store
                .log_attempt(NewAuthAttempt {
                    phone: "+15551230000".into(),
                    success,
                    score: 0.0,
                })
                .await
                .unwrap();
        }
        store
            .log_attempt(NewAuthAttempt {
                phone: "+15559990000".into(),
                success: false,
                score: 0.0,
            })
            .await
            .unwrap();
        let count = store.recent_failure_count("+15551230000", 60).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_outage_simulation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(!store.health_check().await);
        assert!(store.get_user_by_phone("+15551230000").await.is_err());
        store.set_unavailable(false);
        assert!(store.health_check().await);
    }
}
