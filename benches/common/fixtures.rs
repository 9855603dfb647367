use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swr_store::{Fetcher, fetcher_fn};

/// Payload stored under every benchmark key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchUser {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub score: u32,
}

impl BenchUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            email: format!("user{}@example.com", id),
            score: (id % 1000) as u32,
        }
    }
}

/// Simulated remote API with configurable latency
#[derive(Clone)]
pub struct FakeDatabase {
    data: Arc<HashMap<String, BenchUser>>,
    latency_ms: u64,
    fetch_count: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_users: usize, latency_ms: u64) -> Self {
        let mut data = HashMap::new();
        for i in 0..num_users {
            let user = BenchUser::new(i as u64);
            data.insert(format!("user:{}", i), user);
        }

        Self {
            data: Arc::new(data),
            latency_ms,
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A fetcher that resolves keys against this database
    pub fn fetcher(&self) -> Arc<dyn Fetcher<BenchUser, String>> {
        let db = self.clone();
        fetcher_fn(move |key: String, _ctx| {
            let db = db.clone();
            async move {
                db.fetch_count.fetch_add(1, Ordering::Relaxed);

                // Simulate network latency
                if db.latency_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(db.latency_ms)).await;
                }

                db.data.get(&key).cloned().ok_or_else(|| format!("{key} not found"))
            }
        })
    }

    #[allow(dead_code)]
    pub fn get(&self, key: &str) -> Option<BenchUser> {
        self.data.get(key).cloned()
    }

    #[allow(dead_code)]
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn reset_count(&self) {
        self.fetch_count.store(0, Ordering::Relaxed);
    }
}

/// Generate keys for different access patterns
pub struct KeyGenerator {
    num_keys: usize,
}

impl KeyGenerator {
    pub fn new(num_keys: usize) -> Self {
        Self { num_keys }
    }

    /// Every key once, in order
    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_keys).map(|i| format!("user:{}", i)).collect()
    }

    /// Random keys with uniform distribution
    #[allow(dead_code)]
    pub fn uniform_random(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| format!("user:{}", rng.gen_range(0..self.num_keys)))
            .collect()
    }

    /// Skewed keys: 80% of requests go to 20% of keys
    pub fn zipf_random(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot = (self.num_keys / 5).max(1);

        (0..count)
            .map(|_| {
                let key_id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..hot)
                } else {
                    rng.gen_range(hot..self.num_keys.max(hot + 1))
                };
                format!("user:{}", key_id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_database_fetcher() {
        use super::FakeDatabase;
        use swr_store::FetchContext;
        use tokio_util::sync::CancellationToken;

        let db = FakeDatabase::new(100, 0);
        let fetcher = db.fetcher();

        let user = fetcher
            .fetch("user:0", FetchContext::new(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(user.id, 0);
        assert_eq!(db.fetch_count(), 1);
    }

    #[test]
    fn test_key_generator() {
        use super::KeyGenerator;

        let key_gen = KeyGenerator::new(100);

        let seq = key_gen.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0], "user:0");

        let uniform = key_gen.uniform_random(50);
        assert_eq!(uniform.len(), 50);

        let zipf = key_gen.zipf_random(100);
        assert_eq!(zipf.len(), 100);
    }
}
