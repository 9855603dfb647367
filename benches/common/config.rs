use std::env;

/// Configuration for benchmarks, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Simulated fetch latency in milliseconds (from FETCH_LATENCY_MS env var, defaults to 5)
    pub fetch_latency_ms: u64,

    /// Capacity of the LRU-bounded store (from LRU_CAPACITY env var, defaults to 5000)
    pub lru_capacity: usize,

    /// Sample size for benchmarks (from BENCH_SAMPLE_SIZE env var, defaults to 100)
    pub sample_size: usize,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            fetch_latency_ms: env_or("FETCH_LATENCY_MS", 5),
            lru_capacity: env_or("LRU_CAPACITY", 5_000),
            sample_size: env_or("BENCH_SAMPLE_SIZE", 100),
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        let config = Self::default();
        eprintln!("Benchmark Configuration:");
        eprintln!("  Fetch Latency: {}ms", config.fetch_latency_ms);
        eprintln!("  LRU Capacity: {}", config.lru_capacity);
        eprintln!("  Sample Size: {}", config.sample_size);
        config
    }
}
