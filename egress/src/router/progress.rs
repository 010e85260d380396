use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Process-wide set preventing concurrent batches for the same binding.
///
/// The test-and-mark of [`InProgressRegistry::begin`] is a single critical
/// section: two scheduling passes can never both claim the same key.
#[derive(Debug, Clone, Default)]
pub struct InProgressRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl InProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` if it is free. Returns whether the claim succeeded.
    pub fn begin(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("in-progress registry poisoned");
        inner.insert(key.to_owned())
    }

    /// Releases `key`. Idempotent.
    pub fn end(&self, key: &str) {
        let mut inner = self.inner.lock().expect("in-progress registry poisoned");
        inner.remove(key);
    }

    /// Returns whether `key` is currently claimed.
    pub fn is_marked(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("in-progress registry poisoned");
        inner.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_exclusive_until_end() {
        let registry = InProgressRegistry::new();

        assert!(registry.begin("src_dst"));
        assert!(registry.is_marked("src_dst"));
        assert!(!registry.begin("src_dst"));

        registry.end("src_dst");
        assert!(!registry.is_marked("src_dst"));
        assert!(registry.begin("src_dst"));
    }

    #[test]
    fn keys_are_independent() {
        let registry = InProgressRegistry::new();
        assert!(registry.begin("a_b"));
        assert!(registry.begin("a_c"));
        registry.end("a_b");
        assert!(registry.is_marked("a_c"));
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        let registry = InProgressRegistry::new();
        let claims: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || registry.begin("contended"))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(claims.iter().filter(|claimed| **claimed).count(), 1);
    }
}
