//! Owner tokens for distributed lock acquisitions.
//!
//! A token is `<process-fingerprint>:<counter>`. The fingerprint is stable
//! for the lifetime of the process, so an acquirer can tell whether the
//! current holder lives in this process (wait on the in-process awaiter) or
//! elsewhere (poll the database).

use sha1::{Digest, Sha1};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static FINGERPRINT: OnceLock<String> = OnceLock::new();
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hex SHA-1 over machine name, process id, and the process start tick.
pub(crate) fn process_fingerprint() -> &'static str {
    FINGERPRINT.get_or_init(|| {
        let machine = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        let mut hasher = Sha1::new();
        hasher.update(machine.as_bytes());
        hasher.update(pid.to_le_bytes());
        hasher.update(tick.to_le_bytes());

        hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(40), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            })
    })
}

/// A fresh owner token for one acquisition.
pub(crate) fn next_owner_token() -> String {
    format!(
        "{}:{}",
        process_fingerprint(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Whether `owner` was issued by this process.
pub(crate) fn is_local_owner(owner: &str) -> bool {
    owner
        .split(':')
        .next()
        .is_some_and(|fingerprint| fingerprint == process_fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex_sha1() {
        let first = process_fingerprint();
        let second = process_fingerprint();
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique_and_local() {
        let a = next_owner_token();
        let b = next_owner_token();
        assert_ne!(a, b);
        assert!(is_local_owner(&a));
        assert!(is_local_owner(&b));

        let (fingerprint_a, counter_a) = a.split_once(':').expect("token has two parts");
        let (_, counter_b) = b.split_once(':').expect("token has two parts");
        assert_eq!(fingerprint_a, process_fingerprint());
        let counter_a: u64 = counter_a.parse().expect("counter is numeric");
        let counter_b: u64 = counter_b.parse().expect("counter is numeric");
        assert!(counter_b > counter_a);
    }

    #[test]
    fn foreign_tokens_are_not_local() {
        assert!(!is_local_owner("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef:7"));
        assert!(!is_local_owner(""));
    }
}
