//! Discovery attempt deduplication

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Terminal or in-flight outcome of one discovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResult {
    Pending,
    Success,
    NotTollGate,
    ValidationFailed,
    Error,
}

#[derive(Debug, Clone)]
pub struct DiscoveryAttempt {
    pub interface_name: String,
    pub gateway_ip: String,
    pub attempted_at: DateTime<Utc>,
    pub result: DiscoveryResult,
    recorded: Instant,
}

impl DiscoveryAttempt {
    pub fn age(&self) -> Duration {
        self.recorded.elapsed()
    }
}

/// In-memory map of the last discovery attempt per (interface, gateway).
///
/// `Success` and `Pending` entries suppress further attempts until a
/// link-down clears the interface; failed entries become retriable
/// once they outlive `retry_age`.
pub struct DiscoveryTracker {
    attempts: Mutex<HashMap<(String, String), DiscoveryAttempt>>,
    retry_age: Duration,
}

impl DiscoveryTracker {
    pub fn new(retry_age: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            retry_age,
        }
    }

    pub fn should_attempt(&self, iface: &str, gateway_ip: &str) -> bool {
        let attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match attempts.get(&(iface.to_string(), gateway_ip.to_string())) {
            None => true,
            Some(attempt) => match attempt.result {
                DiscoveryResult::Pending | DiscoveryResult::Success => false,
                DiscoveryResult::NotTollGate
                | DiscoveryResult::ValidationFailed
                | DiscoveryResult::Error => attempt.age() >= self.retry_age,
            },
        }
    }

    pub fn record(&self, iface: &str, gateway_ip: &str, result: DiscoveryResult) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.insert(
                (iface.to_string(), gateway_ip.to_string()),
                DiscoveryAttempt {
                    interface_name: iface.to_string(),
                    gateway_ip: gateway_ip.to_string(),
                    attempted_at: Utc::now(),
                    result,
                    recorded: Instant::now(),
                },
            );
        }
    }

    pub fn get(&self, iface: &str, gateway_ip: &str) -> Option<DiscoveryAttempt> {
        self.attempts
            .lock()
            .ok()?
            .get(&(iface.to_string(), gateway_ip.to_string()))
            .cloned()
    }

    /// Forget every attempt on `iface`, making it rediscoverable.
    pub fn clear_interface(&self, iface: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.retain(|(attempt_iface, _), _| attempt_iface != iface);
        }
    }
}
