//! Runtime transfer counters shared by both endpoint roles.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic totals for bytes and messages moved through an endpoint.
///
/// All counters are updated and read atomically; the struct is shared
/// behind an `Arc` between the endpoint's loops and the application.
#[derive(Debug)]
pub struct Statistics {
    start_time: DateTime<Utc>,
    started: Instant,
    received_bytes: AtomicI64,
    received_messages: AtomicI64,
    sent_bytes: AtomicI64,
    sent_messages: AtomicI64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
            received_bytes: AtomicI64::new(0),
            received_messages: AtomicI64::new(0),
            sent_bytes: AtomicI64::new(0),
            sent_messages: AtomicI64::new(0),
        }
    }

    /// Instant at which the endpoint was created.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn received_bytes(&self) -> i64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> i64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> i64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_messages(&self) -> i64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    /// Average received message size; zero before the first message.
    pub fn received_message_size_average(&self) -> i64 {
        let messages = self.received_messages();
        if messages == 0 {
            return 0;
        }
        self.received_bytes() / messages
    }

    /// Average sent message size; zero before the first message.
    pub fn sent_message_size_average(&self) -> i64 {
        let messages = self.sent_messages();
        if messages == 0 {
            return 0;
        }
        self.sent_bytes() / messages
    }

    pub fn add_received_bytes(&self, n: i64) {
        self.received_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_received_messages(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent_bytes(&self, n: i64) {
        self.sent_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_sent_messages(&self) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the counters, preserving the start instant.
    pub fn reset(&self) {
        self.received_bytes.store(0, Ordering::Relaxed);
        self.received_messages.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
        self.sent_messages.store(0, Ordering::Relaxed);
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Statistics ---")?;
        writeln!(f, "    Started     : {}", self.start_time.to_rfc3339())?;
        writeln!(f, "    Uptime      : {:?}", self.uptime())?;
        writeln!(f, "    Received    : ")?;
        writeln!(f, "       Bytes    : {}", self.received_bytes())?;
        writeln!(f, "       Messages : {}", self.received_messages())?;
        writeln!(
            f,
            "       Average  : {} bytes",
            self.received_message_size_average()
        )?;
        writeln!(f, "    Sent        : ")?;
        writeln!(f, "       Bytes    : {}", self.sent_bytes())?;
        writeln!(f, "       Messages : {}", self.sent_messages())?;
        writeln!(
            f,
            "       Average  : {} bytes",
            self.sent_message_size_average()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_truncate_and_handle_zero() {
        let stats = Statistics::new();
        assert_eq!(stats.received_message_size_average(), 0);

        stats.increment_received_messages();
        stats.increment_received_messages();
        stats.add_received_bytes(7);
        assert_eq!(stats.received_message_size_average(), 3);
    }

    #[test]
    fn reset_clears_counters_but_keeps_start() {
        let stats = Statistics::new();
        let started = stats.start_time();
        stats.add_sent_bytes(128);
        stats.increment_sent_messages();

        stats.reset();
        assert_eq!(stats.sent_bytes(), 0);
        assert_eq!(stats.sent_messages(), 0);
        assert_eq!(stats.start_time(), started);
    }

    #[test]
    fn counters_accumulate() {
        let stats = Statistics::new();
        stats.add_sent_bytes(10);
        stats.add_sent_bytes(5);
        stats.increment_sent_messages();
        assert_eq!(stats.sent_bytes(), 15);
        assert_eq!(stats.sent_messages(), 1);
    }
}
