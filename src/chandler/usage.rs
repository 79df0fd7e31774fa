//! Per-session usage trackers
//!
//! A session owns exactly one tracker. The tracker watches consumption
//! of the purchased allotment and calls back into the session manager
//! shortly before exhaustion. Two variants: a single-shot timer for
//! time-metered sessions and a usage-endpoint poller for byte-metered
//! ones.
//!
//! Contract:
//! - `start` is idempotent
//! - `stop` is idempotent and guarantees silence: a fire already in
//!   flight checks the live flag before invoking the handler
//! - `session_changed` re-arms (time) or re-baselines (bytes) against
//!   the new total allotment

use crate::errors::ChandlerResult;
use crate::protocol::{self, UsageReport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Back-handle from a tracker into the session manager.
#[async_trait]
pub trait RenewalHandler: Send + Sync {
    async fn handle_upcoming_renewal(
        &self,
        gateway_pubkey: &str,
        current_usage: u64,
    ) -> ChandlerResult<()>;
}

/// Capability owned by one session.
#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    /// The session's total allotment changed (renewal succeeded).
    async fn session_changed(&self, new_total_allotment: u64);
    fn is_live(&self) -> bool;
}

/// Single-shot timer for `milliseconds` sessions. Fires when elapsed
/// time reaches `total_allotment - renewal_offset`.
pub struct TimeUsageTracker {
    gateway_pubkey: String,
    renewal_offset_ms: u64,
    initial_used_ms: u64,
    total_ms: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
    started_at: std::sync::Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
    handler: Weak<dyn RenewalHandler>,
}

impl TimeUsageTracker {
    pub fn new(
        gateway_pubkey: String,
        total_allotment_ms: u64,
        renewal_offset_ms: u64,
        initial_used_ms: u64,
        handler: Weak<dyn RenewalHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway_pubkey,
            renewal_offset_ms,
            initial_used_ms,
            total_ms: Arc::new(AtomicU64::new(total_allotment_ms)),
            live: Arc::new(AtomicBool::new(false)),
            started_at: std::sync::Mutex::new(None),
            task: Mutex::new(None),
            handler,
        })
    }

    fn current_started_at(&self) -> Instant {
        self.started_at
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .unwrap_or_else(Instant::now)
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let live = self.live.clone();
        let total = self.total_ms.clone();
        let handler = self.handler.clone();
        let gateway_pubkey = self.gateway_pubkey.clone();
        let initial_used = self.initial_used_ms;
        let offset = self.renewal_offset_ms;
        let started_at = self.current_started_at();

        tokio::spawn(async move {
            let fire_point = total.load(Ordering::SeqCst).saturating_sub(offset);
            let usage_now = initial_used + started_at.elapsed().as_millis() as u64;
            let delay = fire_point.saturating_sub(usage_now);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if !live.load(Ordering::SeqCst) {
                return;
            }
            let usage = initial_used + started_at.elapsed().as_millis() as u64;
            match handler.upgrade() {
                Some(handler) => {
                    if let Err(e) = handler
                        .handle_upcoming_renewal(&gateway_pubkey, usage)
                        .await
                    {
                        log::warn!("renewal for {gateway_pubkey} failed: {e}");
                    }
                }
                None => log::debug!("renewal handler gone for {gateway_pubkey}"),
            }
        })
    }
}

#[async_trait]
impl UsageTracker for TimeUsageTracker {
    async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        self.live.store(true, Ordering::SeqCst);
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Instant::now());
        }
        *task = Some(self.spawn_timer());
    }

    async fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    async fn session_changed(&self, new_total_allotment: u64) {
        self.total_ms.store(new_total_allotment, Ordering::SeqCst);
        let mut task = self.task.lock().await;
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = task.take() {
            handle.abort();
        }
        *task = Some(self.spawn_timer());
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Timing knobs for the byte poller; tests shrink these.
#[derive(Debug, Clone, Copy)]
pub struct DataTrackerTiming {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub request_timeout: Duration,
}

impl Default for DataTrackerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Usage-endpoint poller for `bytes` sessions.
pub struct DataUsageTracker {
    gateway_pubkey: String,
    usage_url: String,
    renewal_offset: u64,
    timing: DataTrackerTiming,
    total: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
    last_fired: Arc<std::sync::Mutex<Option<Instant>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
    handler: Weak<dyn RenewalHandler>,
}

impl DataUsageTracker {
    pub fn new(
        gateway_pubkey: String,
        gateway_ip: &str,
        advert_port: u16,
        total_allotment: u64,
        renewal_offset: u64,
        timing: DataTrackerTiming,
        handler: Weak<dyn RenewalHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway_pubkey,
            usage_url: format!("http://{gateway_ip}:{advert_port}/usage"),
            renewal_offset,
            timing,
            total: Arc::new(AtomicU64::new(total_allotment)),
            live: Arc::new(AtomicBool::new(false)),
            last_fired: Arc::new(std::sync::Mutex::new(None)),
            task: Mutex::new(None),
            http: reqwest::Client::new(),
            handler,
        })
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let live = self.live.clone();
        let total = self.total.clone();
        let last_fired = self.last_fired.clone();
        let handler = self.handler.clone();
        let http = self.http.clone();
        let gateway_pubkey = self.gateway_pubkey.clone();
        let usage_url = self.usage_url.clone();
        let offset = self.renewal_offset;
        let timing = self.timing;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timing.poll_interval).await;
                if !live.load(Ordering::SeqCst) {
                    return;
                }

                let body = match http
                    .get(&usage_url)
                    .timeout(timing.request_timeout)
                    .send()
                    .await
                {
                    Ok(response) => match response.text().await {
                        Ok(body) => body,
                        Err(e) => {
                            log::debug!("usage poll read failed for {gateway_pubkey}: {e}");
                            continue;
                        }
                    },
                    Err(e) => {
                        log::debug!("usage poll failed for {gateway_pubkey}: {e}");
                        continue;
                    }
                };

                let (used, reported_total) = match protocol::parse_usage_body(&body) {
                    Ok(UsageReport::Metered { used, total }) => (used, total),
                    Ok(UsageReport::NoSession) => {
                        // may be transient while the gateway cleans up
                        log::debug!("gateway reports no session for {gateway_pubkey}");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("bad usage body from {usage_url}: {e}");
                        continue;
                    }
                };

                if reported_total != total.load(Ordering::SeqCst) {
                    log::debug!(
                        "usage endpoint total {reported_total} differs from cached for {gateway_pubkey}"
                    );
                    total.store(reported_total, Ordering::SeqCst);
                }

                let remaining = reported_total.saturating_sub(used);
                if remaining > offset {
                    continue;
                }

                let debounced = last_fired
                    .lock()
                    .ok()
                    .and_then(|guard| *guard)
                    .map(|at| at.elapsed() < timing.debounce)
                    .unwrap_or(false);
                if debounced {
                    continue;
                }

                if !live.load(Ordering::SeqCst) {
                    return;
                }
                if let Ok(mut guard) = last_fired.lock() {
                    *guard = Some(Instant::now());
                }
                match handler.upgrade() {
                    Some(handler) => {
                        if let Err(e) = handler
                            .handle_upcoming_renewal(&gateway_pubkey, used)
                            .await
                        {
                            log::warn!("renewal for {gateway_pubkey} failed: {e}");
                        }
                    }
                    None => log::debug!("renewal handler gone for {gateway_pubkey}"),
                }
            }
        })
    }
}

#[async_trait]
impl UsageTracker for DataUsageTracker {
    async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        self.live.store(true, Ordering::SeqCst);
        *task = Some(self.spawn_poller());
    }

    async fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    async fn session_changed(&self, new_total_allotment: u64) {
        self.total.store(new_total_allotment, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}
