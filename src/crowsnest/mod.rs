//! Gateway discovery
//!
//! Crowsnest turns link-state changes into validated
//! [`UpstreamTollgate`] handoffs to the Chandler, propagates link loss,
//! and runs a periodic safety net while no session is active.

pub mod link;
pub mod prober;
pub mod tracker;

pub use link::{GatewayPoller, LinkEventSource, NetworkEvent, NetworkEventKind, UpInterface};
pub use prober::{HttpProber, Prober};
pub use tracker::{DiscoveryAttempt, DiscoveryResult, DiscoveryTracker};

use crate::chandler::{Chandler, UpstreamTollgate};
use crate::config::CrowsnestConfig;
use crate::errors::ProbeError;
use crate::protocol;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interfaces may already be up before the link source subscribes.
const INITIAL_SCAN_DELAY: Duration = Duration::from_secs(2);
const PERIODIC_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const PERIODIC_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Crowsnest {
    chandler: Arc<Chandler>,
    prober: Arc<dyn Prober>,
    tracker: DiscoveryTracker,
    config: CrowsnestConfig,
    /// One cancellation token per interface with in-flight probes.
    inflight: std::sync::Mutex<HashMap<String, CancellationToken>>,
}

impl Crowsnest {
    pub fn new(
        chandler: Arc<Chandler>,
        prober: Arc<dyn Prober>,
        config: CrowsnestConfig,
    ) -> Arc<Self> {
        let tracker = DiscoveryTracker::new(Duration::from_secs(config.retry_age_secs));
        Arc::new(Self {
            chandler,
            prober,
            tracker,
            config,
            inflight: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Consume link events until the channel closes. Also runs the
    /// boot-time scan and the periodic no-session safety check.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<NetworkEvent>) {
        let me = self.clone();
        tokio::spawn(async move { me.initial_scan().await });
        let me = self.clone();
        tokio::spawn(async move { me.periodic_check_loop().await });

        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        log::info!("link event channel closed, crowsnest stopping");
    }

    async fn handle_event(self: &Arc<Self>, event: NetworkEvent) {
        if self.config.ignore_interfaces.contains(&event.interface_name) {
            return;
        }

        match event.kind {
            NetworkEventKind::InterfaceUp | NetworkEventKind::AddressAdded => {
                let Some(gateway_ip) = event.gateway_ip.clone() else {
                    log::debug!("{} came up without a gateway", event.interface_name);
                    return;
                };
                let iface = event.interface_name.clone();
                let mac = event
                    .mac
                    .clone()
                    .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
                let me = self.clone();
                tokio::spawn(async move {
                    me.attempt_discovery(&iface, &mac, &gateway_ip).await;
                });
            }
            NetworkEventKind::InterfaceDown | NetworkEventKind::AddressRemoved => {
                self.cancel_probes(&event.interface_name);
                self.tracker.clear_interface(&event.interface_name);
                if let Err(e) = self.chandler.handle_disconnect(&event.interface_name).await {
                    log::warn!("disconnect handling for {} failed: {e}", event.interface_name);
                }
            }
        }
    }

    /// Probe a gateway once, validate the advertisement, hand off.
    /// Deduplicated through the discovery tracker.
    pub async fn attempt_discovery(&self, iface: &str, mac: &str, gateway_ip: &str) {
        if !self.tracker.should_attempt(iface, gateway_ip) {
            log::debug!("discovery of {gateway_ip} on {iface} suppressed");
            return;
        }
        self.tracker.record(iface, gateway_ip, DiscoveryResult::Pending);

        let cancel = self.interface_token(iface);
        let probe_timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let discovery_timeout = Duration::from_secs(self.config.discovery_timeout_secs);

        let outcome = tokio::time::timeout(
            discovery_timeout,
            self.prober.probe(iface, gateway_ip, &cancel, probe_timeout),
        )
        .await;

        let bytes = match outcome {
            Err(_) => {
                log::warn!("discovery of {gateway_ip} on {iface} timed out");
                self.tracker.record(iface, gateway_ip, DiscoveryResult::Error);
                return;
            }
            Ok(Err(ProbeError::Cancelled)) => {
                // link went down; the tracker entry was already cleared
                log::debug!("probe of {gateway_ip} on {iface} cancelled");
                return;
            }
            Ok(Err(ProbeError::Status(code))) => {
                log::debug!("{gateway_ip} is not a tollgate (status {code})");
                self.tracker
                    .record(iface, gateway_ip, DiscoveryResult::NotTollGate);
                return;
            }
            Ok(Err(e)) => {
                log::debug!("probe of {gateway_ip} on {iface} failed: {e}");
                self.tracker.record(iface, gateway_ip, DiscoveryResult::Error);
                return;
            }
            Ok(Ok(bytes)) => bytes,
        };

        let advertisement = match protocol::parse_advertisement(&bytes) {
            Ok(ad) => ad,
            Err(e) => {
                log::warn!("invalid advertisement from {gateway_ip} on {iface}: {e}");
                self.tracker
                    .record(iface, gateway_ip, DiscoveryResult::ValidationFailed);
                return;
            }
        };

        self.tracker
            .record(iface, gateway_ip, DiscoveryResult::Success);
        log::info!(
            "discovered tollgate {} at {gateway_ip} on {iface}",
            advertisement.gateway_pubkey
        );

        let upstream = UpstreamTollgate {
            interface_name: iface.to_string(),
            local_mac: mac.to_string(),
            gateway_ip: gateway_ip.to_string(),
            advertisement,
            discovered_at: Utc::now(),
        };
        // session creation is a separate concern; a Chandler error does
        // not invalidate the discovery
        if let Err(e) = self.chandler.handle_upstream_tollgate(upstream).await {
            log::warn!("session creation for {gateway_ip} on {iface} failed: {e}");
        }
    }

    async fn initial_scan(self: Arc<Self>) {
        tokio::time::sleep(INITIAL_SCAN_DELAY).await;
        for iface in link::up_interfaces(&self.config.ignore_interfaces) {
            self.attempt_discovery(&iface.name, &iface.mac, &iface.gateway_ip)
                .await;
        }
    }

    async fn periodic_check_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PERIODIC_CHECK_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !self.chandler.get_active_sessions().await.is_empty() {
                continue;
            }
            for iface in link::up_interfaces(&self.config.ignore_interfaces) {
                if self.periodic_probe(&iface).await {
                    break;
                }
            }
        }
    }

    /// Short-timeout probe that bypasses the dedup tracker; the safety
    /// net must retry gateways whose discovery already succeeded but
    /// whose session never materialized.
    async fn periodic_probe(&self, iface: &UpInterface) -> bool {
        let cancel = self.interface_token(&iface.name);
        let bytes = match self
            .prober
            .probe(
                &iface.name,
                &iface.gateway_ip,
                &cancel,
                PERIODIC_PROBE_TIMEOUT,
            )
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("periodic probe of {} failed: {e}", iface.gateway_ip);
                return false;
            }
        };

        let advertisement = match protocol::parse_advertisement(&bytes) {
            Ok(ad) => ad,
            Err(_) => return false,
        };
        self.tracker
            .record(&iface.name, &iface.gateway_ip, DiscoveryResult::Success);

        let upstream = UpstreamTollgate {
            interface_name: iface.name.clone(),
            local_mac: iface.mac.clone(),
            gateway_ip: iface.gateway_ip.clone(),
            advertisement,
            discovered_at: Utc::now(),
        };
        match self.chandler.handle_upstream_tollgate(upstream).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("periodic handoff for {} failed: {e}", iface.gateway_ip);
                false
            }
        }
    }

    fn interface_token(&self, iface: &str) -> CancellationToken {
        match self.inflight.lock() {
            Ok(mut inflight) => inflight
                .entry(iface.to_string())
                .or_insert_with(CancellationToken::new)
                .clone(),
            Err(_) => CancellationToken::new(),
        }
    }

    fn cancel_probes(&self, iface: &str) {
        if let Ok(mut inflight) = self.inflight.lock() {
            if let Some(token) = inflight.remove(iface) {
                token.cancel();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn discovery_state(&self, iface: &str, gateway_ip: &str) -> Option<DiscoveryResult> {
        self.tracker.get(iface, gateway_ip).map(|a| a.result)
    }
}
