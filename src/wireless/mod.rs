//! Wireless gateway manager
//!
//! In reseller mode the device is itself a TollGate: it picks the best
//! upstream `TollGate-*` access point, associates with it, and mirrors
//! the upstream price (plus margin) into the local AP's SSID so
//! downstream customers see the marked-up rate.

pub mod uci;

use crate::errors::RadioError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const TOLLGATE_SSID_PREFIX: &str = "TollGate-";

const SCAN_INTERVAL: Duration = Duration::from_secs(30);
const STABLE_SET_SIZE: usize = 3;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// One BSS from a wifi scan.
#[derive(Debug, Clone)]
pub struct BssInfo {
    pub bssid: String,
    pub ssid: String,
    pub signal_dbm: i32,
    pub encrypted: bool,
    /// Raw beacon information elements, TLV-encoded.
    pub information_elements: Vec<u8>,
}

/// Distro-specific link configuration surface. Only the manager writes
/// through it, serialized on the manager's radio lock.
#[async_trait]
pub trait RadioSurface: Send + Sync {
    async fn scan(&self) -> Result<Vec<BssInfo>, RadioError>;
    async fn connected_ssid(&self) -> Result<Option<String>, RadioError>;
    /// Point the station interface at an open network and reload.
    async fn apply_station(&self, ssid: &str) -> Result<(), RadioError>;
    /// Rename the local AP and reload.
    async fn set_local_ssid(&self, ssid: &str) -> Result<(), RadioError>;
    /// Persist pricing for the advertisement generator.
    async fn persist_pricing(&self, price_per_step: u64, step_size: u64)
        -> Result<(), RadioError>;
    /// Maximum configured price among accepted mints, for unpriced
    /// upstreams.
    fn fallback_price_per_step(&self) -> Option<u64>;
}

/// Parse `TollGate-<price_per_step>-<step_size>`.
pub fn parse_tollgate_ssid(ssid: &str) -> Option<(u64, u64)> {
    let rest = ssid.strip_prefix(TOLLGATE_SSID_PREFIX)?;
    let (price, step) = rest.split_once('-')?;
    let price = price.parse::<u64>().ok()?;
    let step = step.parse::<u64>().ok()?;
    (step >= 1).then_some((price, step))
}

pub fn format_tollgate_ssid(price_per_step: u64, step_size: u64) -> String {
    format!("{TOLLGATE_SSID_PREFIX}{price_per_step}-{step_size}")
}

fn price_penalty(price_factor: u64) -> f64 {
    20.0 * (price_factor.max(1) as f64).log10()
}

/// Non-decreasing in signal quality; capability IEs add a flat bonus.
fn signal_score(signal_dbm: i32, ies: &[u8]) -> f64 {
    let quality = (signal_dbm + 95).clamp(0, 65) as f64;
    quality + capability_bonus(ies)
}

fn capability_bonus(ies: &[u8]) -> f64 {
    let mut bonus = 0.0;
    let mut rest = ies;
    while rest.len() >= 2 {
        let id = rest[0];
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            break;
        }
        match id {
            // HT capabilities
            45 => bonus += 5.0,
            // VHT capabilities
            191 => bonus += 10.0,
            _ => {}
        }
        rest = &rest[2 + len..];
    }
    bonus
}

#[derive(Debug, Clone)]
struct Candidate {
    bss: BssInfo,
    price_per_step: u64,
    score: f64,
}

/// Open `TollGate-*` BSSes, sorted by (price ascending, score
/// descending). Unparseable or zero-priced tails rank as price 0.
fn rank_candidates(scan: Vec<BssInfo>) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = scan
        .into_iter()
        .filter(|bss| !bss.encrypted && bss.ssid.starts_with(TOLLGATE_SSID_PREFIX))
        .map(|bss| {
            let (price_per_step, step_size) = parse_tollgate_ssid(&bss.ssid).unwrap_or((0, 1));
            let price_factor = price_per_step.saturating_mul(step_size);
            let score = signal_score(bss.signal_dbm, &bss.information_elements)
                - price_penalty(price_factor);
            Candidate {
                bss,
                price_per_step,
                score,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.price_per_step.cmp(&b.price_per_step).then(
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    candidates
}

fn mirrored_price(upstream_price: u64, upstream_step: u64, margin: f64, our_step: u64) -> u64 {
    let upstream_total = upstream_price.saturating_mul(upstream_step) as f64;
    (upstream_total * (1.0 + margin) / our_step as f64).round() as u64
}

pub struct WirelessGatewayManager {
    reseller_mode: bool,
    margin: f64,
    step_size: u64,
    advert_port: u16,
    surface: Arc<dyn RadioSurface>,
    /// Serializes every mutation through the radio surface so a
    /// MirrorPricing cannot interleave with a subsequent associate.
    radio_lock: Mutex<()>,
    http: reqwest::Client,
}

impl WirelessGatewayManager {
    pub fn new(
        reseller_mode: bool,
        margin: f64,
        step_size: u64,
        advert_port: u16,
        surface: Arc<dyn RadioSurface>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reseller_mode,
            margin,
            step_size,
            advert_port,
            surface,
            radio_lock: Mutex::new(()),
            http: reqwest::Client::new(),
        })
    }

    /// Periodic scan/select/associate loop. Returns immediately when
    /// reseller mode is off.
    pub async fn run(self: Arc<Self>) {
        if !self.reseller_mode {
            log::info!("reseller mode off, wireless gateway manager idle");
            return;
        }

        let me = self.clone();
        tokio::spawn(async move { me.pinger_loop().await });

        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let scan = match self.surface.scan().await {
            Ok(scan) => scan,
            Err(e) => {
                // keep the current association
                log::warn!("wifi scan failed: {e}");
                return;
            }
        };

        let candidates = rank_candidates(scan);
        if candidates.is_empty() {
            log::debug!("no open TollGate networks in range");
            return;
        }

        let stable: Vec<&str> = candidates
            .iter()
            .take(STABLE_SET_SIZE)
            .map(|c| c.bss.ssid.as_str())
            .collect();

        let connected = self.surface.connected_ssid().await.unwrap_or(None);
        if let Some(current) = &connected {
            if stable.contains(&current.as_str()) {
                log::debug!("staying on {current}, still in the stable set");
                return;
            }
        }

        let best = &candidates[0];
        let _guard = self.radio_lock.lock().await;
        if let Err(e) = self.surface.apply_station(&best.bss.ssid).await {
            log::warn!("association with {} failed: {e}", best.bss.ssid);
            return;
        }
        log::info!(
            "associated with {} ({}, {} dBm, score {:.1})",
            best.bss.ssid,
            best.bss.bssid,
            best.bss.signal_dbm,
            best.score
        );

        if let Err(e) = self.mirror_pricing_locked().await {
            log::warn!("pricing mirror failed: {e}");
        }
    }

    /// Recompute and publish the local AP price from the upstream SSID.
    pub async fn mirror_pricing(&self) -> Result<(), RadioError> {
        let _guard = self.radio_lock.lock().await;
        self.mirror_pricing_locked().await
    }

    async fn mirror_pricing_locked(&self) -> Result<(), RadioError> {
        let Some(upstream_ssid) = self.surface.connected_ssid().await? else {
            log::debug!("not associated, nothing to mirror");
            return Ok(());
        };

        let our_price = match parse_tollgate_ssid(&upstream_ssid) {
            Some((price, step)) if price > 0 => {
                mirrored_price(price, step, self.margin, self.step_size)
            }
            _ => match self.surface.fallback_price_per_step() {
                Some(price) => {
                    log::info!("upstream {upstream_ssid} is unpriced, using fallback {price}");
                    price
                }
                None => {
                    log::warn!("upstream {upstream_ssid} is unpriced and no fallback configured");
                    return Ok(());
                }
            },
        };

        let local_ssid = format_tollgate_ssid(our_price, self.step_size);
        self.surface.set_local_ssid(&local_ssid).await?;
        self.surface
            .persist_pricing(our_price, self.step_size)
            .await?;
        log::info!("local pricing mirrored as {local_ssid}");
        Ok(())
    }

    /// Connectivity monitor: logs upstream reachability transitions.
    async fn pinger_loop(self: Arc<Self>) {
        let mut reachable: Option<bool> = None;
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;

            let Ok(gateway) = default_net::get_default_gateway() else {
                continue;
            };
            let url = format!("http://{}:{}/", gateway.ip_addr, self.advert_port);
            let now_reachable = self
                .http
                .get(&url)
                .timeout(PING_TIMEOUT)
                .send()
                .await
                .is_ok();

            if reachable != Some(now_reachable) {
                if now_reachable {
                    log::info!("upstream gateway {} reachable", gateway.ip_addr);
                } else {
                    log::warn!("upstream gateway {} unreachable", gateway.ip_addr);
                }
                reachable = Some(now_reachable);
            }
        }
    }
}
