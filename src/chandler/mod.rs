//! Session manager
//!
//! For every validated upstream handoff the Chandler decides whether to
//! buy a session, buys it, tracks it, renews it before exhaustion and
//! cleans it up on link loss. Sessions are in-memory, keyed by gateway
//! pubkey, guarded by a single mutex that is never held across a
//! payment HTTP call.

pub mod session;
pub mod usage;

pub use session::{ChandlerSession, SessionStatus, UpstreamTollgate};
pub use usage::{DataTrackerTiming, RenewalHandler, UsageTracker};

use crate::config::{ChandlerConfig, TrustConfig, TrustPolicy};
use crate::errors::{ChandlerError, ChandlerResult, WalletError};
use crate::protocol::{
    self, AdvertisementInfo, Metric, PaymentResponse, PricingOption, SessionGrant, UsageReport,
};
use crate::wallet::Wallet;
use async_trait::async_trait;
use chrono::Utc;
use nostr::{Event, JsonUtil, Keys};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use usage::{DataUsageTracker, TimeUsageTracker};
use uuid::Uuid;

/// How old a stored advertisement may get before a renewal re-fetches it.
const ADVERT_REFRESH: Duration = Duration::from_secs(60);

const PAYMENT_TIMEOUT: Duration = Duration::from_secs(10);
const USAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Chandler {
    config: ChandlerConfig,
    advert_port: u16,
    wallet: Arc<dyn Wallet>,
    http: reqwest::Client,
    data_tracker_timing: DataTrackerTiming,
    sessions: Mutex<HashMap<String, ChandlerSession>>,
}

impl Chandler {
    pub fn new(config: ChandlerConfig, advert_port: u16, wallet: Arc<dyn Wallet>) -> Arc<Self> {
        Self::with_timing(config, advert_port, wallet, DataTrackerTiming::default())
    }

    pub fn with_timing(
        config: ChandlerConfig,
        advert_port: u16,
        wallet: Arc<dyn Wallet>,
        data_tracker_timing: DataTrackerTiming,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            advert_port,
            wallet,
            http: reqwest::Client::new(),
            data_tracker_timing,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Buy (or recover) a session with a freshly discovered gateway.
    pub async fn handle_upstream_tollgate(
        self: &Arc<Self>,
        upstream: UpstreamTollgate,
    ) -> ChandlerResult<()> {
        let ad = upstream.advertisement.clone();
        ad.validate()
            .map_err(|e| ChandlerError::InvalidAdvertisement(e.to_string()))?;
        let gateway_pubkey = ad.gateway_pubkey.clone();

        check_trust(&self.config.trust, &gateway_pubkey)?;
        let pricing = select_pricing(&ad, self.wallet.as_ref())?;

        let balance = self.wallet.balance(&pricing.mint_url).await?;
        let min_cost = pricing.min_steps * pricing.price_per_step;
        if balance < min_cost {
            return Err(ChandlerError::InsufficientFunds {
                needed: min_cost,
                available: balance,
            });
        }

        let steps = compute_steps(
            self.preferred_increment(ad.metric),
            ad.step_size,
            &pricing,
            balance,
        )?;
        check_budget(&self.config, ad.metric, &pricing, ad.step_size)?;

        // interface singleton: a new active session replaces any other
        // active session on the same interface
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&gateway_pubkey) {
                if existing.is_active()
                    && existing.upstream.interface_name == upstream.interface_name
                {
                    log::info!("already holding an active session with {gateway_pubkey}");
                    return Ok(());
                }
            }
            let evicted = remove_active_on_interface(&mut sessions, &upstream.interface_name);
            drop(sessions);
            for old in &evicted {
                old.tracker.stop().await;
                log::info!(
                    "terminated session with {} to make room on {}",
                    old.gateway_pubkey(),
                    upstream.interface_name
                );
            }
        }

        // the gateway may still hold a session for this device from a
        // previous run; adopt it instead of paying again
        if let Some(UsageReport::Metered { used, total }) =
            self.fetch_usage(&upstream.gateway_ip).await
        {
            if total > 0 {
                log::info!(
                    "recovered existing session with {gateway_pubkey} ({used}/{total} {})",
                    ad.metric
                );
                let session = self.build_session(upstream, pricing, None, total, used, 0, 0);
                self.install(session).await;
                return Ok(());
            }
        }

        let customer_keys = Keys::generate();
        let amount = steps * pricing.price_per_step;
        let token = match self.wallet.create_token(&pricing.mint_url, amount).await {
            Ok(token) => token,
            // the payout routine may have drained the mint between the
            // balance check and the mint call; retriable
            Err(WalletError::InsufficientFunds {
                needed, available, ..
            }) => {
                return Err(ChandlerError::InsufficientFunds { needed, available });
            }
            Err(e) => return Err(e.into()),
        };

        let payment = protocol::build_payment_event(
            &gateway_pubkey,
            ("mac", &upstream.local_mac),
            &token,
            &customer_keys,
        )?;
        let grant = self
            .post_payment(&upstream.gateway_ip, &payment, &customer_keys, ad.metric)
            .await?;

        log::info!(
            "purchased session with {gateway_pubkey}: {} {} for {amount} sats",
            grant.allotment,
            ad.metric
        );
        let mut session = self.build_session(
            upstream,
            pricing,
            Some(grant.event.clone()),
            grant.allotment,
            0,
            amount,
            1,
        );
        session.customer_keys = customer_keys;
        self.install(session).await;
        Ok(())
    }

    /// Tracker callback: renew the session before the allotment runs out.
    pub async fn handle_upcoming_renewal(
        &self,
        gateway_pubkey: &str,
        current_usage: u64,
    ) -> ChandlerResult<()> {
        let snapshot = {
            let sessions = self.sessions.lock().await;
            match sessions.get(gateway_pubkey) {
                Some(s) if s.is_active() => s.clone(),
                _ => {
                    log::debug!("renewal requested for unknown or inactive {gateway_pubkey}");
                    return Ok(());
                }
            }
        };
        log::info!(
            "renewing session with {gateway_pubkey} at usage {current_usage}/{}",
            snapshot.total_allotment
        );

        let (ad, pricing) = self.refresh_advertisement(&snapshot).await?;

        let balance = match self.wallet.balance(&pricing.mint_url).await {
            Ok(balance) => balance,
            Err(e) => {
                log::warn!("wallet balance unavailable during renewal: {e}");
                return Err(e.into());
            }
        };
        let steps = match compute_steps(
            self.preferred_increment(ad.metric),
            ad.step_size,
            &pricing,
            balance,
        ) {
            Ok(steps) => steps,
            Err(e) => {
                // leave the session active; the tracker fires again or
                // the session exhausts
                log::warn!("cannot fund renewal for {gateway_pubkey}: {e}");
                return Err(e);
            }
        };

        if let Err(e) = check_budget(&self.config, ad.metric, &pricing, ad.step_size) {
            log::warn!("renewal for {gateway_pubkey} over budget, pausing: {e}");
            self.transition(gateway_pubkey, SessionStatus::Paused).await;
            return Err(e);
        }

        let amount = steps * pricing.price_per_step;
        let token = match self.wallet.create_token(&pricing.mint_url, amount).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("renewal token mint failed for {gateway_pubkey}: {e}");
                return Err(e.into());
            }
        };
        let payment = protocol::build_payment_event(
            gateway_pubkey,
            ("mac", &snapshot.upstream.local_mac),
            &token,
            &snapshot.customer_keys,
        )?;
        let grant = match self
            .post_payment(
                &snapshot.upstream.gateway_ip,
                &payment,
                &snapshot.customer_keys,
                ad.metric,
            )
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                log::warn!("renewal payment failed for {gateway_pubkey}, leaving active: {e}");
                return Err(e);
            }
        };

        // the session event carries the new total, not an increment
        let new_total = grant.allotment;
        let tracker = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(gateway_pubkey) {
                Some(s) if s.is_active() => {
                    let now = Utc::now();
                    s.total_allotment = new_total;
                    s.session_event = Some(grant.event);
                    s.last_renewal_at = Some(now);
                    s.last_payment_at = Some(now);
                    s.total_spent_sats += amount;
                    s.payment_count += 1;
                    Some(s.tracker.clone())
                }
                _ => {
                    log::info!("session {gateway_pubkey} gone during renewal, dropping response");
                    None
                }
            }
        };
        if let Some(tracker) = tracker {
            // committed; a time tracker re-arming here may cancel the
            // very task this call runs on, so nothing essential follows
            log::info!("renewed session with {gateway_pubkey}: new total {new_total}");
            tracker.session_changed(new_total).await;
        }
        Ok(())
    }

    /// Expire and remove every session riding on `iface`.
    pub async fn handle_disconnect(&self, iface: &str) -> ChandlerResult<()> {
        let removed: Vec<ChandlerSession> = {
            let mut sessions = self.sessions.lock().await;
            let gone: Vec<String> = sessions
                .values()
                .filter(|s| s.upstream.interface_name == iface)
                .map(|s| s.gateway_pubkey().to_string())
                .collect();
            gone.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        for mut session in removed {
            session.status = SessionStatus::Expired;
            session.tracker.stop().await;
            log::info!(
                "expired session with {} after {iface} went down",
                session.gateway_pubkey()
            );
        }
        Ok(())
    }

    pub async fn pause(&self, gateway_pubkey: &str) {
        if self
            .transition_if(gateway_pubkey, SessionStatus::Active, SessionStatus::Paused)
            .await
        {
            log::info!("paused session with {gateway_pubkey}");
        }
    }

    pub async fn resume(&self, gateway_pubkey: &str) {
        let tracker = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(gateway_pubkey) {
                Some(s) if s.status == SessionStatus::Paused => {
                    s.status = SessionStatus::Active;
                    Some(s.tracker.clone())
                }
                _ => None,
            }
        };
        if let Some(tracker) = tracker {
            tracker.start().await;
            log::info!("resumed session with {gateway_pubkey}");
        }
    }

    pub async fn terminate(&self, gateway_pubkey: &str) {
        let removed = self.sessions.lock().await.remove(gateway_pubkey);
        if let Some(mut session) = removed {
            session.status = SessionStatus::Expired;
            session.tracker.stop().await;
            log::info!("terminated session with {gateway_pubkey}");
        }
    }

    /// Sessions with status `Active`, keyed by gateway pubkey.
    pub async fn get_active_sessions(&self) -> HashMap<String, ChandlerSession> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }

    pub async fn get_session(&self, gateway_pubkey: &str) -> Option<ChandlerSession> {
        self.sessions.lock().await.get(gateway_pubkey).cloned()
    }

    fn preferred_increment(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Milliseconds => self.config.preferred_session_increments_milliseconds,
            Metric::Bytes => self.config.preferred_session_increments_bytes,
        }
    }

    fn renewal_offset(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Milliseconds => self.config.millisecond_renewal_offset,
            Metric::Bytes => self.config.bytes_renewal_offset,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_session(
        self: &Arc<Self>,
        upstream: UpstreamTollgate,
        pricing: PricingOption,
        session_event: Option<Event>,
        total_allotment: u64,
        initial_used: u64,
        spent_sats: u64,
        payment_count: u32,
    ) -> ChandlerSession {
        let metric = upstream.advertisement.metric;
        let gateway_pubkey = upstream.gateway_pubkey().to_string();
        let renewal_offset = self.renewal_offset(metric);
        let trait_self: Arc<dyn RenewalHandler> = self.clone();
        let handler: Weak<dyn RenewalHandler> = Arc::downgrade(&trait_self);

        let tracker: Arc<dyn UsageTracker> = match metric {
            Metric::Milliseconds => TimeUsageTracker::new(
                gateway_pubkey,
                total_allotment,
                renewal_offset,
                initial_used,
                handler,
            ),
            Metric::Bytes => DataUsageTracker::new(
                gateway_pubkey,
                &upstream.gateway_ip,
                self.advert_port,
                total_allotment,
                renewal_offset,
                self.data_tracker_timing,
                handler,
            ),
        };

        let now = Utc::now();
        ChandlerSession {
            id: Uuid::new_v4().to_string(),
            upstream,
            customer_keys: Keys::generate(),
            selected_pricing: pricing,
            session_event,
            total_allotment,
            renewal_offset,
            tracker,
            created_at: now,
            last_payment_at: (payment_count > 0).then_some(now),
            last_renewal_at: None,
            advert_fetched_at: Instant::now(),
            total_spent_sats: spent_sats,
            payment_count,
            status: SessionStatus::Active,
        }
    }

    /// Insert under the lock, re-checking the interface singleton that
    /// may have been violated while payment HTTP was in flight.
    async fn install(&self, session: ChandlerSession) {
        let tracker = session.tracker.clone();
        let evicted = {
            let mut sessions = self.sessions.lock().await;
            let mut evicted =
                remove_active_on_interface(&mut sessions, &session.upstream.interface_name);
            if let Some(old) = sessions.insert(session.gateway_pubkey().to_string(), session) {
                evicted.push(old);
            }
            evicted
        };
        for old in &evicted {
            old.tracker.stop().await;
        }
        tracker.start().await;
    }

    async fn transition(&self, gateway_pubkey: &str, to: SessionStatus) {
        self.transition_if(gateway_pubkey, SessionStatus::Active, to)
            .await;
    }

    async fn transition_if(
        &self,
        gateway_pubkey: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> bool {
        let tracker = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(gateway_pubkey) {
                Some(s) if s.status == from => {
                    s.status = to;
                    Some(s.tracker.clone())
                }
                _ => None,
            }
        };
        match tracker {
            Some(tracker) => {
                if to != SessionStatus::Active {
                    tracker.stop().await;
                }
                true
            }
            None => false,
        }
    }

    /// Renewal-time advertisement freshness check. Returns the pricing
    /// to use for this renewal; marks the session `Error` and stops the
    /// tracker when the gateway no longer offers a compatible option.
    async fn refresh_advertisement(
        &self,
        snapshot: &ChandlerSession,
    ) -> ChandlerResult<(AdvertisementInfo, PricingOption)> {
        let gateway_pubkey = snapshot.gateway_pubkey();
        if snapshot.advert_fetched_at.elapsed() < ADVERT_REFRESH {
            return Ok((
                snapshot.upstream.advertisement.clone(),
                snapshot.selected_pricing.clone(),
            ));
        }

        let fetched = match self.fetch_advertisement(&snapshot.upstream.gateway_ip).await {
            Some(ad) => ad,
            None => {
                // unreachable endpoint is not fatal; renew on stored terms
                return Ok((
                    snapshot.upstream.advertisement.clone(),
                    snapshot.selected_pricing.clone(),
                ));
            }
        };

        if fetched == snapshot.upstream.advertisement {
            let mut sessions = self.sessions.lock().await;
            if let Some(s) = sessions.get_mut(gateway_pubkey) {
                s.advert_fetched_at = Instant::now();
            }
            return Ok((fetched, snapshot.selected_pricing.clone()));
        }

        match select_pricing(&fetched, self.wallet.as_ref()) {
            Ok(pricing) => {
                let mut sessions = self.sessions.lock().await;
                if let Some(s) = sessions.get_mut(gateway_pubkey) {
                    s.upstream.advertisement = fetched.clone();
                    s.selected_pricing = pricing.clone();
                    s.advert_fetched_at = Instant::now();
                }
                log::info!("gateway {gateway_pubkey} changed its advertisement, repriced");
                Ok((fetched, pricing))
            }
            Err(e) => {
                log::warn!("gateway {gateway_pubkey} no longer offers compatible pricing");
                let tracker = {
                    let mut sessions = self.sessions.lock().await;
                    sessions.get_mut(gateway_pubkey).map(|s| {
                        s.status = SessionStatus::Error;
                        s.tracker.clone()
                    })
                };
                if let Some(tracker) = tracker {
                    tracker.stop().await;
                }
                Err(e)
            }
        }
    }

    async fn fetch_advertisement(&self, gateway_ip: &str) -> Option<AdvertisementInfo> {
        let url = format!("http://{gateway_ip}:{}/", self.advert_port);
        let response = match self.http.get(&url).timeout(USAGE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                log::debug!("advertisement re-fetch failed: {e}");
                return None;
            }
        };
        let bytes = response.bytes().await.ok()?;
        match protocol::parse_advertisement(&bytes) {
            Ok(ad) => Some(ad),
            Err(e) => {
                log::debug!("advertisement re-fetch invalid: {e}");
                None
            }
        }
    }

    async fn fetch_usage(&self, gateway_ip: &str) -> Option<UsageReport> {
        let url = format!("http://{gateway_ip}:{}/usage", self.advert_port);
        let response = self.http.get(&url).timeout(USAGE_TIMEOUT).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        protocol::parse_usage_body(&body).ok()
    }

    async fn post_payment(
        &self,
        gateway_ip: &str,
        payment: &Event,
        customer_keys: &Keys,
        metric: Metric,
    ) -> ChandlerResult<SessionGrant> {
        let url = format!("http://{gateway_ip}:{}/", self.advert_port);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payment.as_json())
            .timeout(PAYMENT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChandlerError::PaymentTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ChandlerError::PaymentTransport(e.to_string()))?;

        if !status.is_success() {
            return Err(ChandlerError::PaymentRejected(format!(
                "http {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        match protocol::parse_payment_response(&body) {
            Ok(PaymentResponse::Session(grant)) => {
                if grant.customer_pubkey != customer_keys.public_key().to_hex() {
                    return Err(ChandlerError::SessionInvalidResponse(
                        "p tag does not match the paying customer".into(),
                    ));
                }
                if let Some(granted_metric) = grant.metric {
                    if granted_metric != metric {
                        return Err(ChandlerError::SessionInvalidResponse(format!(
                            "allotment metric {granted_metric} does not match {metric}"
                        )));
                    }
                }
                Ok(grant)
            }
            Ok(PaymentResponse::Notice(notice)) => {
                let code = notice.code.unwrap_or_else(|| "unspecified".into());
                let message = notice.message.unwrap_or_default();
                log::warn!("gateway rejected payment: code={code} message={message:?}");
                Err(ChandlerError::PaymentRejected(format!("{code}: {message}")))
            }
            Err(e) => Err(ChandlerError::SessionInvalidResponse(e.to_string())),
        }
    }
}

#[async_trait]
impl RenewalHandler for Chandler {
    async fn handle_upcoming_renewal(
        &self,
        gateway_pubkey: &str,
        current_usage: u64,
    ) -> ChandlerResult<()> {
        Chandler::handle_upcoming_renewal(self, gateway_pubkey, current_usage).await
    }
}

fn remove_active_on_interface(
    sessions: &mut HashMap<String, ChandlerSession>,
    iface: &str,
) -> Vec<ChandlerSession> {
    let doomed: Vec<String> = sessions
        .values()
        .filter(|s| s.is_active() && s.upstream.interface_name == iface)
        .map(|s| s.gateway_pubkey().to_string())
        .collect();
    doomed
        .iter()
        .filter_map(|k| sessions.remove(k))
        .map(|mut s| {
            s.status = SessionStatus::Expired;
            s
        })
        .collect()
}

fn check_trust(trust: &TrustConfig, gateway_pubkey: &str) -> ChandlerResult<()> {
    if trust.blocklist.contains(gateway_pubkey) {
        return Err(ChandlerError::TrustDenied(gateway_pubkey.to_string()));
    }
    if trust.allowlist.contains(gateway_pubkey) {
        return Ok(());
    }
    match trust.default_policy {
        TrustPolicy::TrustAll => Ok(()),
        TrustPolicy::TrustNone => Err(ChandlerError::TrustDenied(gateway_pubkey.to_string())),
    }
}

fn select_pricing(ad: &AdvertisementInfo, wallet: &dyn Wallet) -> ChandlerResult<PricingOption> {
    ad.pricing_options
        .iter()
        .filter(|o| wallet.accepts_mint(&o.mint_url))
        .min_by_key(|o| (o.price_per_step, o.min_steps))
        .cloned()
        .ok_or(ChandlerError::NoCompatiblePricing)
}

fn compute_steps(
    preferred_increment: u64,
    step_size: u64,
    pricing: &PricingOption,
    balance: u64,
) -> ChandlerResult<u64> {
    let wanted = (preferred_increment / step_size)
        .max(pricing.min_steps)
        .max(1);
    let affordable = balance / pricing.price_per_step;
    let steps = wanted.min(affordable);
    if steps < pricing.min_steps {
        return Err(ChandlerError::InsufficientFunds {
            needed: pricing.min_steps * pricing.price_per_step,
            available: balance,
        });
    }
    Ok(steps)
}

fn check_budget(
    config: &ChandlerConfig,
    metric: Metric,
    pricing: &PricingOption,
    step_size: u64,
) -> ChandlerResult<()> {
    let price_per_unit = pricing.price_per_step as f64 / step_size as f64;
    let (max_per_unit, unit) = match metric {
        Metric::Milliseconds => (config.max_price_per_millisecond, "millisecond"),
        Metric::Bytes => (config.max_price_per_byte, "byte"),
    };
    if price_per_unit > max_per_unit {
        return Err(ChandlerError::BudgetExceeded {
            price_per_unit,
            max_per_unit,
            unit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeWallet {
        mints: HashSet<String>,
    }

    impl FakeWallet {
        fn accepting(mints: &[&str]) -> Self {
            Self {
                mints: mints.iter().map(|m| m.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl Wallet for FakeWallet {
        async fn create_token(
            &self,
            _mint_url: &str,
            _amount_sats: u64,
        ) -> Result<String, WalletError> {
            Ok("cashuAtest".to_string())
        }

        async fn balance(&self, _mint_url: &str) -> Result<u64, WalletError> {
            Ok(1_000)
        }

        fn accepts_mint(&self, mint_url: &str) -> bool {
            self.mints.contains(mint_url)
        }
    }

    fn option(price: u64, mint: &str, min_steps: u64) -> PricingOption {
        PricingOption {
            price_per_step: price,
            price_unit: "sat".to_string(),
            mint_url: mint.to_string(),
            min_steps,
        }
    }

    fn advert(options: Vec<PricingOption>) -> AdvertisementInfo {
        AdvertisementInfo {
            gateway_pubkey: "gw".to_string(),
            metric: Metric::Milliseconds,
            step_size: 60_000,
            pricing_options: options,
        }
    }

    #[test]
    fn trust_blocklist_beats_allowlist() {
        let trust = TrustConfig {
            default_policy: TrustPolicy::TrustAll,
            allowlist: ["pk1".to_string()].into_iter().collect(),
            blocklist: ["pk1".to_string()].into_iter().collect(),
        };
        assert!(matches!(
            check_trust(&trust, "pk1"),
            Err(ChandlerError::TrustDenied(_))
        ));
    }

    #[test]
    fn trust_none_requires_allowlist() {
        let trust = TrustConfig {
            default_policy: TrustPolicy::TrustNone,
            allowlist: ["pk_y".to_string()].into_iter().collect(),
            blocklist: HashSet::new(),
        };
        assert!(check_trust(&trust, "pk_y").is_ok());
        assert!(matches!(
            check_trust(&trust, "pk_x"),
            Err(ChandlerError::TrustDenied(_))
        ));
    }

    #[test]
    fn trust_all_accepts_unknown() {
        let trust = TrustConfig::default();
        assert!(check_trust(&trust, "anyone").is_ok());
    }

    #[test]
    fn pricing_prefers_cheapest_accepted_mint() {
        let wallet = FakeWallet::accepting(&["https://a", "https://b"]);
        let ad = advert(vec![
            option(5, "https://a", 1),
            option(2, "https://b", 1),
            option(1, "https://unaccepted", 1),
        ]);
        let picked = select_pricing(&ad, &wallet).unwrap();
        assert_eq!(picked.mint_url, "https://b");
    }

    #[test]
    fn pricing_tie_breaks_on_min_steps() {
        let wallet = FakeWallet::accepting(&["https://a", "https://b"]);
        let ad = advert(vec![option(2, "https://a", 10), option(2, "https://b", 1)]);
        let picked = select_pricing(&ad, &wallet).unwrap();
        assert_eq!(picked.mint_url, "https://b");
    }

    #[test]
    fn pricing_fails_without_accepted_mint() {
        let wallet = FakeWallet::accepting(&[]);
        let ad = advert(vec![option(2, "https://a", 1)]);
        assert!(matches!(
            select_pricing(&ad, &wallet),
            Err(ChandlerError::NoCompatiblePricing)
        ));
    }

    #[test]
    fn steps_follow_preferred_increment() {
        let pricing = option(2, "https://a", 1);
        // one minute at one-minute steps
        assert_eq!(compute_steps(60_000, 60_000, &pricing, 1_000).unwrap(), 1);
        // ten-second steps
        assert_eq!(compute_steps(60_000, 10_000, &pricing, 1_000).unwrap(), 6);
    }

    #[test]
    fn steps_respect_min_steps() {
        let pricing = option(2, "https://a", 10);
        assert_eq!(compute_steps(60_000, 60_000, &pricing, 1_000).unwrap(), 10);
    }

    #[test]
    fn steps_capped_by_balance() {
        let pricing = option(2, "https://a", 1);
        // wants 10 steps, can afford 4
        assert_eq!(compute_steps(100_000, 10_000, &pricing, 8).unwrap(), 4);
    }

    #[test]
    fn exact_minimum_balance_is_affordable() {
        let pricing = option(2, "https://a", 5);
        // balance is exactly min_steps * price
        assert_eq!(compute_steps(0, 1, &pricing, 10).unwrap(), 5);
    }

    #[test]
    fn below_minimum_balance_fails() {
        let pricing = option(2, "https://a", 5);
        let err = compute_steps(0, 1, &pricing, 9).unwrap_err();
        assert!(matches!(
            err,
            ChandlerError::InsufficientFunds {
                needed: 10,
                available: 9
            }
        ));
    }

    #[test]
    fn budget_check_compares_per_unit_price() {
        let config = ChandlerConfig::default();
        // 2 sats per 60 s step is well under 0.00278 sat/ms
        let cheap = option(2, "https://a", 1);
        assert!(check_budget(&config, Metric::Milliseconds, &cheap, 60_000).is_ok());

        // 2 sats per 100 ms step is 0.02 sat/ms
        let dear = option(2, "https://a", 1);
        assert!(matches!(
            check_budget(&config, Metric::Milliseconds, &dear, 100),
            Err(ChandlerError::BudgetExceeded { .. })
        ));
    }
}
