//! Shared fixtures: a scripted gateway on wiremock and a mock wallet.

#![allow(dead_code)]

use async_trait::async_trait;
use nostr::{Event, JsonUtil, Keys};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tollgated::chandler::UpstreamTollgate;
use tollgated::errors::WalletError;
use tollgated::protocol::{
    build_advertisement_event, build_session_event, Metric, PricingOption,
};
use tollgated::wallet::Wallet;
use wiremock::{Request, Respond, ResponseTemplate};

pub const MINT_A: &str = "https://mint-a.example.com";

/// In-memory wallet with per-mint balances.
pub struct MockWallet {
    balances: Mutex<HashMap<String, u64>>,
    pub minted: Mutex<Vec<(String, u64)>>,
}

impl MockWallet {
    pub fn with_balance(mint: &str, sats: u64) -> Arc<Self> {
        let mut balances = HashMap::new();
        balances.insert(mint.to_string(), sats);
        Arc::new(Self {
            balances: Mutex::new(balances),
            minted: Mutex::new(Vec::new()),
        })
    }

    pub fn minted_total(&self) -> u64 {
        self.minted.lock().unwrap().iter().map(|(_, sats)| sats).sum()
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn create_token(&self, mint_url: &str, amount_sats: u64) -> Result<String, WalletError> {
        let mut balances = self.balances.lock().unwrap();
        let balance = balances
            .get_mut(mint_url)
            .ok_or_else(|| WalletError::UnknownMint(mint_url.to_string()))?;
        if *balance < amount_sats {
            return Err(WalletError::InsufficientFunds {
                mint: mint_url.to_string(),
                needed: amount_sats,
                available: *balance,
            });
        }
        *balance -= amount_sats;
        self.minted
            .lock()
            .unwrap()
            .push((mint_url.to_string(), amount_sats));
        Ok(format!("cashuAmock{amount_sats}"))
    }

    async fn balance(&self, mint_url: &str) -> Result<u64, WalletError> {
        self.balances
            .lock()
            .unwrap()
            .get(mint_url)
            .copied()
            .ok_or_else(|| WalletError::UnknownMint(mint_url.to_string()))
    }

    fn accepts_mint(&self, mint_url: &str) -> bool {
        self.balances.lock().unwrap().contains_key(mint_url)
    }
}

pub fn pricing(price_per_step: u64, mint_url: &str, min_steps: u64) -> PricingOption {
    PricingOption {
        price_per_step,
        price_unit: "sat".to_string(),
        mint_url: mint_url.to_string(),
        min_steps,
    }
}

pub fn advert_json(
    gateway_keys: &Keys,
    metric: Metric,
    step_size: u64,
    options: &[PricingOption],
) -> String {
    build_advertisement_event(gateway_keys, metric, step_size, options)
        .unwrap()
        .as_json()
}

/// Build the handoff Crowsnest would produce for a mock gateway.
pub fn upstream(
    iface: &str,
    gateway_ip: &str,
    gateway_keys: &Keys,
    metric: Metric,
    step_size: u64,
    options: &[PricingOption],
) -> UpstreamTollgate {
    let json = advert_json(gateway_keys, metric, step_size, options);
    UpstreamTollgate {
        interface_name: iface.to_string(),
        local_mac: "aa:bb:cc:dd:ee:ff".to_string(),
        gateway_ip: gateway_ip.to_string(),
        advertisement: tollgated::protocol::parse_advertisement(json.as_bytes()).unwrap(),
        discovered_at: chrono::Utc::now(),
    }
}

/// Plays one or more gateways behind `POST /`: validates the payment
/// event, matches the `p` tag against its gateway identities and
/// answers with a signed session event. Allotments are scripted per
/// payment, the last one repeating.
pub struct SessionResponder {
    gateways: Vec<Keys>,
    metric: Metric,
    allotments: Vec<u64>,
    pub payments: Arc<AtomicUsize>,
}

impl SessionResponder {
    pub fn new(gateways: Vec<Keys>, metric: Metric, allotments: Vec<u64>) -> Self {
        Self {
            gateways,
            metric,
            allotments,
            payments: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Respond for SessionResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(event) = Event::from_json(&request.body) else {
            return ResponseTemplate::new(400);
        };
        if event.verify().is_err() {
            return ResponseTemplate::new(400);
        }

        let paid_gateway = event.tags.iter().find_map(|tag| {
            let parts = tag.as_slice();
            (parts.len() >= 2 && parts[0] == "p").then(|| parts[1].clone())
        });
        let Some(paid_gateway) = paid_gateway else {
            return ResponseTemplate::new(400);
        };
        let Some(gateway_keys) = self
            .gateways
            .iter()
            .find(|k| k.public_key().to_hex() == paid_gateway)
        else {
            return ResponseTemplate::new(400);
        };

        let n = self.payments.fetch_add(1, Ordering::SeqCst);
        let allotment = self
            .allotments
            .get(n)
            .or_else(|| self.allotments.last())
            .copied()
            .unwrap_or(0);

        let session =
            build_session_event(gateway_keys, &event.pubkey.to_hex(), self.metric, allotment)
                .unwrap();
        ResponseTemplate::new(200).set_body_raw(session.as_json(), "application/json")
    }
}

/// Scripted `/usage` endpoint for byte-metered sessions. Reports no
/// session until the first payment, then walks `used_sequence` against
/// `initial_total`; after a second payment it reports `renewed_total`.
pub struct UsageResponder {
    pub payments: Arc<AtomicUsize>,
    used_sequence: Vec<u64>,
    initial_total: u64,
    renewed_total: u64,
    polls: AtomicUsize,
}

impl UsageResponder {
    pub fn new(
        payments: Arc<AtomicUsize>,
        used_sequence: Vec<u64>,
        initial_total: u64,
        renewed_total: u64,
    ) -> Self {
        Self {
            payments,
            used_sequence,
            initial_total,
            renewed_total,
            polls: AtomicUsize::new(0),
        }
    }
}

impl Respond for UsageResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let payments = self.payments.load(Ordering::SeqCst);
        let body = if payments == 0 {
            "-1/-1".to_string()
        } else if payments == 1 {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            let used = self
                .used_sequence
                .get(n)
                .or_else(|| self.used_sequence.last())
                .copied()
                .unwrap_or(0);
            format!("{used}/{}", self.initial_total)
        } else {
            let used = self.used_sequence.last().copied().unwrap_or(0) + 100_000;
            format!("{used}/{}", self.renewed_total)
        };
        ResponseTemplate::new(200).set_body_raw(body, "text/plain")
    }
}
