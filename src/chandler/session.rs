//! Upstream session entities

use crate::chandler::usage::UsageTracker;
use crate::protocol::{AdvertisementInfo, PricingOption};
use chrono::{DateTime, Utc};
use nostr::{Event, Keys};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A validated gateway discovery, as handed off by Crowsnest.
#[derive(Debug, Clone)]
pub struct UpstreamTollgate {
    pub interface_name: String,
    pub local_mac: String,
    pub gateway_ip: String,
    pub advertisement: AdvertisementInfo,
    pub discovered_at: DateTime<Utc>,
}

impl UpstreamTollgate {
    pub fn gateway_pubkey(&self) -> &str {
        &self.advertisement.gateway_pubkey
    }
}

/// Session status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Session is live and its usage tracker is running.
    Active,
    /// Renewal was refused by the budget check; resumable.
    Paused,
    /// Link lost or session terminated.
    Expired,
    /// Unrecoverable failure, e.g. pricing no longer compatible.
    Error,
}

/// One purchased upstream session.
#[derive(Clone)]
pub struct ChandlerSession {
    pub id: String,
    pub upstream: UpstreamTollgate,
    /// Fresh per-session identity; never reused, never persisted.
    pub customer_keys: Keys,
    pub selected_pricing: PricingOption,
    /// Last valid session event from the gateway. Absent for sessions
    /// recovered from the usage endpoint.
    pub session_event: Option<Event>,
    /// Total allotment in the session metric. Session events carry a
    /// new total, so this is replaced (not incremented) on renewal.
    pub total_allotment: u64,
    /// Remaining allotment at which the tracker requests renewal.
    pub renewal_offset: u64,
    pub tracker: Arc<dyn UsageTracker>,
    pub created_at: DateTime<Utc>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub last_renewal_at: Option<DateTime<Utc>>,
    /// Monotonic instant of the last advertisement fetch, for the
    /// renewal freshness check.
    pub advert_fetched_at: std::time::Instant,
    pub total_spent_sats: u64,
    pub payment_count: u32,
    pub status: SessionStatus,
}

impl ChandlerSession {
    pub fn gateway_pubkey(&self) -> &str {
        self.upstream.gateway_pubkey()
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

impl std::fmt::Debug for ChandlerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChandlerSession")
            .field("id", &self.id)
            .field("gateway_pubkey", &self.gateway_pubkey())
            .field("interface", &self.upstream.interface_name)
            .field("status", &self.status)
            .field("total_allotment", &self.total_allotment)
            .field("total_spent_sats", &self.total_spent_sats)
            .field("payment_count", &self.payment_count)
            .finish()
    }
}
