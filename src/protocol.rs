//! TollGate wire protocol
//!
//! Signed-event codec for the gateway HTTP endpoints:
//! - advertisement parsing (kind 10021)
//! - payment construction (kind 21000)
//! - session / notice responses (kinds 1022 / 21023)
//! - the plain-text `/usage` body
//!
//! Every inbound event is signature-verified before any tag is read.

use crate::errors::ProtocolError;
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, Tag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Gateway product description, signed by the gateway.
pub const KIND_ADVERT: u16 = 10021;
/// Customer purchase request, signed by a fresh per-session key.
pub const KIND_PAYMENT: u16 = 21000;
/// Gateway acknowledgement of a purchase.
pub const KIND_SESSION: u16 = 1022;
/// Gateway error or informational response.
pub const KIND_NOTICE: u16 = 21023;

/// Conventional TCP port for the gateway advertisement endpoint.
pub const DEFAULT_ADVERT_PORT: u16 = 2121;

/// Unit a session is metered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Milliseconds,
    Bytes,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Milliseconds => "milliseconds",
            Metric::Bytes => "bytes",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "milliseconds" => Ok(Metric::Milliseconds),
            "bytes" => Ok(Metric::Bytes),
            other => Err(ProtocolError::InvalidTag(format!(
                "unknown metric: {other}"
            ))),
        }
    }
}

/// One way to pay the gateway, parsed from a `price_per_step` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingOption {
    pub price_per_step: u64,
    pub price_unit: String,
    pub mint_url: String,
    pub min_steps: u64,
}

/// Parsed and signature-verified gateway advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementInfo {
    pub gateway_pubkey: String,
    pub metric: Metric,
    pub step_size: u64,
    pub pricing_options: Vec<PricingOption>,
}

impl AdvertisementInfo {
    /// Re-check the constraints a session pipeline relies on.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.step_size < 1 {
            return Err(ProtocolError::InvalidTag(
                "step_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Gateway response to a payment POST, distinguished by event kind.
#[derive(Debug, Clone)]
pub enum PaymentResponse {
    Session(SessionGrant),
    Notice(GatewayNotice),
}

/// Verified session event contents.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub customer_pubkey: String,
    pub metric: Option<Metric>,
    /// New total allotment for the session, in the session metric.
    pub allotment: u64,
    pub event: Event,
}

/// Contents of a notice event.
#[derive(Debug, Clone)]
pub struct GatewayNotice {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// A `/usage` endpoint reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageReport {
    /// The gateway reports no session for this caller (`-1/-1`).
    NoSession,
    Metered { used: u64, total: u64 },
}

fn verified_event(bytes: &[u8], expected_kind: u16) -> Result<Event, ProtocolError> {
    let event = Event::from_json(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let got = event.kind.as_u16();
    if got != expected_kind {
        return Err(ProtocolError::WrongKind {
            expected: expected_kind,
            got,
        });
    }

    event.verify().map_err(|_| ProtocolError::BadSignature)?;
    Ok(event)
}

fn tag_slice(tag: &Tag) -> &[String] {
    tag.as_slice()
}

/// Parse and verify an advertisement event fetched from `GET /`.
pub fn parse_advertisement(bytes: &[u8]) -> Result<AdvertisementInfo, ProtocolError> {
    let event = verified_event(bytes, KIND_ADVERT)?;

    let mut metric = None;
    let mut step_size = None;
    let mut pricing_options = Vec::new();

    for tag in event.tags.iter() {
        let parts = tag_slice(tag);
        if parts.is_empty() {
            continue;
        }

        match parts[0].as_str() {
            "metric" => {
                if parts.len() >= 2 {
                    metric = Some(Metric::from_str(&parts[1])?);
                }
            }
            "step_size" => {
                if parts.len() >= 2 {
                    step_size = parts[1].parse::<u64>().ok();
                }
            }
            "price_per_step" => {
                // ["price_per_step", "cashu", <price>, <unit>, <mint_url>, <min_steps>]
                if parts.len() >= 6 && parts[1] == "cashu" {
                    let price_per_step = parts[2].parse::<u64>().unwrap_or(0);
                    let min_steps = parts[5].parse::<u64>().unwrap_or(1);
                    if price_per_step > 0 {
                        pricing_options.push(PricingOption {
                            price_per_step,
                            price_unit: parts[3].clone(),
                            mint_url: parts[4].clone(),
                            min_steps: min_steps.max(1),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let info = AdvertisementInfo {
        gateway_pubkey: event.pubkey.to_hex(),
        metric: metric.ok_or(ProtocolError::MissingTag("metric"))?,
        step_size: step_size.ok_or(ProtocolError::MissingTag("step_size"))?,
        pricing_options,
    };
    info.validate()?;
    Ok(info)
}

/// Build and sign a payment event for `POST /`.
pub fn build_payment_event(
    gateway_pubkey: &str,
    device_identifier: (&str, &str),
    bearer_token: &str,
    customer_keys: &Keys,
) -> Result<Event, ProtocolError> {
    let tags = vec![
        Tag::parse(vec!["p".to_string(), gateway_pubkey.to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
        Tag::parse(vec![
            "device-identifier".to_string(),
            device_identifier.0.to_string(),
            device_identifier.1.to_string(),
        ])
        .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
        Tag::parse(vec!["payment".to_string(), bearer_token.to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
    ];

    EventBuilder::new(Kind::Custom(KIND_PAYMENT), "")
        .tags(tags)
        .sign_with_keys(customer_keys)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Parse the body of a 200 response to a payment POST. The payload is a
/// session event on success or a notice event on logical rejection.
pub fn parse_payment_response(bytes: &[u8]) -> Result<PaymentResponse, ProtocolError> {
    let event = Event::from_json(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match event.kind.as_u16() {
        KIND_SESSION => {
            event.verify().map_err(|_| ProtocolError::BadSignature)?;
            parse_session_event(event).map(PaymentResponse::Session)
        }
        KIND_NOTICE => Ok(PaymentResponse::Notice(parse_notice_event(&event))),
        got => Err(ProtocolError::WrongKind {
            expected: KIND_SESSION,
            got,
        }),
    }
}

fn parse_session_event(event: Event) -> Result<SessionGrant, ProtocolError> {
    let mut customer_pubkey = None;
    let mut metric = None;
    let mut allotment = None;

    for tag in event.tags.iter() {
        let parts = tag_slice(tag);
        if parts.is_empty() {
            continue;
        }

        match parts[0].as_str() {
            "p" => {
                if parts.len() >= 2 {
                    customer_pubkey = Some(parts[1].clone());
                }
            }
            "allotment" => match parts.len() {
                // ["allotment", <metric>, <amount>]
                n if n >= 3 => {
                    metric = Metric::from_str(&parts[1]).ok();
                    allotment = parts[2].parse::<u64>().ok();
                }
                // legacy ["allotment", <amount>] with a separate metric tag
                2 => {
                    allotment = parts[1].parse::<u64>().ok();
                }
                _ => {}
            },
            "metric" => {
                if parts.len() >= 2 && metric.is_none() {
                    metric = Metric::from_str(&parts[1]).ok();
                }
            }
            _ => {}
        }
    }

    Ok(SessionGrant {
        customer_pubkey: customer_pubkey.ok_or(ProtocolError::MissingTag("p"))?,
        metric,
        allotment: allotment.ok_or(ProtocolError::MissingTag("allotment"))?,
        event,
    })
}

fn parse_notice_event(event: &Event) -> GatewayNotice {
    let mut code = None;
    let mut message = None;

    for tag in event.tags.iter() {
        let parts = tag_slice(tag);
        if parts.len() >= 2 {
            match parts[0].as_str() {
                "code" | "status" => code = Some(parts[1].clone()),
                "message" => message = Some(parts[1].clone()),
                _ => {}
            }
        }
    }

    if message.is_none() && !event.content.is_empty() {
        message = Some(event.content.clone());
    }

    GatewayNotice { code, message }
}

/// Parse the plain-text `/usage` body, `"<used>/<total>"`.
pub fn parse_usage_body(body: &str) -> Result<UsageReport, ProtocolError> {
    let trimmed = body.trim();
    if trimmed == "-1/-1" {
        return Ok(UsageReport::NoSession);
    }

    let (used, total) = trimmed
        .split_once('/')
        .ok_or_else(|| ProtocolError::Malformed(format!("bad usage body: {trimmed:?}")))?;

    let used = used
        .parse::<u64>()
        .map_err(|_| ProtocolError::Malformed(format!("bad usage count: {used:?}")))?;
    let total = total
        .parse::<u64>()
        .map_err(|_| ProtocolError::Malformed(format!("bad usage total: {total:?}")))?;

    Ok(UsageReport::Metered { used, total })
}

/// Build and sign an advertisement event (kind 10021). The daemon only
/// consumes advertisements; this builder keeps the codec symmetric for
/// downstream advertisement generation and for test gateways.
pub fn build_advertisement_event(
    gateway_keys: &Keys,
    metric: Metric,
    step_size: u64,
    options: &[PricingOption],
) -> Result<Event, ProtocolError> {
    let mut tags = vec![
        Tag::parse(vec!["metric".to_string(), metric.as_str().to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
        Tag::parse(vec!["step_size".to_string(), step_size.to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
    ];

    for opt in options {
        tags.push(
            Tag::parse(vec![
                "price_per_step".to_string(),
                "cashu".to_string(),
                opt.price_per_step.to_string(),
                opt.price_unit.clone(),
                opt.mint_url.clone(),
                opt.min_steps.to_string(),
            ])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
        );
    }

    EventBuilder::new(Kind::Custom(KIND_ADVERT), "")
        .tags(tags)
        .sign_with_keys(gateway_keys)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Build and sign a session event (kind 1022).
pub fn build_session_event(
    gateway_keys: &Keys,
    customer_pubkey: &str,
    metric: Metric,
    allotment: u64,
) -> Result<Event, ProtocolError> {
    let tags = vec![
        Tag::parse(vec!["p".to_string(), customer_pubkey.to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
        Tag::parse(vec![
            "allotment".to_string(),
            metric.as_str().to_string(),
            allotment.to_string(),
        ])
        .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
    ];

    EventBuilder::new(Kind::Custom(KIND_SESSION), "")
        .tags(tags)
        .sign_with_keys(gateway_keys)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Build and sign a notice event (kind 21023).
pub fn build_notice_event(
    gateway_keys: &Keys,
    code: &str,
    message: &str,
) -> Result<Event, ProtocolError> {
    let tags = vec![
        Tag::parse(vec!["code".to_string(), code.to_string()])
            .map_err(|e| ProtocolError::InvalidTag(e.to_string()))?,
    ];

    EventBuilder::new(Kind::Custom(KIND_NOTICE), message)
        .tags(tags)
        .sign_with_keys(gateway_keys)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}
