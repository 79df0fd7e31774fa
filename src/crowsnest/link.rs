//! Link-state monitoring
//!
//! Normalized link events plus a polling source built on the system's
//! default-route tables. Platforms with a richer event feed (netlink,
//! ubus) can provide their own [`LinkEventSource`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEventKind {
    InterfaceUp,
    InterfaceDown,
    AddressAdded,
    AddressRemoved,
}

/// Normalized link-state delta.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub kind: NetworkEventKind,
    pub interface_name: String,
    pub mac: Option<String>,
    pub ip_addrs: Vec<IpAddr>,
    pub gateway_ip: Option<String>,
    pub ts: DateTime<Utc>,
}

impl NetworkEvent {
    fn new(kind: NetworkEventKind, snapshot: &LinkSnapshot) -> Self {
        Self {
            kind,
            interface_name: snapshot.interface_name.clone(),
            mac: snapshot.mac.clone(),
            ip_addrs: snapshot.ip_addrs.clone(),
            gateway_ip: snapshot.gateway_ip.clone(),
            ts: Utc::now(),
        }
    }
}

/// Emits link events into a bounded channel until the receiver closes.
pub trait LinkEventSource: Send + 'static {
    fn spawn(self: Box<Self>, tx: mpsc::Sender<NetworkEvent>);
}

/// An interface that is up and has a default route.
#[derive(Debug, Clone)]
pub struct UpInterface {
    pub name: String,
    pub mac: String,
    pub gateway_ip: String,
}

/// Enumerate interfaces that are up with a gateway, minus `ignore`.
pub fn up_interfaces(ignore: &[String]) -> Vec<UpInterface> {
    default_net::get_interfaces()
        .into_iter()
        .filter(|iface| !ignore.contains(&iface.name))
        .filter_map(|iface| {
            let gateway = iface.gateway.as_ref()?;
            Some(UpInterface {
                name: iface.name.clone(),
                mac: interface_mac(&iface.name),
                gateway_ip: gateway.ip_addr.to_string(),
            })
        })
        .collect()
}

fn interface_mac(name: &str) -> String {
    mac_address::mac_address_by_name(name)
        .ok()
        .flatten()
        .map(|mac| mac.to_string().to_lowercase())
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string())
}

#[derive(Debug, Clone, PartialEq)]
struct LinkSnapshot {
    interface_name: String,
    mac: Option<String>,
    ip_addrs: Vec<IpAddr>,
    gateway_ip: Option<String>,
}

fn current_snapshot(ignore: &[String]) -> Option<LinkSnapshot> {
    let iface = default_net::get_default_interface().ok()?;
    if ignore.contains(&iface.name) {
        return None;
    }

    let mut ip_addrs: Vec<IpAddr> = iface
        .ipv4
        .iter()
        .map(|net| IpAddr::V4(net.addr))
        .collect();
    ip_addrs.extend(iface.ipv6.iter().map(|net| IpAddr::V6(net.addr)));

    Some(LinkSnapshot {
        interface_name: iface.name.clone(),
        mac: Some(interface_mac(&iface.name)),
        ip_addrs,
        gateway_ip: iface.gateway.as_ref().map(|g| g.ip_addr.to_string()),
    })
}

/// Polls the default route once a second and emits deltas as events.
pub struct GatewayPoller {
    poll_interval: Duration,
    ignore_interfaces: Vec<String>,
}

impl GatewayPoller {
    pub fn new(ignore_interfaces: Vec<String>) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ignore_interfaces,
        }
    }

    async fn run(self, tx: mpsc::Sender<NetworkEvent>) {
        let mut last: Option<LinkSnapshot> = None;

        loop {
            tokio::time::sleep(self.poll_interval).await;
            if tx.is_closed() {
                return;
            }

            let current = current_snapshot(&self.ignore_interfaces);
            for event in diff_snapshots(last.as_ref(), current.as_ref()) {
                log::debug!(
                    "link event {:?} on {} (gateway {:?})",
                    event.kind,
                    event.interface_name,
                    event.gateway_ip
                );
                // bounded channel: drop on overflow rather than stall the poller
                if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event) {
                    log::warn!(
                        "link event channel full, dropping {:?} for {}",
                        dropped.kind,
                        dropped.interface_name
                    );
                }
            }
            last = current;
        }
    }
}

fn diff_snapshots(last: Option<&LinkSnapshot>, current: Option<&LinkSnapshot>) -> Vec<NetworkEvent> {
    match (last, current) {
        (None, None) => Vec::new(),
        (None, Some(cur)) => vec![NetworkEvent::new(NetworkEventKind::InterfaceUp, cur)],
        (Some(old), None) => vec![NetworkEvent::new(NetworkEventKind::InterfaceDown, old)],
        (Some(old), Some(cur)) => {
            if old.interface_name != cur.interface_name || old.gateway_ip != cur.gateway_ip {
                return vec![
                    NetworkEvent::new(NetworkEventKind::InterfaceDown, old),
                    NetworkEvent::new(NetworkEventKind::InterfaceUp, cur),
                ];
            }
            if old.ip_addrs != cur.ip_addrs {
                let kind = if cur.ip_addrs.len() >= old.ip_addrs.len() {
                    NetworkEventKind::AddressAdded
                } else {
                    NetworkEventKind::AddressRemoved
                };
                return vec![NetworkEvent::new(kind, cur)];
            }
            Vec::new()
        }
    }
}

impl LinkEventSource for GatewayPoller {
    fn spawn(self: Box<Self>, tx: mpsc::Sender<NetworkEvent>) {
        tokio::spawn(async move { self.run(tx).await });
    }
}
