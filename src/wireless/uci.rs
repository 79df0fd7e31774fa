//! OpenWrt radio surface
//!
//! Shells out to `uci`, `ubus` and `wifi`. This is the only place the
//! daemon touches the distro configuration; other distros supply their
//! own [`RadioSurface`](super::RadioSurface).

use super::{BssInfo, RadioSurface};
use crate::errors::RadioError;
use async_trait::async_trait;
use tokio::process::Command;

pub struct UciSurface {
    /// iwinfo device of the station radio, e.g. `phy0-sta0`.
    station_device: String,
    /// uci section of the station interface, e.g. `wireless.sta`.
    station_section: String,
    /// uci section of the local AP, e.g. `wireless.default_radio0`.
    ap_section: String,
    fallback_price: Option<u64>,
}

impl UciSurface {
    pub fn new(
        station_device: impl Into<String>,
        station_section: impl Into<String>,
        ap_section: impl Into<String>,
        fallback_price: Option<u64>,
    ) -> Self {
        Self {
            station_device: station_device.into(),
            station_section: station_section.into(),
            ap_section: ap_section.into(),
            fallback_price,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, RadioError> {
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(RadioError::Command(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn uci_set(&self, assignment: &str) -> Result<(), RadioError> {
        self.run("uci", &["set", assignment]).await.map(|_| ())
    }

    async fn reload_radio(&self) -> Result<(), RadioError> {
        self.run("uci", &["commit", "wireless"]).await?;
        self.run("wifi", &["reload"]).await.map(|_| ())
    }
}

#[async_trait]
impl RadioSurface for UciSurface {
    async fn scan(&self) -> Result<Vec<BssInfo>, RadioError> {
        let payload = format!(r#"{{"device":"{}"}}"#, self.station_device);
        let stdout = self
            .run("ubus", &["call", "iwinfo", "scan", payload.as_str()])
            .await
            .map_err(|e| RadioError::Scan(e.to_string()))?;

        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| RadioError::Scan(e.to_string()))?;
        let results = parsed["results"]
            .as_array()
            .ok_or_else(|| RadioError::Scan("scan output has no results array".into()))?;

        Ok(results
            .iter()
            .filter_map(|entry| {
                Some(BssInfo {
                    bssid: entry["bssid"].as_str()?.to_string(),
                    ssid: entry["ssid"].as_str().unwrap_or("").to_string(),
                    signal_dbm: entry["signal"].as_i64().unwrap_or(-100) as i32,
                    encrypted: entry["encryption"]["enabled"].as_bool().unwrap_or(true),
                    // iwinfo does not expose raw IEs over ubus
                    information_elements: Vec::new(),
                })
            })
            .collect())
    }

    async fn connected_ssid(&self) -> Result<Option<String>, RadioError> {
        let payload = format!(r#"{{"device":"{}"}}"#, self.station_device);
        let stdout = self.run("ubus", &["call", "iwinfo", "info", payload.as_str()]).await?;
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|e| RadioError::Command(e.to_string()))?;
        Ok(parsed["ssid"].as_str().map(|s| s.to_string()))
    }

    async fn apply_station(&self, ssid: &str) -> Result<(), RadioError> {
        let section = &self.station_section;
        self.uci_set(&format!("{section}.network=wan")).await?;
        self.uci_set(&format!("{section}.mode=sta")).await?;
        self.uci_set(&format!("{section}.ssid={ssid}")).await?;
        self.uci_set(&format!("{section}.encryption=none")).await?;
        self.uci_set(&format!("{section}.disabled=0")).await?;
        self.reload_radio().await
    }

    async fn set_local_ssid(&self, ssid: &str) -> Result<(), RadioError> {
        self.uci_set(&format!("{}.ssid={ssid}", self.ap_section))
            .await?;
        self.reload_radio().await
    }

    async fn persist_pricing(
        &self,
        price_per_step: u64,
        step_size: u64,
    ) -> Result<(), RadioError> {
        self.uci_set(&format!("tollgate.pricing.price_per_step={price_per_step}"))
            .await?;
        self.uci_set(&format!("tollgate.pricing.step_size={step_size}"))
            .await?;
        self.run("uci", &["commit", "tollgate"]).await.map(|_| ())
    }

    fn fallback_price_per_step(&self) -> Option<u64> {
        self.fallback_price
    }
}
