//! tollgated — upstream connectivity daemon

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tollgated::chandler::Chandler;
use tollgated::config::Config;
use tollgated::crowsnest::{Crowsnest, GatewayPoller, HttpProber, LinkEventSource};
use tollgated::wallet::{CashuWallet, Wallet};
use tollgated::wireless::uci::UciSurface;
use tollgated::wireless::WirelessGatewayManager;

#[derive(Parser, Debug)]
#[command(name = "tollgated", about = "Buys and resells metered upstream connectivity")]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "/etc/tollgate/config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(&args.config).context("loading configuration")?;

    let wallet = Arc::new(CashuWallet::new().context("opening wallet")?);
    for mint in &config.accepted_mints {
        if let Err(e) = wallet.add_mint(mint).await {
            log::warn!("cannot load mint {mint}: {e}");
        }
    }
    let wallet: Arc<dyn Wallet> = wallet;

    let chandler = Chandler::new(config.chandler.clone(), config.advert_port, wallet);
    let prober = Arc::new(HttpProber::new(config.advert_port));
    let crowsnest = Crowsnest::new(chandler, prober, config.crowsnest.clone());

    let (link_tx, link_rx) = mpsc::channel(64);
    Box::new(GatewayPoller::new(
        config.crowsnest.ignore_interfaces.clone(),
    ))
    .spawn(link_tx);
    tokio::spawn(crowsnest.run(link_rx));

    if config.reseller_mode {
        let surface = Arc::new(UciSurface::new(
            "phy0-sta0",
            "wireless.sta",
            "wireless.default_radio0",
            config.fallback_price_per_step,
        ));
        let wgm = WirelessGatewayManager::new(
            true,
            config.margin,
            config.step_size,
            config.advert_port,
            surface,
        );
        tokio::spawn(wgm.run());
    }

    log::info!("tollgated running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("shutting down");
    Ok(())
}
