//! Cashu wallet integration
//!
//! The core only ever needs three operations from the wallet: mint a
//! bearer token against a mint, read a balance, and answer whether a
//! mint is accepted. [`Wallet`] captures exactly that; [`CashuWallet`]
//! backs it with cdk, one sqlite store per mint.

use crate::errors::WalletError;
use async_trait::async_trait;
use bip39::{Language, Mnemonic};
use cdk::amount::Amount;
use cdk::nuts::CurrencyUnit;
use cdk::wallet::{SendOptions, Wallet as CdkMintWallet};
use cdk_sqlite::wallet::WalletSqliteDatabase;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The wallet operations the connectivity core calls.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Mint a bearer token worth `amount_sats` against `mint_url`.
    async fn create_token(&self, mint_url: &str, amount_sats: u64) -> Result<String, WalletError>;

    /// Spendable balance at `mint_url`, in sats.
    async fn balance(&self, mint_url: &str) -> Result<u64, WalletError>;

    /// Whether the wallet can mint tokens for `mint_url`.
    fn accepts_mint(&self, mint_url: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredSecrets {
    mnemonic: Option<String>,
}

#[derive(Debug, Clone)]
struct WalletStoragePaths {
    secrets_file: PathBuf,
    wallets_dir: PathBuf,
}

impl WalletStoragePaths {
    fn new() -> Result<Self, WalletError> {
        let project_dirs = ProjectDirs::from("org", "tollgate", "tollgated")
            .ok_or_else(|| WalletError::Storage("cannot determine data directory".into()))?;

        let base_dir = project_dirs.data_dir().to_path_buf();
        let wallets_dir = base_dir.join("wallets");
        fs::create_dir_all(&base_dir).map_err(|e| WalletError::Storage(e.to_string()))?;
        fs::create_dir_all(&wallets_dir).map_err(|e| WalletError::Storage(e.to_string()))?;

        Ok(Self {
            secrets_file: base_dir.join("wallet-secrets.json"),
            wallets_dir,
        })
    }

    fn mint_db_path(&self, mint_url: &str) -> PathBuf {
        let hash = format!("{:x}", Sha256::digest(mint_url.as_bytes()));
        let sanitized: String = mint_url
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .take(32)
            .collect();
        let stem = if sanitized.is_empty() {
            hash[..16].to_string()
        } else {
            format!("{}-{}", sanitized.to_lowercase(), &hash[..16])
        };

        self.wallets_dir.join(format!("{stem}.sqlite"))
    }
}

fn load_or_create_seed(paths: &WalletStoragePaths) -> Result<[u8; 64], WalletError> {
    if paths.secrets_file.exists() {
        let data =
            fs::read(&paths.secrets_file).map_err(|e| WalletError::Storage(e.to_string()))?;
        let stored: StoredSecrets =
            serde_json::from_slice(&data).map_err(|e| WalletError::Storage(e.to_string()))?;
        let phrase = stored
            .mnemonic
            .ok_or_else(|| WalletError::Storage("wallet secrets file is empty".into()))?;
        let mnemonic = Mnemonic::parse_in(Language::English, phrase.trim())
            .map_err(|e| WalletError::Storage(format!("invalid mnemonic: {e}")))?;
        return Ok(mnemonic.to_seed(""));
    }

    let mnemonic = Mnemonic::generate_in(Language::English, 12)
        .map_err(|e| WalletError::Storage(format!("cannot generate mnemonic: {e}")))?;
    let stored = StoredSecrets {
        mnemonic: Some(mnemonic.to_string()),
    };
    let data =
        serde_json::to_vec_pretty(&stored).map_err(|e| WalletError::Storage(e.to_string()))?;
    fs::write(&paths.secrets_file, data).map_err(|e| WalletError::Storage(e.to_string()))?;

    Ok(mnemonic.to_seed(""))
}

/// cdk-backed multi-mint wallet, one sqlite store per mint.
pub struct CashuWallet {
    wallets: RwLock<HashMap<String, CdkMintWallet>>,
    /// Mint URLs registered via [`CashuWallet::add_mint`]. Kept in a
    /// sync lock so `accepts_mint` stays callable without awaiting.
    accepted: std::sync::RwLock<std::collections::HashSet<String>>,
    storage: WalletStoragePaths,
    seed: [u8; 64],
}

impl CashuWallet {
    pub fn new() -> Result<Self, WalletError> {
        let storage = WalletStoragePaths::new()?;
        let seed = load_or_create_seed(&storage)?;

        Ok(Self {
            wallets: RwLock::new(HashMap::new()),
            accepted: std::sync::RwLock::new(std::collections::HashSet::new()),
            storage,
            seed,
        })
    }

    /// Open (or create) the per-mint store and register the mint.
    pub async fn add_mint(&self, mint_url: &str) -> Result<(), WalletError> {
        {
            let wallets = self.wallets.read().await;
            if wallets.contains_key(mint_url) {
                return Ok(());
            }
        }

        let db_path = self.storage.mint_db_path(mint_url);
        let localstore = WalletSqliteDatabase::new(db_path)
            .await
            .map_err(|e| WalletError::Storage(format!("wallet db for {mint_url}: {e}")))?;

        let wallet = CdkMintWallet::new(
            mint_url,
            CurrencyUnit::Sat,
            Arc::new(localstore),
            &self.seed,
            None,
        )
        .map_err(|e| WalletError::Backend(format!("wallet for {mint_url}: {e}")))?;

        self.wallets
            .write()
            .await
            .insert(mint_url.to_string(), wallet);
        if let Ok(mut accepted) = self.accepted.write() {
            accepted.insert(mint_url.to_string());
        }
        log::info!("wallet loaded mint {mint_url}");
        Ok(())
    }

    async fn wallet_for(&self, mint_url: &str) -> Result<CdkMintWallet, WalletError> {
        self.wallets
            .read()
            .await
            .get(mint_url)
            .cloned()
            .ok_or_else(|| WalletError::UnknownMint(mint_url.to_string()))
    }
}

#[async_trait]
impl Wallet for CashuWallet {
    async fn create_token(&self, mint_url: &str, amount_sats: u64) -> Result<String, WalletError> {
        let wallet = self.wallet_for(mint_url).await?;

        let balance: u64 = wallet
            .total_balance()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?
            .into();
        if balance < amount_sats {
            return Err(WalletError::InsufficientFunds {
                mint: mint_url.to_string(),
                needed: amount_sats,
                available: balance,
            });
        }

        let prepared = wallet
            .prepare_send(Amount::from(amount_sats), SendOptions::default())
            .await
            .map_err(|e| WalletError::Backend(format!("prepare send: {e}")))?;

        let token = wallet
            .send(prepared, None)
            .await
            .map_err(|e| WalletError::Backend(format!("confirm send: {e}")))?;

        Ok(token.to_string())
    }

    async fn balance(&self, mint_url: &str) -> Result<u64, WalletError> {
        let wallet = self.wallet_for(mint_url).await?;
        let balance = wallet
            .total_balance()
            .await
            .map_err(|e| WalletError::Backend(e.to_string()))?;
        Ok(balance.into())
    }

    fn accepts_mint(&self, mint_url: &str) -> bool {
        self.accepted
            .read()
            .map(|accepted| accepted.contains(mint_url))
            .unwrap_or(false)
    }
}
