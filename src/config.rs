//! Process configuration, loaded from environment variables with a thin
//! `clap` front door for the handful of process-level overrides.

use clap::Parser;
use std::env;

#[derive(Parser, Debug)]
#[command(name = "cyberherd-guardian", about = "Zap-ingest and herd-admission engine")]
pub struct Cli {
    /// Path to a .env-style file to load before reading the environment.
    #[arg(long)]
    pub env_file: Option<String>,

    /// Skip the missed-zap recovery pass on startup.
    #[arg(long, default_value_t = false)]
    pub skip_recovery: bool,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub wallet_api_base_url: String,
    pub main_wallet_key: String,
    pub split_wallet_key: String,
    pub feeder_base_url: String,
    pub feeder_username: String,
    pub feeder_password: String,
    pub zap_feed_ws_url: String,
    pub self_pubkey_hex: String,
    pub self_secret_hex: String,
    pub default_relays: Vec<String>,
    pub max_herd_size: usize,
    pub headbutt_min_sats: i64,
    pub trigger_amount_sats: i64,
    pub predefined_wallet_address: String,
    pub predefined_wallet_alias: String,
    pub store_path: String,
}

fn required(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("missing required environment variable {name}"))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    /// Loads configuration from the process environment. Fails fast if a
    /// required variable is absent.
    pub fn from_env() -> Result<Self, String> {
        let default_relays = optional(
            "DEFAULT_RELAYS",
            "wss://relay.primal.net/,wss://relay.damus.io/,wss://nostr.oxtr.dev,wss://nostr-pub.wellorder.net",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        Ok(AppConfig {
            wallet_api_base_url: required("LNBITS_URL")?,
            main_wallet_key: required("HERD_KEY")?,
            split_wallet_key: required("CYBERHERD_KEY")?,
            feeder_base_url: required("OPENHAB_URL")?,
            feeder_username: optional("OPENHAB_USERNAME", ""),
            feeder_password: optional("OPENHAB_PASSWORD", ""),
            zap_feed_ws_url: required("LNBITS_WS_URL")?,
            self_pubkey_hex: required("HEX_KEY")?,
            self_secret_hex: required("NOS_SEC")?,
            default_relays,
            max_herd_size: optional("MAX_HERD_SIZE", "3")
                .parse()
                .map_err(|_| "MAX_HERD_SIZE must be a non-negative integer".to_string())?,
            headbutt_min_sats: optional("HEADBUTT_MIN_SATS", "10")
                .parse()
                .map_err(|_| "HEADBUTT_MIN_SATS must be an integer".to_string())?,
            trigger_amount_sats: optional("TRIGGER_AMOUNT_SATS", "1000")
                .parse()
                .map_err(|_| "TRIGGER_AMOUNT_SATS must be an integer".to_string())?,
            predefined_wallet_address: required("PREDEFINED_WALLET_ADDRESS")?,
            predefined_wallet_alias: optional("PREDEFINED_WALLET_ALIAS", "CyberHerd"),
            store_path: optional("CYBERHERD_DB_PATH", "cyberherd.db"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_is_an_error() {
        assert!(required("CYBERHERD_GUARDIAN_DEFINITELY_UNSET_VAR").is_err());
    }

    #[test]
    fn optional_falls_back_to_default() {
        assert_eq!(optional("CYBERHERD_GUARDIAN_DEFINITELY_UNSET_VAR2", "fallback"), "fallback");
    }
}
