use std::{collections::HashMap, fs, time::Duration};

use sync_core::SyncConfig;

#[derive(Debug)]
pub struct Settings {
    pub store_url: String,
    pub media_url: Option<String>,
    pub api_key: Option<String>,
    pub device_db: String,
    pub typing_expiry_ms: u64,
    pub connecting_grace_ms: u64,
    pub sending_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: "http://127.0.0.1:8000".into(),
            media_url: None,
            api_key: None,
            device_db: "sqlite://./data/device.db".into(),
            typing_expiry_ms: 3_000,
            connecting_grace_ms: 1_000,
            sending_timeout_ms: None,
        }
    }
}

impl Settings {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            typing_expiry: Duration::from_millis(self.typing_expiry_ms),
            connecting_grace: Duration::from_millis(self.connecting_grace_ms),
            sending_timeout: self.sending_timeout_ms.map(Duration::from_millis),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("store_url") {
                settings.store_url = v.clone();
            }
            if let Some(v) = file_cfg.get("media_url") {
                settings.media_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("api_key") {
                settings.api_key = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("device_db") {
                settings.device_db = v.clone();
            }
            if let Some(v) = file_cfg.get("typing_expiry_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.typing_expiry_ms = parsed;
                }
            }
            if let Some(v) = file_cfg.get("sending_timeout_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.sending_timeout_ms = Some(parsed);
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_STORE_URL") {
        settings.store_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_MEDIA_URL") {
        settings.media_url = Some(v);
    }
    if let Ok(v) = std::env::var("CHAT_API_KEY") {
        settings.api_key = Some(v);
    }
    if let Ok(v) = std::env::var("CHAT_DEVICE_DB") {
        settings.device_db = v;
    }
    if let Ok(v) = std::env::var("CHAT_SENDING_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.sending_timeout_ms = Some(parsed);
        }
    }

    settings
}
