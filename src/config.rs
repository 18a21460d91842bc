use std::time::Duration;

pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;
const MAX_CONCURRENT_DOWNLOADS: usize = 64;
pub const DEFAULT_PROGRESS_GRANULARITY: usize = 5;
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;
const DEFAULT_RETRY_WAIT_MS: u64 = 5000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 300;
const DEFAULT_NATIVES_DELAY_MS: u64 = 1000;

pub const DEFAULT_VERSION_MANIFEST_URL: &str =
    "https://launchermeta.mojang.com/mc/game/version_manifest.json";
pub const DEFAULT_RESOURCES_URL: &str = "https://resources.download.minecraft.net";
pub const DEFAULT_FABRIC_META_URL: &str = "https://meta.fabricmc.net/v2";

/// Tunables for the acquisition and reconciliation engine.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub concurrent_downloads: usize,
    pub progress_granularity: usize,
    pub max_attempts: usize,
    pub retry_wait: Duration,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub settle_delay: Duration,
    pub natives_delay: Duration,
    pub lock_stale_check: bool,
    pub version_manifest_url: String,
    pub resources_url: String,
    pub fabric_meta_url: String,
    pub extra_dependencies_url: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            progress_granularity: DEFAULT_PROGRESS_GRANULARITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_wait: Duration::from_millis(DEFAULT_RETRY_WAIT_MS),
            http_timeout: Duration::from_secs(60),
            http_connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            natives_delay: Duration::from_millis(DEFAULT_NATIVES_DELAY_MS),
            lock_stale_check: true,
            version_manifest_url: DEFAULT_VERSION_MANIFEST_URL.to_string(),
            resources_url: DEFAULT_RESOURCES_URL.to_string(),
            fabric_meta_url: DEFAULT_FABRIC_META_URL.to_string(),
            extra_dependencies_url: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrent_downloads: env_usize("LAUNCHER_CONCURRENT_DOWNLOADS")
                .map(|value| value.clamp(1, MAX_CONCURRENT_DOWNLOADS))
                .unwrap_or(defaults.concurrent_downloads),
            progress_granularity: env_usize("LAUNCHER_PROGRESS_GRANULARITY")
                .map(|value| value.clamp(1, 1000))
                .unwrap_or(defaults.progress_granularity),
            max_attempts: env_usize("LAUNCHER_DOWNLOAD_MAX_ATTEMPTS")
                .map(|value| value.clamp(1, 50))
                .unwrap_or(defaults.max_attempts),
            retry_wait: env_usize("LAUNCHER_DOWNLOAD_RETRY_WAIT_MS")
                .map(|value| Duration::from_millis(value.clamp(0, 120_000) as u64))
                .unwrap_or(defaults.retry_wait),
            http_timeout: env_usize("LAUNCHER_HTTP_TIMEOUT_SECONDS")
                .map(|value| Duration::from_secs(value.clamp(5, 3600) as u64))
                .unwrap_or(defaults.http_timeout),
            http_connect_timeout: env_usize("LAUNCHER_HTTP_CONNECT_TIMEOUT_SECONDS")
                .map(|value| Duration::from_secs(value.clamp(1, 120) as u64))
                .unwrap_or(defaults.http_connect_timeout),
            settle_delay: env_usize("LAUNCHER_SETTLE_DELAY_MS")
                .map(|value| Duration::from_millis(value.clamp(0, 10_000) as u64))
                .unwrap_or(defaults.settle_delay),
            natives_delay: env_usize("LAUNCHER_NATIVES_DELAY_MS")
                .map(|value| Duration::from_millis(value.clamp(0, 10_000) as u64))
                .unwrap_or(defaults.natives_delay),
            lock_stale_check: env_bool("LAUNCHER_LOCK_STALE_CHECK")
                .unwrap_or(defaults.lock_stale_check),
            version_manifest_url: env_string("LAUNCHER_VERSION_MANIFEST_URL")
                .unwrap_or(defaults.version_manifest_url),
            resources_url: env_string("LAUNCHER_RESOURCES_URL").unwrap_or(defaults.resources_url),
            fabric_meta_url: env_string("LAUNCHER_FABRIC_META_URL")
                .unwrap_or(defaults.fabric_meta_url),
            extra_dependencies_url: env_string("LAUNCHER_EXTRA_DEPENDENCIES_URL"),
        }
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|value| {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = EngineSettings::default();
        assert_eq!(settings.concurrent_downloads, 4);
        assert_eq!(settings.max_attempts, 10);
        assert_eq!(settings.retry_wait, Duration::from_secs(5));
        assert_eq!(settings.settle_delay, Duration::from_millis(300));
        assert_eq!(settings.natives_delay, Duration::from_secs(1));
        assert!(settings.extra_dependencies_url.is_none());
    }

    #[test]
    fn env_values_are_clamped() {
        std::env::set_var("LAUNCHER_CONCURRENT_DOWNLOADS", "500");
        std::env::set_var("LAUNCHER_LOCK_STALE_CHECK", "off");
        let settings = EngineSettings::from_env();
        std::env::remove_var("LAUNCHER_CONCURRENT_DOWNLOADS");
        std::env::remove_var("LAUNCHER_LOCK_STALE_CHECK");

        assert_eq!(settings.concurrent_downloads, MAX_CONCURRENT_DOWNLOADS);
        assert!(!settings.lock_stale_check);
    }
}
