//! Configuration for the claims engine.
//!
//! Loaded from `claims_config.json` with support for an environment variable override.

use std::{
    collections::BTreeSet,
    env, fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::DimensionId;

pub const BUILTIN_CLAIMS_CONFIG: &str = include_str!("data/claims_config.json");
pub const CLAIMS_CONFIG_ENV: &str = "CLAIMS_CONFIG_PATH";

/// Root configuration for the claims engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClaimsConfig {
    pub general: GeneralSettings,
    pub expiration: ExpirationSettings,
    pub spreadout: SpreadoutSettings,
    pub lazy_packets: LazyPacketSettings,
    pub persistence: PersistenceSettings,
    pub server: ServerSettings,
}

impl ClaimsConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_CLAIMS_CONFIG).expect("builtin claims config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ClaimsConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ClaimsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ClaimsConfig::from_json_str(&contents)?;
        Ok(config)
    }

    /// Milliseconds represented by `tick` server ticks.
    pub fn tick_to_millis(&self, tick: u64) -> u64 {
        tick.saturating_mul(self.general.tick_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimsSyncMode {
    All,
    OwnedOnly,
    NotSynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionListType {
    Only,
    AllBut,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClaimableDimensions {
    pub list_type: DimensionListType,
    pub dimensions: BTreeSet<String>,
}

impl Default for ClaimableDimensions {
    fn default() -> Self {
        Self {
            list_type: DimensionListType::AllBut,
            dimensions: BTreeSet::new(),
        }
    }
}

impl ClaimableDimensions {
    pub fn allows(&self, dimension: &DimensionId) -> bool {
        let listed = self.dimensions.contains(dimension.as_str());
        match self.list_type {
            DimensionListType::Only => listed,
            DimensionListType::AllBut => !listed,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub claims_enabled: bool,
    pub max_player_claims: i32,
    pub max_player_forceloads: i32,
    pub max_claim_distance: i32,
    pub max_claims_per_request: usize,
    pub max_area_request_cells: usize,
    pub claimable_dimensions: ClaimableDimensions,
    pub allow_existing_claims_in_unclaimable_dimensions: bool,
    pub allow_existing_forceloads_in_unclaimable_dimensions: bool,
    pub claims_synchronization: ClaimsSyncMode,
    pub tick_millis: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            claims_enabled: true,
            max_player_claims: 500,
            max_player_forceloads: 10,
            max_claim_distance: 5,
            max_claims_per_request: 25,
            max_area_request_cells: 1024,
            claimable_dimensions: ClaimableDimensions::default(),
            allow_existing_claims_in_unclaimable_dimensions: true,
            allow_existing_forceloads_in_unclaimable_dimensions: false,
            claims_synchronization: ClaimsSyncMode::All,
            tick_millis: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExpirationSettings {
    pub enabled: bool,
    pub expiration_hours: u64,
    pub check_interval_minutes: u64,
    /// Expired claims move to the expired pseudo-owner instead of being removed.
    pub convert_expired_claims: bool,
}

impl Default for ExpirationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expiration_hours: 8760,
            check_interval_minutes: 360,
            convert_expired_claims: true,
        }
    }
}

impl ExpirationSettings {
    pub fn expiration_millis(&self) -> u64 {
        self.expiration_hours.saturating_mul(60 * 60 * 1000)
    }

    pub fn check_interval_millis(&self) -> u64 {
        self.check_interval_minutes.saturating_mul(60 * 1000)
    }
}

/// Per-tick step budgets of the background task pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpreadoutSettings {
    pub replace_per_tick: usize,
    pub replace_per_task: usize,
    pub expiration_per_tick: usize,
    pub expiration_per_task: usize,
    pub sync_per_tick: usize,
    pub sync_per_player: usize,
}

impl Default for SpreadoutSettings {
    fn default() -> Self {
        Self {
            replace_per_tick: 256,
            replace_per_task: 32,
            expiration_per_tick: 512,
            expiration_per_task: usize::MAX,
            sync_per_tick: 1024,
            sync_per_player: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LazyPacketSettings {
    pub bytes_per_tick_limit: usize,
    pub capacity: usize,
    pub bytes_per_confirmation: usize,
    pub speed_up_at_occupancy: f64,
    pub confirmation_timeout_ms: u64,
    pub clogged_after_ms: u64,
}

impl Default for LazyPacketSettings {
    fn default() -> Self {
        Self {
            bytes_per_tick_limit: 104_858,
            capacity: 104_857_600,
            bytes_per_confirmation: 524_280,
            speed_up_at_occupancy: 0.125,
            confirmation_timeout_ms: 60_000,
            clogged_after_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub data_dir: PathBuf,
    pub save_interval_ticks: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("claims_data"),
            save_interval_ticks: 6000,
        }
    }
}

/// Listen addresses of the headless server binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub player_bind: SocketAddr,
    pub command_bind: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            player_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41100),
            command_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 41101),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimsConfigError {
    #[error("failed to parse claims config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read claims config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle for accessing the active claims configuration.
#[derive(Resource, Debug, Clone)]
pub struct ClaimsConfigHandle(pub Arc<ClaimsConfig>);

impl ClaimsConfigHandle {
    pub fn new(config: Arc<ClaimsConfig>) -> Self {
        Self(config)
    }

    pub fn get(&self) -> Arc<ClaimsConfig> {
        Arc::clone(&self.0)
    }
}

/// Where the active configuration came from; `None` means builtin.
#[derive(Resource, Debug, Clone, Default)]
pub struct ClaimsConfigMetadata {
    path: Option<PathBuf>,
}

impl ClaimsConfigMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Load claims configuration from `CLAIMS_CONFIG_PATH`, falling back to the builtin copy.
pub fn load_claims_config_from_env() -> (Arc<ClaimsConfig>, ClaimsConfigMetadata) {
    if let Some(path) = env::var(CLAIMS_CONFIG_ENV).ok().map(PathBuf::from) {
        match ClaimsConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "claims::config",
                    path = %path.display(),
                    "claims_config.loaded=file"
                );
                return (Arc::new(config), ClaimsConfigMetadata::new(Some(path)));
            }
            Err(err) => {
                tracing::warn!(
                    target: "claims::config",
                    path = %path.display(),
                    error = %err,
                    "claims_config.load_failed"
                );
            }
        }
    }

    let config = ClaimsConfig::builtin();
    tracing::info!(target: "claims::config", "claims_config.loaded=builtin");
    (config, ClaimsConfigMetadata::new(None))
}
