//! Collaborator seams for owner limits and dimension policy.

use std::collections::HashMap;

use crate::config::{ClaimableDimensions, GeneralSettings};
use crate::ids::{DimensionId, PlayerId};

/// Source of per-owner claim limits and force-load preferences.
///
/// Base limits and bonuses are resolved separately and summed by the
/// manager; implementations must not fold the bonus into the base.
pub trait OwnerLimitProvider: Send + Sync {
    fn base_claim_limit(&self, owner: PlayerId, online: bool) -> i32;
    fn base_forceload_limit(&self, owner: PlayerId, online: bool) -> i32;
    fn bonus_claims(&self, owner: PlayerId) -> i32;
    fn bonus_forceloads(&self, owner: PlayerId) -> i32;

    /// Whether the owner wants their forceloadable claims kept loaded at all.
    fn forceload_enabled(&self, _owner: PlayerId) -> bool {
        true
    }

    /// Whether forceloads stay active while the owner is offline.
    fn offline_forceload(&self, _owner: PlayerId) -> bool {
        false
    }
}

pub trait DimensionPolicy: Send + Sync {
    fn is_claimable(&self, dimension: &DimensionId) -> bool;
}

impl DimensionPolicy for ClaimableDimensions {
    fn is_claimable(&self, dimension: &DimensionId) -> bool {
        self.allows(dimension)
    }
}

/// Per-owner settings normally held by the player-config subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerSettings {
    pub bonus_claims: i32,
    pub bonus_forceloads: i32,
    pub forceload_enabled: bool,
    pub offline_forceload: bool,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            bonus_claims: 0,
            bonus_forceloads: 0,
            forceload_enabled: true,
            offline_forceload: false,
        }
    }
}

/// Config-backed limits with optional permission overrides.
///
/// A permission override only applies while its player is online; offline
/// players fall back to the configured default, as a permission system
/// cannot be queried for them.
#[derive(Debug, Clone, Default)]
pub struct ConfigLimits {
    default_claims: i32,
    default_forceloads: i32,
    permission_claims: HashMap<PlayerId, i32>,
    permission_forceloads: HashMap<PlayerId, i32>,
    settings: HashMap<PlayerId, OwnerSettings>,
}

impl ConfigLimits {
    pub fn from_settings(general: &GeneralSettings) -> Self {
        Self {
            default_claims: general.max_player_claims,
            default_forceloads: general.max_player_forceloads,
            ..Self::default()
        }
    }

    pub fn set_permission_claims(&mut self, owner: PlayerId, limit: i32) {
        self.permission_claims.insert(owner, limit);
    }

    pub fn set_permission_forceloads(&mut self, owner: PlayerId, limit: i32) {
        self.permission_forceloads.insert(owner, limit);
    }

    pub fn set_owner_settings(&mut self, owner: PlayerId, settings: OwnerSettings) {
        self.settings.insert(owner, settings);
    }

    fn settings(&self, owner: PlayerId) -> OwnerSettings {
        self.settings.get(&owner).copied().unwrap_or_default()
    }
}

impl OwnerLimitProvider for ConfigLimits {
    fn base_claim_limit(&self, owner: PlayerId, online: bool) -> i32 {
        match self.permission_claims.get(&owner) {
            Some(limit) if online => *limit,
            _ => self.default_claims,
        }
    }

    fn base_forceload_limit(&self, owner: PlayerId, online: bool) -> i32 {
        match self.permission_forceloads.get(&owner) {
            Some(limit) if online => *limit,
            _ => self.default_forceloads,
        }
    }

    fn bonus_claims(&self, owner: PlayerId) -> i32 {
        self.settings(owner).bonus_claims
    }

    fn bonus_forceloads(&self, owner: PlayerId) -> i32 {
        self.settings(owner).bonus_forceloads
    }

    fn forceload_enabled(&self, owner: PlayerId) -> bool {
        self.settings(owner).forceload_enabled
    }

    fn offline_forceload(&self, owner: PlayerId) -> bool {
        self.settings(owner).offline_forceload
    }
}
