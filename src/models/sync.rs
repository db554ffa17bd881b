// src/models/sync.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Reachability class published by the connection monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Slow,
    Offline,
}

impl ConnectionStatus {
    /// `slow` links still carry traffic; only `offline` halts delivery.
    pub fn can_deliver(&self) -> bool {
        !matches!(self, ConnectionStatus::Offline)
    }
}

/// Effective bandwidth class, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveType {
    /// Bandwidth class implied by a round-trip estimate.
    pub fn from_rtt_ms(rtt_ms: u32) -> Self {
        match rtt_ms {
            0..=269 => EffectiveType::FourG,
            270..=1399 => EffectiveType::ThreeG,
            1400..=1999 => EffectiveType::TwoG,
            _ => EffectiveType::Slow2g,
        }
    }
}

/// Link quality snapshot. Absent while offline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub effective_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: u32,
    pub save_data: bool,
}

/// What subscribers of the connection monitor receive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub quality: Option<ConnectionQuality>,
}

/// Coordinator status persisted in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "error" => Ok(SyncStatus::Error),
            other => Err(AppError::Protocol(format!("unknown sync status {:?}", other))),
        }
    }
}

/// Live progress of the current (or last) drain. Derived, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub in_progress: bool,
}

impl SyncProgress {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.synced + self.failed)
    }
}
