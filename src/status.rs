//! Status Publishing
//!
//! The snapshot file is the only channel between the control loop and the
//! dashboard. It is replaced with write-to-temp + rename, so a reader sees
//! either the previous document or the new one, never a mix. The temp
//! file is flushed to disk before the rename so a power cut cannot leave a
//! renamed but empty document behind.

use crate::decision::RoutingDecision;
use crate::health::LinkHealth;
use crate::{Uplink, UplinkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Published status document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// `single` / `balanced`; `None` until a decision has been applied
    pub current_mode: Option<String>,
    /// Interface carrying all traffic in single mode
    pub current_primary: Option<String>,
    /// When the applied decision took effect
    pub effective_since: Option<DateTime<Utc>>,
    /// Full decision in force
    pub decision: Option<RoutingDecision>,
    /// First uplink
    pub wan1: LinkStatus,
    /// Second uplink
    pub wan2: LinkStatus,
}

impl StatusSnapshot {
    /// Snapshot taken now
    pub fn new(wan1: &LinkHealth, wan2: &LinkHealth, decision: Option<&RoutingDecision>) -> Self {
        Self {
            timestamp: Utc::now(),
            current_mode: decision.map(|d| d.mode.kind().to_string()),
            current_primary: decision.and_then(|d| d.mode.primary().map(str::to_string)),
            effective_since: decision.map(|d| d.effective_since),
            decision: decision.cloned(),
            wan1: LinkStatus::new(Uplink::Wan1, wan1),
            wan2: LinkStatus::new(Uplink::Wan2, wan2),
        }
    }

    /// Status of one uplink
    pub fn link(&self, uplink: Uplink) -> &LinkStatus {
        match uplink {
            Uplink::Wan1 => &self.wan1,
            Uplink::Wan2 => &self.wan2,
        }
    }

    /// Seconds since the snapshot was taken
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.timestamp).num_seconds()
    }
}

/// Per-link entry of the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Kernel interface name
    pub interface: String,
    /// Which uplink this is
    pub role: Uplink,
    /// Connectivity above threshold
    pub online: bool,
    /// Mean RTT of reached targets
    pub latency_ms: f64,
    /// Share of targets not reached
    pub packet_loss_pct: f64,
    /// Share of targets reached
    pub connectivity_score: f64,
    /// Composite 0-100 score
    pub quality_score: f64,
    /// Online but over a latency or loss threshold
    pub degraded: bool,
}

impl LinkStatus {
    fn new(role: Uplink, health: &LinkHealth) -> Self {
        Self {
            interface: health.interface_name.clone(),
            role,
            online: health.online,
            latency_ms: health.latency_ms,
            packet_loss_pct: health.packet_loss_pct,
            connectivity_score: health.connectivity_score,
            quality_score: health.quality_score,
            degraded: health.degraded,
        }
    }
}

/// Atomic snapshot writer
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    path: PathBuf,
}

impl StatusPublisher {
    /// Publisher for the document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Document location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build and publish a snapshot
    pub async fn publish(
        &self,
        wan1: &LinkHealth,
        wan2: &LinkHealth,
        decision: Option<&RoutingDecision>,
    ) -> Result<StatusSnapshot, UplinkError> {
        let snapshot = StatusSnapshot::new(wan1, wan2, decision);
        self.write(&snapshot).await?;
        Ok(snapshot)
    }

    /// Atomically replace the snapshot file
    pub async fn write(&self, snapshot: &StatusSnapshot) -> Result<(), UplinkError> {
        let body = serde_json::to_vec_pretty(snapshot)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Same directory as the target so the rename stays on one filesystem.
        let tmp = self.temp_path();
        if let Err(e) = write_synced(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.sync_dir().await;

        tracing::debug!("Published status to {}", self.path.display());
        Ok(())
    }

    /// Persist the rename itself; the document is already complete either way
    async fn sync_dir(&self) {
        let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) else {
            return;
        };
        let synced = match tokio::fs::File::open(dir).await {
            Ok(handle) => handle.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            tracing::debug!(dir = %dir.display(), error = %e, "directory sync skipped");
        }
    }

    /// Last successfully published snapshot; `None` if nothing published yet
    pub async fn load(&self) -> Result<Option<StatusSnapshot>, UplinkError> {
        load_snapshot(&self.path).await
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "status".into());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
    }
}

/// Create `path` with `body` and flush it to stable storage
async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}

/// Read a published snapshot
pub async fn load_snapshot(path: &Path) -> Result<Option<StatusSnapshot>, UplinkError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
