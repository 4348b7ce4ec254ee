//! Peer devices: identity validation, ranking and import/removal

use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::BrowseError;
use crate::model::{DeviceStats, DeviceStatus};
use crate::refresh::RefreshCoordinator;
use crate::source::{IndexClient, PeerConfig};

const GROUPS: usize = 8;
const GROUP_LEN: usize = 7;

fn status_rank(status: DeviceStatus) -> u8 {
    match status {
        DeviceStatus::OnlineActive => 1,
        DeviceStatus::OnlineInactive => 2,
        DeviceStatus::Offline => 3,
    }
}

/// Status rank first, then name (case-sensitive), then device id so the
/// order is total even for peers sharing a name.
pub fn compare(a: &DeviceStats, b: &DeviceStats) -> Ordering {
    status_rank(a.status)
        .cmp(&status_rank(b.status))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.device_id.cmp(&b.device_id))
}

pub fn sort_devices(devices: &mut [DeviceStats]) {
    devices.sort_by(compare);
}

/// A device identifier: 56 base32 characters in 8 dash-separated groups of 7.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let groups: Vec<&str> = normalized.split('-').collect();
        if groups.len() != GROUPS {
            bail!(
                "device id must have {} groups separated by '-', got {}",
                GROUPS,
                groups.len()
            );
        }
        for group in &groups {
            if group.len() != GROUP_LEN {
                bail!("device id group '{}' must be {} characters", group, GROUP_LEN);
            }
            if let Some(c) = group.chars().find(|c| !matches!(c, 'A'..='Z' | '2'..='7')) {
                bail!("device id contains invalid character '{}'", c);
            }
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First group, enough to tell peers apart in listings.
    pub fn short(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device list snapshots plus the add/remove peer workflow.
pub struct PeerRegistry<C, P> {
    client: Arc<C>,
    peers: Arc<P>,
    refresh: RefreshCoordinator<C>,
}

impl<C: IndexClient, P: PeerConfig> PeerRegistry<C, P> {
    pub fn new(client: Arc<C>, peers: Arc<P>, refresh: RefreshCoordinator<C>) -> Self {
        Self {
            client,
            peers,
            refresh,
        }
    }

    /// Current devices ordered for presentation.
    pub async fn device_list(&self) -> Result<Vec<DeviceStats>> {
        let mut devices = self.client.devices().await.context("listing devices")?;
        sort_devices(&mut devices);
        Ok(devices)
    }

    /// Record a new peer, persist the configuration and start an index
    /// update so the peer's folders show up. Returns false when the peer was
    /// already known.
    pub async fn import_device(&self, raw_id: &str, name: Option<&str>) -> Result<bool> {
        let device_id = DeviceId::parse(raw_id)?;
        if !self.peers.add_peer(&device_id, name) {
            info!(device = device_id.short(), "device already known");
            return Ok(false);
        }
        self.peers
            .persist()
            .await
            .context("saving peer configuration")?;
        info!(device = device_id.short(), "device added");

        match self.refresh.trigger() {
            Ok(()) => {}
            Err(BrowseError::AlreadyInProgress) => {
                info!("index update already running, new device picked up next time")
            }
            Err(err) => warn!(error = %err, "could not start index update"),
        }
        Ok(true)
    }

    /// Forget a peer. Returns false when it was not known.
    pub async fn remove_device(&self, raw_id: &str) -> Result<bool> {
        let device_id = DeviceId::parse(raw_id)?;
        if !self.peers.remove_peer(&device_id) {
            return Ok(false);
        }
        self.peers
            .persist()
            .await
            .context("saving peer configuration")?;
        info!(device = device_id.short(), "device removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;
    use crate::refresh::RefreshEvent;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const VALID: &str = "MFZWI3D-BONSGYC-YLTMRWG-C43ENR5-QXGZDMM-FZWI3DP-BONSGYY-LTMRWAD";

    #[derive(Default)]
    struct FakePeers {
        peers: Mutex<BTreeMap<String, Option<String>>>,
        persisted: AtomicUsize,
    }

    impl PeerConfig for FakePeers {
        fn add_peer(&self, device_id: &DeviceId, name: Option<&str>) -> bool {
            let mut peers = self.peers.lock().unwrap();
            if peers.contains_key(device_id.as_str()) {
                return false;
            }
            peers.insert(device_id.to_string(), name.map(str::to_string));
            true
        }

        fn remove_peer(&self, device_id: &DeviceId) -> bool {
            self.peers.lock().unwrap().remove(device_id.as_str()).is_some()
        }

        async fn persist(&self) -> Result<()> {
            self.persisted.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    fn device(id: &str, status: DeviceStatus, name: &str) -> DeviceStats {
        DeviceStats::new(id, name, status)
    }

    #[test]
    fn test_ranking_status_then_name() {
        let mut devices = vec![
            device("1", DeviceStatus::Offline, "Zeta"),
            device("2", DeviceStatus::OnlineActive, "Beta"),
            device("3", DeviceStatus::OnlineInactive, "Alpha"),
        ];
        sort_devices(&mut devices);
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Alpha", "Zeta"]);
    }

    #[test]
    fn test_ranking_ties_by_name_case_sensitive() {
        let mut devices = vec![
            device("1", DeviceStatus::OnlineInactive, "b"),
            device("2", DeviceStatus::OnlineInactive, "C"),
            device("3", DeviceStatus::OnlineInactive, "A"),
        ];
        sort_devices(&mut devices);
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C", "b"]);
    }

    #[test]
    fn test_ranking_is_total_for_equal_names() {
        let a = device("AAA", DeviceStatus::Offline, "same");
        let b = device("BBB", DeviceStatus::Offline, "same");
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
        assert_eq!(compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_device_id_validation() {
        let id = DeviceId::parse(&VALID.to_lowercase()).unwrap();
        assert_eq!(id.as_str(), VALID);
        assert_eq!(id.short(), "MFZWI3D");
        assert_eq!(VALID.parse::<DeviceId>().unwrap(), id);

        assert!(DeviceId::parse("MFZWI3D-BONSGYC").is_err());
        assert!(DeviceId::parse(&VALID.replace('3', "1")).is_err());
        assert!(DeviceId::parse(&VALID.replacen("MFZWI3D", "MFZWI3", 1)).is_err());
    }

    #[tokio::test]
    async fn test_import_persists_and_triggers_refresh() {
        let index = Arc::new(MemoryIndex::new());
        let peers = Arc::new(FakePeers::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let refresh = RefreshCoordinator::new(Arc::clone(&index), tx);
        let registry = PeerRegistry::new(Arc::clone(&index), Arc::clone(&peers), refresh);

        assert!(registry.import_device(VALID, Some("nas")).await.unwrap());
        assert_eq!(peers.persisted.load(AtomicOrdering::SeqCst), 1);
        loop {
            if let Some(RefreshEvent::Completed(done)) = rx.recv().await {
                assert_eq!(done.result, Ok(()));
                break;
            }
        }

        // Known peers are not re-added or re-persisted
        assert!(!registry.import_device(VALID, None).await.unwrap());
        assert_eq!(peers.persisted.load(AtomicOrdering::SeqCst), 1);

        assert!(registry.remove_device(VALID).await.unwrap());
        assert!(!registry.remove_device(VALID).await.unwrap());
        assert!(registry.import_device("not-a-device", None).await.is_err());
    }

    #[tokio::test]
    async fn test_device_list_is_ranked() {
        let index = Arc::new(MemoryIndex::demo());
        let (tx, _rx) = mpsc::unbounded_channel();
        let refresh = RefreshCoordinator::new(Arc::clone(&index), tx);
        let registry = PeerRegistry::new(index, Arc::new(FakePeers::default()), refresh);

        let devices = registry.device_list().await.unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["laptop", "nas", "old-phone"]);
    }
}
