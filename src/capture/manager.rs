//! Capture fleet management
//!
//! The manager owns one capture per configured interface, applies
//! configuration diffs and fans out status and rotation requests in
//! parallel. Rotation results are tagged with their interface and
//! timestamp and handed to the writeout pipeline over a bounded channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::core::flow::AggFlowMap;

use super::source::{default_source_init, SourceInitFn};
use super::worker::{Capture, CaptureStatus};
use super::InterfaceStats;

/// A rotated flow snapshot tagged with its origin
#[derive(Debug)]
pub struct TaggedAggFlowMap {
    pub iface: String,
    /// Rotation time; becomes the block timestamp of every attribute
    pub timestamp: DateTime<Utc>,
    pub flows: AggFlowMap,
    pub stats: InterfaceStats,
}

/// Fleet of captures, one per interface
pub struct CaptureManager {
    captures: HashMap<String, Capture>,
    source_init: SourceInitFn,
    started_at: DateTime<Utc>,
}

impl CaptureManager {
    pub fn new() -> Self {
        Self::with_source_init(default_source_init())
    }

    /// Create a manager with an injectable source factory (used by tests
    /// to substitute mock sources)
    pub fn with_source_init(source_init: SourceInitFn) -> Self {
        Self {
            captures: HashMap::new(),
            source_init,
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Interfaces currently under capture
    pub fn ifaces(&self) -> Vec<String> {
        self.captures.keys().cloned().collect()
    }

    /// Diff the running fleet against `configs`: start captures for new
    /// interfaces, update changed ones and close removed ones. Returns
    /// once every affected capture has acknowledged its command.
    pub async fn update(&mut self, configs: &HashMap<String, CaptureConfig>) {
        for (iface, config) in configs {
            match self.captures.get(iface) {
                None => {
                    info!(iface = %iface, "starting capture");
                    self.captures.insert(
                        iface.clone(),
                        Capture::spawn(iface, config.clone(), self.source_init.clone()),
                    );
                }
                Some(capture) => {
                    capture.handle().update(config.clone()).await;
                }
            }
        }

        let removed: Vec<String> = self
            .captures
            .keys()
            .filter(|iface| !configs.contains_key(*iface))
            .cloned()
            .collect();
        for iface in removed {
            if let Some(capture) = self.captures.remove(&iface) {
                info!(iface = %iface, "closing capture");
                capture.close().await;
            }
        }
    }

    /// Fetch the status of the given interfaces (all when empty), in
    /// parallel
    pub async fn status(&self, ifaces: &[String]) -> HashMap<String, CaptureStatus> {
        let mut set = JoinSet::new();
        for capture in self.selected(ifaces) {
            let handle = capture.handle().clone();
            set.spawn(async move {
                let status = handle.status().await;
                (handle.iface().to_string(), status)
            });
        }

        let mut result = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((iface, Some(status))) = joined {
                result.insert(iface, status);
            }
        }
        result
    }

    /// Rotate the given interfaces (all when empty) in parallel, sending
    /// each tagged snapshot to `writeout_tx`. A slow writeout consumer
    /// backpressures rotation. Rotation is not atomic across interfaces;
    /// each interface's rotation is serialized with its own packet
    /// stream.
    pub async fn rotate(
        &self,
        writeout_tx: &mpsc::Sender<TaggedAggFlowMap>,
        ifaces: &[String],
    ) {
        let mut set = JoinSet::new();
        for capture in self.selected(ifaces) {
            let handle = capture.handle().clone();
            let writeout_tx = writeout_tx.clone();
            set.spawn(async move {
                let Some(result) = handle.rotate().await else {
                    return;
                };
                debug!(iface = %handle.iface(), flows = result.flows.len(), "rotated flow log");

                let tagged = TaggedAggFlowMap {
                    iface: handle.iface().to_string(),
                    timestamp: Utc::now(),
                    flows: result.flows,
                    stats: result.stats,
                };
                let _ = writeout_tx.send(tagged).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Close all captures and drain the fleet
    pub async fn close(&mut self) {
        let mut set = JoinSet::new();
        for (_, capture) in self.captures.drain() {
            set.spawn(capture.close());
        }
        while set.join_next().await.is_some() {}
        info!("all captures closed");
    }

    fn selected<'a>(&'a self, ifaces: &'a [String]) -> impl Iterator<Item = &'a Capture> + 'a {
        self.captures
            .iter()
            .filter(move |(iface, _)| ifaces.is_empty() || ifaces.contains(*iface))
            .map(|(_, capture)| capture)
    }
}

impl Default for CaptureManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::{CaptureSource, MockSource, MockSourceHandle, SourceError};
    use crate::capture::State;
    use crate::core::packet::testutil::build_ip_layer;
    use crate::core::packet::TCP;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Source factory handing out one mock source per interface
    fn fleet_init(ifaces: &[&str]) -> (SourceInitFn, HashMap<String, MockSourceHandle>) {
        let mut sources = HashMap::new();
        let mut handles = HashMap::new();
        for iface in ifaces {
            let (source, handle) = MockSource::new();
            sources.insert(iface.to_string(), source);
            handles.insert(iface.to_string(), handle);
        }

        let sources = Mutex::new(sources);
        let init: SourceInitFn = Arc::new(move |iface: &str, _: &CaptureConfig| {
            sources
                .lock()
                .unwrap()
                .remove(iface)
                .map(|s| Box::new(s) as Box<dyn CaptureSource>)
                .ok_or_else(|| SourceError::Init(format!("no mock source for {iface}")))
        });
        (init, handles)
    }

    fn configs(ifaces: &[&str]) -> HashMap<String, CaptureConfig> {
        ifaces
            .iter()
            .map(|iface| (iface.to_string(), CaptureConfig::default()))
            .collect()
    }

    async fn wait_for_fleet_processed(manager: &CaptureManager, n: u64) {
        for _ in 0..500 {
            let statuses = manager.status(&[]).await;
            let total: u64 = statuses.values().map(|s| s.stats.processed_total).sum();
            if total >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fleet never processed {n} packets");
    }

    #[tokio::test]
    async fn test_update_starts_and_removes_captures() {
        let (init, _handles) = fleet_init(&["mock0", "mock1"]);
        let mut manager = CaptureManager::with_source_init(init);

        manager.update(&configs(&["mock0", "mock1"])).await;
        assert_eq!(manager.ifaces().len(), 2);

        manager.update(&configs(&["mock0"])).await;
        assert_eq!(manager.ifaces(), vec!["mock0".to_string()]);

        manager.close().await;
        assert!(manager.ifaces().is_empty());
    }

    #[tokio::test]
    async fn test_status_fan_out() {
        let (init, handles) = fleet_init(&["mock0", "mock1"]);
        let mut manager = CaptureManager::with_source_init(init);
        manager.update(&configs(&["mock0", "mock1"])).await;

        handles["mock0"].send(build_ip_layer("10.0.0.1", "4.5.6.7", 49152, 443, TCP, 0));
        wait_for_fleet_processed(&manager, 1).await;

        let statuses = manager.status(&[]).await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["mock0"].state, State::Capturing);
        assert_eq!(statuses["mock0"].stats.processed_total, 1);
        assert_eq!(statuses["mock1"].stats.processed_total, 0);

        let single = manager.status(&["mock1".to_string()]).await;
        assert_eq!(single.len(), 1);
        assert!(single.contains_key("mock1"));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_capture_to_disk_roundtrip() {
        use crate::db::{BlockFile, WriteoutHandler};

        let (init, handles) = fleet_init(&["mock0"]);
        let mut manager = CaptureManager::with_source_init(init);
        manager.update(&configs(&["mock0"])).await;

        handles["mock0"].send(build_ip_layer("10.0.0.1", "4.5.6.7", 49152, 443, TCP, 0));
        handles["mock0"].send(build_ip_layer("4.5.6.7", "10.0.0.1", 443, 49152, TCP, 0));
        wait_for_fleet_processed(&manager, 2).await;

        let dir = tempfile::tempdir().unwrap();
        let writeout = WriteoutHandler::new(dir.path());
        let (tx, rx) = mpsc::channel(1);
        let writeout_task = tokio::spawn(writeout.clone().run(rx));

        manager.rotate(&tx, &[]).await;
        manager.close().await;
        drop(tx);
        writeout_task.await.unwrap();

        let ts = writeout.last_writeout().unwrap();
        let day_dir = dir
            .path()
            .join("mock0")
            .join(ts.format("%Y%m%d").to_string());

        let mut dport = BlockFile::open(day_dir.join("dport.gpf")).unwrap();
        assert_eq!(
            dport.read_timed_block(ts.timestamp()).unwrap(),
            443u16.to_be_bytes()
        );
        let mut pkts_sent = BlockFile::open(day_dir.join("pkts_sent.gpf")).unwrap();
        assert_eq!(
            pkts_sent.read_timed_block(ts.timestamp()).unwrap(),
            1u64.to_be_bytes()
        );
        let mut pkts_rcvd = BlockFile::open(day_dir.join("pkts_rcvd.gpf")).unwrap();
        assert_eq!(
            pkts_rcvd.read_timed_block(ts.timestamp()).unwrap(),
            1u64.to_be_bytes()
        );
    }

    #[tokio::test]
    async fn test_rotate_sends_tagged_aggregates() {
        let (init, handles) = fleet_init(&["mock0"]);
        let mut manager = CaptureManager::with_source_init(init);
        manager.update(&configs(&["mock0"])).await;

        handles["mock0"].send(build_ip_layer("10.0.0.1", "4.5.6.7", 49152, 443, TCP, 0));
        wait_for_fleet_processed(&manager, 1).await;

        let (tx, mut rx) = mpsc::channel(1);
        manager.rotate(&tx, &[]).await;

        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.iface, "mock0");
        assert_eq!(tagged.flows.len(), 1);
        assert_eq!(tagged.stats.processed, 1);

        manager.close().await;
    }
}
