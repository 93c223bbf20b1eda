//! Writeout pipeline
//!
//! Drains tagged flow aggregates from the rotation channel, partitions
//! them into day buckets and writes one timed block per attribute
//! column. A failing interface is logged and skipped; the pipeline keeps
//! going for the rest of the fleet.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::capture::TaggedAggFlowMap;
use crate::core::flow::AggFlowMap;

use super::block_file::{BlockFile, BlockFileError};

/// Attribute columns of the flow database, one block file each. Rows are
/// aligned across the files by their position within a block.
pub const ATTRIBUTES: [&str; 8] = [
    "sip",
    "dip",
    "dport",
    "proto",
    "bytes_sent",
    "bytes_rcvd",
    "pkts_sent",
    "pkts_rcvd",
];

/// Width in bytes of one row cell per attribute, in `ATTRIBUTES` order
const ATTRIBUTE_WIDTHS: [usize; 8] = [16, 16, 2, 1, 8, 8, 8, 8];

#[derive(Debug, Error)]
pub enum WriteoutError {
    #[error(transparent)]
    BlockFile(#[from] BlockFileError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumes rotated aggregates and persists them. Cheap to clone; all
/// clones share the last-writeout marker exposed to the status API.
#[derive(Clone)]
pub struct WriteoutHandler {
    db_path: PathBuf,
    last_writeout: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl WriteoutHandler {
    pub fn new<P: Into<PathBuf>>(db_path: P) -> Self {
        Self {
            db_path: db_path.into(),
            last_writeout: Arc::new(Mutex::new(None)),
        }
    }

    /// Time of the last completed writeout, if any
    pub fn last_writeout(&self) -> Option<DateTime<Utc>> {
        *self.last_writeout.lock()
    }

    /// Run the pipeline until the rotation channel closes
    pub async fn run(self, mut rx: mpsc::Receiver<TaggedAggFlowMap>) {
        info!(db_path = %self.db_path.display(), "writeout pipeline running");

        while let Some(aggregate) = rx.recv().await {
            let iface = aggregate.iface.clone();
            let timestamp = aggregate.timestamp;
            let db_path = self.db_path.clone();

            let written =
                tokio::task::spawn_blocking(move || write_aggregate(&db_path, &aggregate)).await;

            match written {
                Ok(Ok(())) => {
                    *self.last_writeout.lock() = Some(timestamp);
                }
                Ok(Err(e)) => {
                    // one failing interface does not halt the fleet
                    error!(iface = %iface, "writeout failed: {e}");
                }
                Err(e) => {
                    error!(iface = %iface, "writeout task panicked: {e}");
                }
            }
        }

        info!("writeout pipeline drained");
    }
}

/// Write one aggregate into its day bucket, one timed block per
/// attribute. All blocks carry the rotation timestamp.
pub fn write_aggregate(
    db_path: &Path,
    aggregate: &TaggedAggFlowMap,
) -> Result<(), WriteoutError> {
    if aggregate.flows.is_empty() {
        debug!(iface = %aggregate.iface, "no flows to write");
        return Ok(());
    }

    let day_dir = db_path
        .join(&aggregate.iface)
        .join(aggregate.timestamp.format("%Y%m%d").to_string());
    std::fs::create_dir_all(&day_dir)?;

    let columns = serialize_columns(&aggregate.flows);
    let block_ts = aggregate.timestamp.timestamp();

    for (name, payload) in ATTRIBUTES.iter().zip(columns.iter()) {
        let mut file = BlockFile::open(day_dir.join(format!("{name}.gpf")))?;
        file.write_timed_block(block_ts, payload)?;
    }

    debug!(
        iface = %aggregate.iface,
        flows = aggregate.flows.len(),
        day = %day_dir.display(),
        "wrote aggregate"
    );
    Ok(())
}

/// Serialize an aggregate into one fixed-width big-endian payload per
/// attribute. A single pass keeps row positions aligned across columns.
fn serialize_columns(flows: &AggFlowMap) -> [Vec<u8>; 8] {
    let rows = flows.len();
    let mut columns: [Vec<u8>; 8] = Default::default();
    for (column, width) in columns.iter_mut().zip(ATTRIBUTE_WIDTHS) {
        column.reserve_exact(rows * width);
    }

    for (key, entry) in flows {
        let raw = key.as_bytes();
        columns[0].extend_from_slice(&raw[0..16]); // sip
        columns[1].extend_from_slice(&raw[16..32]); // dip
        columns[2].extend_from_slice(&raw[32..34]); // dport
        columns[3].push(raw[36]); // proto
        columns[4].extend_from_slice(&entry.bytes_sent.to_be_bytes());
        columns[5].extend_from_slice(&entry.bytes_rcvd.to_be_bytes());
        columns[6].extend_from_slice(&entry.packets_sent.to_be_bytes());
        columns[7].extend_from_slice(&entry.packets_rcvd.to_be_bytes());
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::InterfaceStats;
    use crate::core::flow::{FlowLog, FlowEntry};
    use crate::core::packet::testutil::build_ip_layer;
    use crate::core::packet::{PacketType, TCP};
    use chrono::TimeZone;

    fn sample_aggregate(iface: &str, ts: DateTime<Utc>) -> TaggedAggFlowMap {
        let mut log = FlowLog::new();
        log.add(
            &build_ip_layer("10.0.0.1", "4.5.6.7", 49152, 443, TCP, 0),
            PacketType::Outbound,
            64,
        )
        .unwrap();
        log.add(
            &build_ip_layer("4.5.6.7", "10.0.0.1", 443, 49152, TCP, 0),
            PacketType::Inbound,
            1400,
        )
        .unwrap();

        TaggedAggFlowMap {
            iface: iface.to_string(),
            timestamp: ts,
            flows: log.rotate(),
            stats: InterfaceStats::default(),
        }
    }

    #[test]
    fn test_write_aggregate_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 11, 7, 14, 30, 0).unwrap();

        let aggregate = sample_aggregate("eth0", ts);
        write_aggregate(dir.path(), &aggregate).unwrap();

        let day_dir = dir.path().join("eth0").join("20231107");
        for name in ATTRIBUTES {
            assert!(day_dir.join(format!("{name}.gpf")).exists(), "{name}");
        }

        // all blocks carry the rotation timestamp and align row-wise
        let mut dport = BlockFile::open(day_dir.join("dport.gpf")).unwrap();
        let payload = dport.read_timed_block(ts.timestamp()).unwrap();
        assert_eq!(payload, 443u16.to_be_bytes());

        let mut bytes_rcvd = BlockFile::open(day_dir.join("bytes_rcvd.gpf")).unwrap();
        let payload = bytes_rcvd.read_timed_block(ts.timestamp()).unwrap();
        assert_eq!(payload, 1400u64.to_be_bytes());

        let mut proto = BlockFile::open(day_dir.join("proto.gpf")).unwrap();
        assert_eq!(proto.read_timed_block(ts.timestamp()).unwrap(), [TCP]);
    }

    #[test]
    fn test_consecutive_rotations_append_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let first = Utc.with_ymd_and_hms(2023, 11, 7, 10, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2023, 11, 7, 10, 5, 0).unwrap();

        write_aggregate(dir.path(), &sample_aggregate("eth0", first)).unwrap();
        write_aggregate(dir.path(), &sample_aggregate("eth0", second)).unwrap();

        let day_dir = dir.path().join("eth0").join("20231107");
        let mut sip = BlockFile::open(day_dir.join("sip.gpf")).unwrap();
        assert_eq!(sip.blocks_used(), 2);
        assert_eq!(
            sip.block_timestamps(),
            [first.timestamp(), second.timestamp()]
        );
    }

    #[test]
    fn test_empty_aggregate_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let aggregate = TaggedAggFlowMap {
            iface: "eth0".to_string(),
            timestamp: Utc::now(),
            flows: AggFlowMap::new(),
            stats: InterfaceStats::default(),
        };

        write_aggregate(dir.path(), &aggregate).unwrap();
        assert!(!dir.path().join("eth0").exists());
    }

    #[test]
    fn test_column_rows_align() {
        let mut flows = AggFlowMap::new();
        for i in 1..=3u8 {
            let (key, _) = crate::core::packet::testutil::build_key(
                &format!("10.0.0.{i}"),
                "4.5.6.7",
                40000 + u16::from(i),
                443,
                TCP,
            );
            flows.insert(
                key,
                FlowEntry {
                    packets_sent: u64::from(i),
                    bytes_sent: u64::from(i) * 100,
                    packets_rcvd: 0,
                    bytes_rcvd: 0,
                    direction_confidence_high: true,
                    is_ipv4: true,
                },
            );
        }

        let columns = serialize_columns(&flows);
        assert_eq!(columns[0].len(), 3 * 16);
        assert_eq!(columns[2].len(), 3 * 2);
        assert_eq!(columns[3].len(), 3);
        assert_eq!(columns[6].len(), 3 * 8);

        // row i of sip and pkts_sent must describe the same flow
        for row in 0..3 {
            let sip_last_octet = columns[0][row * 16 + 15];
            let mut pkts = [0u8; 8];
            pkts.copy_from_slice(&columns[6][row * 8..row * 8 + 8]);
            assert_eq!(u64::from(sip_last_octet), u64::from_be_bytes(pkts));
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_until_channel_closes() {
        let dir = tempfile::tempdir().unwrap();
        let handler = WriteoutHandler::new(dir.path());
        assert!(handler.last_writeout().is_none());

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(handler.clone().run(rx));

        let ts = Utc.with_ymd_and_hms(2023, 11, 7, 9, 0, 0).unwrap();
        tx.send(sample_aggregate("eth0", ts)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(handler.last_writeout(), Some(ts));
        assert!(dir
            .path()
            .join("eth0")
            .join("20231107")
            .join("sip.gpf")
            .exists());
    }

    #[test]
    fn test_failing_day_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 11, 7, 9, 0, 0).unwrap();
        let aggregate = sample_aggregate("eth0", ts);

        // occupy the day directory path with a file
        std::fs::create_dir_all(dir.path().join("eth0")).unwrap();
        std::fs::write(dir.path().join("eth0").join("20231107"), b"x").unwrap();

        assert!(matches!(
            write_aggregate(dir.path(), &aggregate),
            Err(WriteoutError::Io(_))
        ));
    }
}
