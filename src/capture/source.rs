//! Packet capture sources
//!
//! A capture source wraps a kernel ring buffer for one interface and
//! hands out raw IP layers. The production implementation sits on top of
//! libpcap; `MockSource` feeds scripted packets for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::CaptureConfig;
use crate::core::packet::PacketType;

/// Bytes captured per packet. L3/L4 headers plus the ICMP type fit
/// comfortably; payload beyond that is never inspected.
pub const SNAPLEN: i32 = 128;

/// Maximum time the kernel poll blocks before control returns to the
/// reader. Lower values flood the kernel with syscalls, higher values
/// delay shutdown.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source was closed; expected during shutdown
    #[error("capture source closed")]
    Closed,

    /// The kernel poll expired without a packet; callers re-poll
    #[error("capture poll timeout")]
    Timeout,

    /// The underlying capture failed mid-stream
    #[error("capture error: {0}")]
    Transient(String),

    /// The source could not be created
    #[error("failed to initialize capture source: {0}")]
    Init(String),
}

/// Kernel-level packet counters of a capture source. Monotonically
/// non-decreasing until the source is reinitialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CaptureStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
}

/// A captured packet, borrowed from the caller-provided buffer
#[derive(Debug)]
pub struct RawPacket<'a> {
    /// The IP layer, stripped of any link-layer framing
    pub ip_layer: &'a [u8],
    /// Kernel direction hint, if the source can provide one
    pub pkt_type: PacketType,
    /// On-wire packet length including all headers
    pub total_len: u32,
}

/// Contract of a per-interface packet source.
///
/// `next_packet` blocks for at most one poll interval; it returns
/// `Timeout` when no packet arrived so the reader can release the source
/// between polls. Closing unblocks any waiter within one poll interval.
/// `close` is idempotent.
pub trait CaptureSource: Send {
    fn next_packet<'a>(&mut self, buf: &'a mut Vec<u8>) -> Result<RawPacket<'a>, SourceError>;

    fn stats(&mut self) -> Result<CaptureStats, SourceError>;

    fn close(&mut self);
}

/// Factory producing the capture source for an interface. Injectable so
/// tests can substitute mock sources for real ring buffers.
pub type SourceInitFn =
    Arc<dyn Fn(&str, &CaptureConfig) -> Result<Box<dyn CaptureSource>, SourceError> + Send + Sync>;

/// Source factory backed by libpcap
pub fn default_source_init() -> SourceInitFn {
    Arc::new(|iface: &str, config: &CaptureConfig| {
        Ok(Box::new(PcapSource::open(iface, config)?) as Box<dyn CaptureSource>)
    })
}

/// libpcap-backed capture source
pub struct PcapSource {
    cap: pcap::Capture<pcap::Active>,
    datalink: pcap::Linktype,
    closed: bool,
}

impl PcapSource {
    pub fn open(iface: &str, config: &CaptureConfig) -> Result<Self, SourceError> {
        let inactive = pcap::Capture::from_device(iface)
            .map_err(|e| SourceError::Init(e.to_string()))?
            .promisc(config.promisc)
            .snaplen(SNAPLEN)
            .buffer_size(config.buffer_size as i32)
            .timeout(POLL_TIMEOUT.as_millis() as i32);

        let cap = inactive
            .open()
            .map_err(|e| SourceError::Init(e.to_string()))?;
        let datalink = cap.get_datalink();

        Ok(Self {
            cap,
            datalink,
            closed: false,
        })
    }

    /// Offset of the IP layer within a captured frame
    fn link_offset(datalink: pcap::Linktype, frame: &[u8]) -> usize {
        match datalink {
            pcap::Linktype::ETHERNET => {
                if frame.len() >= 18 {
                    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
                    // single 802.1Q / 802.1ad tag
                    if ethertype == 0x8100 || ethertype == 0x88a8 {
                        return 18;
                    }
                }
                14
            }
            _ => 0,
        }
    }
}

impl CaptureSource for PcapSource {
    fn next_packet<'a>(&mut self, buf: &'a mut Vec<u8>) -> Result<RawPacket<'a>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        match self.cap.next_packet() {
            Ok(packet) => {
                let offset = Self::link_offset(self.datalink, packet.data).min(packet.data.len());
                let total_len = packet.header.len.saturating_sub(offset as u32);

                buf.clear();
                buf.extend_from_slice(&packet.data[offset..]);
                Ok(RawPacket {
                    ip_layer: &buf[..],
                    // libpcap provides no per-packet direction hint
                    pkt_type: PacketType::Unknown,
                    total_len,
                })
            }
            Err(pcap::Error::TimeoutExpired) => Err(SourceError::Timeout),
            Err(pcap::Error::NoMorePackets) => Err(SourceError::Closed),
            Err(e) => Err(SourceError::Transient(e.to_string())),
        }
    }

    fn stats(&mut self) -> Result<CaptureStats, SourceError> {
        let stats = self
            .cap
            .stats()
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        Ok(CaptureStats {
            packets_received: u64::from(stats.received),
            packets_dropped: u64::from(stats.dropped) + u64::from(stats.if_dropped),
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct MockShared {
    closed: AtomicBool,
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Scripted capture source for tests. Packets are raw IP layers pushed
/// through the paired handle.
pub struct MockSource {
    rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<MockShared>,
}

/// Test-side handle of a `MockSource`
#[derive(Clone)]
pub struct MockSourceHandle {
    tx: mpsc::SyncSender<Vec<u8>>,
    shared: Arc<MockShared>,
}

impl MockSource {
    pub fn new() -> (Self, MockSourceHandle) {
        let (tx, rx) = mpsc::sync_channel(1024);
        let shared = Arc::new(MockShared {
            closed: AtomicBool::new(false),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        (
            Self {
                rx,
                shared: Arc::clone(&shared),
            },
            MockSourceHandle { tx, shared },
        )
    }
}

impl CaptureSource for MockSource {
    fn next_packet<'a>(&mut self, buf: &'a mut Vec<u8>) -> Result<RawPacket<'a>, SourceError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SourceError::Closed);
        }

        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok(packet) => {
                self.shared.received.fetch_add(1, Ordering::Relaxed);
                let total_len = packet.len() as u32;
                *buf = packet;
                Ok(RawPacket {
                    ip_layer: &buf[..],
                    pkt_type: PacketType::Unknown,
                    total_len,
                })
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SourceError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SourceError::Closed),
        }
    }

    fn stats(&mut self) -> Result<CaptureStats, SourceError> {
        Ok(CaptureStats {
            packets_received: self.shared.received.load(Ordering::Relaxed),
            packets_dropped: self.shared.dropped.load(Ordering::Relaxed),
        })
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl MockSourceHandle {
    /// Feed one raw IP layer; returns false once the source is gone
    pub fn send(&self, ip_layer: Vec<u8>) -> bool {
        self.tx.send(ip_layer).is_ok()
    }

    /// Inject kernel-side drop counts
    pub fn add_dropped(&self, n: u64) {
        self.shared.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Close the source from the outside, unblocking any reader
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
