//! In-memory flow accounting
//!
//! Maps canonical endpoint keys to bidirectional packet/byte counters.
//! A flow log belongs to exactly one capture; `add` and `rotate` are
//! serialized by the capture's lock and never run concurrently.

use std::collections::HashMap;

use super::packet::{
    classify_direction, DecodeError, Direction, EndpointKey, PacketType, ParsedPacket,
};

/// Bidirectional counters for a single flow. Forward (sent) is the
/// canonical src -> dst direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowEntry {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_rcvd: u64,
    pub bytes_rcvd: u64,

    /// Set once the classifier has made a definitive server-side call.
    /// Monotonic: never reverts to false.
    pub direction_confidence_high: bool,
    pub is_ipv4: bool,
}

impl FlowEntry {
    /// Same orientation and confidence, counters reset. Used for flows
    /// retained across a rotation.
    fn carried_over(&self) -> Self {
        Self {
            packets_sent: 0,
            bytes_sent: 0,
            packets_rcvd: 0,
            bytes_rcvd: 0,
            direction_confidence_high: self.direction_confidence_high,
            is_ipv4: self.is_ipv4,
        }
    }
}

/// Finalized snapshot handed to the writeout pipeline on rotation
pub type AggFlowMap = HashMap<EndpointKey, FlowEntry>;

/// Live flow table of a single capture
#[derive(Debug, Default)]
pub struct FlowLog {
    flow_map: HashMap<EndpointKey, FlowEntry>,
}

impl FlowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live flows
    pub fn len(&self) -> usize {
        self.flow_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flow_map.is_empty()
    }

    /// Read-only view of the live flows
    pub fn flows(&self) -> &HashMap<EndpointKey, FlowEntry> {
        &self.flow_map
    }

    /// Classify a raw IP layer and account it to its flow.
    ///
    /// The lookup tries both orientations of the as-seen tuple before
    /// creating a new entry, so replies always land on the entry created
    /// by the request, including the equal-port case the direction rules
    /// cannot resolve.
    pub fn add(
        &mut self,
        ip_layer: &[u8],
        pkt_type: PacketType,
        total_len: u32,
    ) -> Result<(), DecodeError> {
        let pkt = ParsedPacket::parse(ip_layer, pkt_type, total_len)?;
        let bytes = u64::from(total_len);

        if let Some(entry) = self.flow_map.get_mut(&pkt.key) {
            // observed tuple matches the stored orientation
            entry.packets_sent += 1;
            entry.bytes_sent += bytes;
            if !entry.direction_confidence_high && classify_direction(&pkt).1 {
                entry.direction_confidence_high = true;
            }
            return Ok(());
        }

        let reverse = pkt.key.reverse();
        if let Some(entry) = self.flow_map.get_mut(&reverse) {
            entry.packets_rcvd += 1;
            entry.bytes_rcvd += bytes;
            if !entry.direction_confidence_high && classify_direction(&pkt).1 {
                entry.direction_confidence_high = true;
            }
            return Ok(());
        }

        let (direction, confident) = classify_direction(&pkt);
        let key = match direction {
            Direction::Remains => pkt.key,
            Direction::Reverts => reverse,
        };
        // the first packet of a flow is attributed to the forward direction
        self.flow_map.insert(
            key,
            FlowEntry {
                packets_sent: 1,
                bytes_sent: bytes,
                packets_rcvd: 0,
                bytes_rcvd: 0,
                direction_confidence_high: confident,
                is_ipv4: pkt.is_ipv4,
            },
        );
        Ok(())
    }

    /// Transfer and aggregate: confidently classified flows move into the
    /// returned snapshot; the rest stay in the live map with their
    /// counters reset so a later packet can still settle their
    /// orientation.
    pub fn rotate(&mut self) -> AggFlowMap {
        let drained = std::mem::take(&mut self.flow_map);

        let mut agg = AggFlowMap::with_capacity(drained.len());
        for (key, entry) in drained {
            if entry.direction_confidence_high {
                agg.insert(key, entry);
            } else {
                self.flow_map.insert(key, entry.carried_over());
            }
        }
        agg
    }
}
