//! Core packet and flow types
//!
//! Shared by the capture layer and the on-disk store:
//! - `packet`: endpoint key, L3/L4 parsing, direction classification
//! - `flow`: per-capture flow log with rotation handoff

pub mod flow;
pub mod packet;

pub use flow::{AggFlowMap, FlowEntry, FlowLog};
pub use packet::{
    classify_direction, DecodeError, Direction, EndpointKey, PacketType, ParsedPacket,
};
