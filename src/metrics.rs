//! Prometheus metrics for the validator node.
//!
//! Exposed on the status HTTP server at /metrics.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Watcher progress
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "validator_blocks_processed_total",
        "Total number of source blocks processed",
        &["chain"]
    ).unwrap();

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "validator_watermark",
        "Highest finalized block durably processed",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_DETECTED: CounterVec = register_counter_vec!(
        "validator_lock_events_total",
        "Total number of lock events detected",
        &["chain"]
    ).unwrap();

    // Attestation flow
    pub static ref ATTESTATIONS_PRODUCED: CounterVec = register_counter_vec!(
        "validator_attestations_produced_total",
        "Attestations signed by this node",
        &["destination"]
    ).unwrap();

    pub static ref ATTESTATIONS_RECEIVED: CounterVec = register_counter_vec!(
        "validator_attestations_received_total",
        "Peer attestations received via gossip",
        &["result"]
    ).unwrap();

    // Relay flow
    pub static ref RELAYS_SUBMITTED: CounterVec = register_counter_vec!(
        "validator_relays_submitted_total",
        "Release transactions submitted",
        &["chain", "status"]
    ).unwrap();

    // Gossip
    pub static ref GOSSIP_MESSAGES: CounterVec = register_counter_vec!(
        "validator_gossip_messages_total",
        "Gossip messages by topic and direction",
        &["topic", "direction"]
    ).unwrap();

    pub static ref GOSSIP_PEERS: Gauge = register_gauge!(
        "validator_gossip_peers",
        "Connected overlay peers"
    ).unwrap();

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "validator_errors_total",
        "Errors by component and class",
        &["component", "class"]
    ).unwrap();

    // Queue sizes
    pub static ref OPEN_TRANSFERS: Gauge = register_gauge!(
        "validator_open_transfers",
        "Transfers in a non-terminal status"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "validator_up",
        "Whether the validator node is running (1 = up)"
    ).unwrap();
}
