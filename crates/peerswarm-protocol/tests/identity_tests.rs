//! Tests for identity keys and the XOR metric.
//!
//! Verifies:
//! - Key parsing, formatting and serde representation
//! - Byte order of keys matches hex-string order
//! - XOR distance properties and distance sorting
//! - Discovery key derivation

use std::collections::HashSet;

use peerswarm_protocol::*;

fn peer(first: u8, last: u8) -> PeerId {
    let mut bytes = [0u8; KEY_LENGTH];
    bytes[0] = first;
    bytes[KEY_LENGTH - 1] = last;
    PeerId::from_bytes(bytes)
}

// ═══════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════

#[test]
fn key_display_is_lowercase_hex() {
    let id = peer(0xab, 0x01);
    let s = id.to_string();
    assert_eq!(s.len(), KEY_LENGTH * 2);
    assert!(s.starts_with("ab"));
    assert!(s.ends_with("01"));
    assert_eq!(s, s.to_lowercase());
}

#[test]
fn key_debug_is_short() {
    let id = peer(0xab, 0x01);
    assert_eq!(format!("{:?}", id), "PeerId(ab000000)");
}

#[test]
fn key_rejects_wrong_length() {
    assert!(matches!(
        PeerId::from_slice(&[1, 2, 3]),
        Err(ProtocolError::InvalidKeyLength(3))
    ));
    assert!(matches!(Topic::from_hex("abcd"), Err(ProtocolError::InvalidKeyLength(2))));
}

#[test]
fn key_rejects_non_hex() {
    let bad = "zz".repeat(KEY_LENGTH);
    assert!(matches!(SessionId::from_hex(&bad), Err(ProtocolError::InvalidKey(_))));
}

#[test]
fn key_serializes_as_hex_string() {
    let topic = Topic::random();
    let json = serde_json::to_value(topic).unwrap();
    assert_eq!(json, serde_json::Value::String(topic.to_hex()));

    let back: Topic = serde_json::from_value(json).unwrap();
    assert_eq!(back, topic);
}

#[test]
fn random_keys_are_distinct() {
    let ids: HashSet<PeerId> = (0..64).map(|_| PeerId::random()).collect();
    assert_eq!(ids.len(), 64);
}

#[test]
fn key_order_matches_hex_order() {
    let mut ids: Vec<PeerId> = (0..32).map(|_| PeerId::random()).collect();
    let mut by_hex = ids.clone();
    ids.sort();
    by_hex.sort_by_key(|id| id.to_hex());
    assert_eq!(ids, by_hex, "Tie-breaks must agree with hex comparison");
}

// ═══════════════════════════════════════════════════════════════
// XOR distance
// ═══════════════════════════════════════════════════════════════

#[test]
fn distance_is_symmetric() {
    let a = PeerId::random();
    let b = PeerId::random();
    assert_eq!(a.distance(&b), b.distance(&a));
}

#[test]
fn distance_orders_by_most_significant_byte() {
    let origin = peer(0, 0);
    let near = peer(0x01, 0xff);
    let far = peer(0x80, 0x00);
    assert!(origin.distance(&near) < origin.distance(&far));
}

#[test]
fn sort_by_distance_is_ascending() {
    let origin = peer(0x10, 0);
    let mut peers = vec![peer(0x90, 0), peer(0x11, 0), peer(0x30, 0), peer(0x10, 5)];
    sort_by_distance(&mut peers, &origin);
    assert_eq!(peers, vec![peer(0x10, 5), peer(0x11, 0), peer(0x30, 0), peer(0x90, 0)]);
}

// ═══════════════════════════════════════════════════════════════
// Discovery key
// ═══════════════════════════════════════════════════════════════

#[test]
fn discovery_key_is_deterministic() {
    let topic = Topic::from_bytes([7u8; KEY_LENGTH]);
    assert_eq!(topic.discovery_key(), topic.discovery_key());
}

#[test]
fn discovery_key_hides_topic() {
    let topic = Topic::random();
    assert_ne!(&topic.discovery_key(), topic.as_bytes());
    assert_ne!(topic.discovery_key(), Topic::random().discovery_key());
}
