//! Process-wide identifier generators.
//!
//! One `NodeState` lives for the life of the node: the Origin-State-Id,
//! the end-to-end identifier counter, and the session-id sequencer all
//! come from here. Everything is lock-free.

use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier state shared by every connection of a node.
#[derive(Debug)]
pub struct NodeState {
    state_id: u32,
    end_to_end: AtomicU32,
    session_sequencer: AtomicU64,
}

impl NodeState {
    pub fn new() -> Self {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        // RFC 3588 section 3: high 12 bits from the clock, low 20 bits
        // random, so identifiers stay unique across restarts.
        let seed: u32 = ((now_secs as u32) & 0xFFF) << 20 | rand::thread_rng().gen_range(0..1 << 20);
        Self {
            state_id: now_secs as u32,
            end_to_end: AtomicU32::new(seed),
            session_sequencer: AtomicU64::new(0),
        }
    }

    /// The node's Origin-State-Id: boot time in seconds since the epoch.
    pub fn state_id(&self) -> u32 {
        self.state_id
    }

    /// Next end-to-end identifier, wrapping at 2^32.
    pub fn next_end_to_end_identifier(&self) -> u32 {
        self.end_to_end.fetch_add(1, Ordering::Relaxed)
    }

    /// The `<high>;<low>` part of a Session-Id. A single 64-bit counter
    /// split into two 32-bit halves: monotonic for the process lifetime,
    /// never repeating even when the low half rolls over.
    pub fn next_session_id_second_part(&self) -> String {
        let v = self.session_sequencer.fetch_add(1, Ordering::Relaxed);
        format!("{};{}", (v >> 32) as u32, v as u32)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn end_to_end_increments_and_wraps() {
        let state = NodeState::new();
        state.end_to_end.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(state.next_end_to_end_identifier(), u32::MAX);
        assert_eq!(state.next_end_to_end_identifier(), 0);
        assert_eq!(state.next_end_to_end_identifier(), 1);
    }

    #[test]
    fn session_part_survives_low_half_rollover() {
        let state = NodeState::new();
        state.session_sequencer.store(u64::from(u32::MAX), Ordering::Relaxed);
        assert_eq!(state.next_session_id_second_part(), format!("0;{}", u32::MAX));
        assert_eq!(state.next_session_id_second_part(), "1;0");
        assert_eq!(state.next_session_id_second_part(), "1;1");
    }

    #[test]
    fn session_parts_are_distinct() {
        let state = NodeState::new();
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(state.next_session_id_second_part()));
        }
    }

    #[test]
    fn state_id_is_boot_seconds() {
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        let state = NodeState::new();
        let after = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32;
        assert!(state.state_id() >= before && state.state_id() <= after);
    }
}
