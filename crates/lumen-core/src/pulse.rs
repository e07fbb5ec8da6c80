// Pulse arithmetic - the global timestep every consensus round and
// conveyor rotation is bound to.
//
// SAFETY INVARIANTS:
// 1. Pulse numbers are monotonically increasing across commits
// 2. Once the network commits pulse P, work labeled with pulse < P is
//    routed to the antique slot, never to the present slot
// 3. Sentinels (genesis, antique) never appear as committed pulses

use serde::{Deserialize, Serialize};

/// Monotonically increasing 32-bit pulse counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PulseNumber(pub u32);

impl PulseNumber {
    /// Matches any pulse older than the present slot.
    pub const ANTIQUE: PulseNumber = PulseNumber(0);

    /// The first pulse of a fresh network.
    pub const GENESIS: PulseNumber = PulseNumber(1);

    pub fn next(self, delta: u32) -> PulseNumber {
        PulseNumber(self.0.saturating_add(delta))
    }

    pub fn prev(self, delta: u32) -> PulseNumber {
        PulseNumber(self.0.saturating_sub(delta))
    }

    pub fn is_sentinel(self) -> bool {
        self == Self::ANTIQUE || self == Self::GENESIS
    }

    /// Big-endian encoding, used inside record IDs and storage keys so
    /// that byte-wise key order matches pulse order.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for PulseNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single signature over a pulse, as issued by a pulsar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseSign {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The pulse event delivered by a pulsar to every node.
///
/// The transport that carries it is not part of this core; the tuple is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub pulse_number: PulseNumber,
    pub next_pulse_number: PulseNumber,
    pub entropy: [u8; 32],
    /// Unix timestamp of pulse emission, seconds.
    pub epoch_time: i64,
    pub signs: Vec<PulseSign>,
}

impl Pulse {
    pub fn new(pulse_number: PulseNumber, next_pulse_number: PulseNumber, entropy: [u8; 32]) -> Self {
        Pulse {
            pulse_number,
            next_pulse_number,
            entropy,
            epoch_time: chrono::Utc::now().timestamp(),
            signs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_ordering_follows_counter() {
        assert!(PulseNumber(100) < PulseNumber(101));
        assert!(PulseNumber::ANTIQUE < PulseNumber::GENESIS);
        assert_eq!(PulseNumber(100).next(10), PulseNumber(110));
        assert_eq!(PulseNumber(100).prev(10), PulseNumber(90));
    }

    #[test]
    fn prev_saturates_at_antique() {
        assert_eq!(PulseNumber(3).prev(10), PulseNumber::ANTIQUE);
    }

    #[test]
    fn be_bytes_preserve_order() {
        assert!(PulseNumber(256).to_be_bytes() > PulseNumber(255).to_be_bytes());
    }
}
