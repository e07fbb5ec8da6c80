// Two-dimensional membership consensus: rows and columns are the nodes
// of the unsync list, entry (i, j) is node i's opinion about node j.
//
// The diagonal is each node's self-state; row i is the bitset node i
// sent in phase 2.

use log::debug;

use lumen_core::config::ConsensusSettings;
use lumen_core::error::CoreError;

use crate::bitset::{Bitset, BitsetCell};

#[derive(Debug)]
pub struct StateMatrix {
    size: usize,
    rows: Vec<Option<Bitset>>,
    /// Rows whose sender passed signature check.
    trusted: Vec<bool>,
}

/// Output of the phase-2 consensus rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Result {
    /// Columns with a supermajority of legit votes.
    pub active: Vec<usize>,
    /// Columns a strict majority marked timed-out.
    pub timed_out: Vec<usize>,
    /// Columns requiring the phase 2.1 supplementary round.
    pub additional_requests: Vec<usize>,
}

impl StateMatrix {
    pub fn new(size: usize) -> Self {
        StateMatrix {
            size,
            rows: vec![None; size],
            trusted: vec![false; size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Store the bitset a sender provided as its row. Only rows from
    /// signature-checked senders count toward consensus.
    pub fn apply_bitset(&mut self, sender_index: usize, bitset: Bitset) -> Result<(), CoreError> {
        if sender_index >= self.size {
            return Err(CoreError::Bus(format!(
                "row {sender_index} outside matrix of size {}",
                self.size
            )));
        }
        if bitset.len() != self.size {
            return Err(CoreError::Bus(format!(
                "bitset length {} does not match unsync list length {}",
                bitset.len(),
                self.size
            )));
        }
        self.rows[sender_index] = Some(bitset);
        self.trusted[sender_index] = true;
        Ok(())
    }

    /// Mark a column as decided legit without a row (phase 2.1
    /// supplementary vote).
    pub fn supplementary_legit(&mut self, column: usize) {
        for row in self.rows.iter_mut().flatten() {
            if row.get(column) == Some(BitsetCell::TimedOut) {
                row.set(column, BitsetCell::Legit);
            }
        }
    }

    /// Phase-2 consensus rule, per column:
    /// - legit count over trusted rows >= quorum      -> active
    /// - timed-out strict majority over trusted rows  -> timed-out
    ///   (a legit/timed-out tie resolves toward legit, i.e. the column
    ///   stays a candidate)
    /// - otherwise                                    -> phase 2.1
    pub fn calculate_phase2(&self, settings: &ConsensusSettings) -> Phase2Result {
        let quorum = settings.quorum(self.size);
        let trusted_rows: Vec<&Bitset> = self
            .rows
            .iter()
            .zip(&self.trusted)
            .filter_map(|(row, trusted)| if *trusted { row.as_ref() } else { None })
            .collect();

        let mut result = Phase2Result {
            active: Vec::new(),
            timed_out: Vec::new(),
            additional_requests: Vec::new(),
        };

        for column in 0..self.size {
            let mut legit = 0usize;
            let mut timed_out = 0usize;
            for row in &trusted_rows {
                match row.get(column) {
                    Some(BitsetCell::Legit) => legit += 1,
                    Some(BitsetCell::TimedOut) => timed_out += 1,
                    _ => {}
                }
            }
            if legit >= quorum {
                result.active.push(column);
            } else if timed_out > legit && timed_out * 2 > trusted_rows.len() {
                result.timed_out.push(column);
            } else {
                result.additional_requests.push(column);
            }
        }

        debug!(
            "[StateMatrix] phase2: {} active, {} timed-out, {} supplementary (quorum {})",
            result.active.len(),
            result.timed_out.len(),
            result.additional_requests.len(),
            quorum
        );
        result
    }
}
