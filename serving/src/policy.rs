use std::{
    collections::VecDeque,
    fmt::Debug,
    time::{Duration, Instant},
};

use crate::sequence::Sequence;

/// A trait for defining scheduling policies for sequences.
///
/// Implementors of this trait determine the priority of sequences
/// for processing in a scheduler.
pub trait Policy: Debug {
    /// Calculates the priority of a sequence at a given time.
    ///
    /// # Arguments
    ///
    /// * `now` - The current time.
    /// * `sequence` - The sequence to evaluate.
    ///
    /// # Returns
    ///
    /// A `Duration` representing the priority. Larger durations indicate higher priority.
    fn get_priority(now: Instant, sequence: &Sequence) -> Duration;

    /// Sorts a queue of sequences by descending priority, in place.
    ///
    /// Sequences with the same priority are ordered by request id, so that
    /// the resulting order is deterministic.
    fn sort_by_priority(now: Instant, sequences: &mut VecDeque<Sequence>) {
        sequences.make_contiguous().sort_by(|s1, s2| {
            Self::get_priority(now, s2)
                .cmp(&Self::get_priority(now, s1))
                .then_with(|| s1.request_id().cmp(s2.request_id()))
        });
    }
}

/// First-Come, First-Served (FCFS) scheduling policy.
///
/// This policy prioritizes sequences based on their arrival time,
/// giving higher priority to those that arrived earlier.
#[derive(Debug)]
pub struct FcfsPolicy {}

impl Policy for FcfsPolicy {
    fn get_priority(now: Instant, sequence: &Sequence) -> Duration {
        now.saturating_duration_since(sequence.arrival_time())
    }
}
