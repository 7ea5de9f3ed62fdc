//! Per-ordering-key send sequencing.
//!
//! Within one key, batch N+1 is not sent until batch N's publish has
//! completed successfully. A failed batch pauses the key: everything
//! queued fails fast, and later publishes are rejected until the caller
//! resumes the key.

use std::collections::{HashMap, HashSet, VecDeque};

use super::batch::SealedBatch;

#[derive(Default)]
pub(crate) struct KeySequencer {
    in_flight: HashSet<String>,
    queued: HashMap<String, VecDeque<SealedBatch>>,
    paused: HashSet<String>,
}

impl KeySequencer {
    pub fn is_paused(&self, key: &str) -> bool {
        self.paused.contains(key)
    }

    /// Clear a paused key so publishing may start again. No-op if the key
    /// is not paused.
    pub fn resume(&mut self, key: &str) -> bool {
        self.paused.remove(key)
    }

    /// Offer a sealed batch for its key. Returns the batch if the key is
    /// idle and the caller should send it now; otherwise it waits in line.
    pub fn submit(&mut self, batch: SealedBatch) -> Option<SealedBatch> {
        let key = batch.ordering_key.clone();
        if self.in_flight.contains(&key) {
            self.queued.entry(key).or_default().push_back(batch);
            None
        } else {
            self.in_flight.insert(key);
            Some(batch)
        }
    }

    /// The in-flight batch for `key` succeeded. Returns the next batch to
    /// send, which stays accounted as in flight; the key goes idle when
    /// nothing is queued.
    pub fn complete(&mut self, key: &str) -> Option<SealedBatch> {
        match self.queued.get_mut(key).and_then(VecDeque::pop_front) {
            Some(next) => Some(next),
            None => {
                self.queued.remove(key);
                self.in_flight.remove(key);
                None
            }
        }
    }

    /// The in-flight batch for `key` failed. Pauses the key and returns
    /// every queued batch so the caller can fail them fast.
    pub fn fail(&mut self, key: &str) -> Vec<SealedBatch> {
        self.in_flight.remove(key);
        self.paused.insert(key.to_string());
        self.queued
            .remove(key)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Whether any batch is in flight or queued.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(key: &str) -> SealedBatch {
        SealedBatch {
            messages: vec![Default::default()],
            completions: vec![],
            bytes: 1,
            ordering_key: key.to_string(),
        }
    }

    #[test]
    fn test_idle_key_sends_immediately() {
        let mut seq = KeySequencer::default();
        assert!(seq.submit(batch("a")).is_some());
        // Second batch queues behind the first.
        assert!(seq.submit(batch("a")).is_none());
        // Different key is independent.
        assert!(seq.submit(batch("b")).is_some());
    }

    #[test]
    fn test_complete_releases_next_in_order() {
        let mut seq = KeySequencer::default();
        assert!(seq.submit(batch("a")).is_some());
        assert!(seq.submit(batch("a")).is_none());
        assert!(seq.submit(batch("a")).is_none());

        assert!(seq.complete("a").is_some());
        assert!(seq.complete("a").is_some());
        assert!(seq.complete("a").is_none());
        assert!(seq.is_idle());
    }

    #[test]
    fn test_failure_pauses_and_drains() {
        let mut seq = KeySequencer::default();
        assert!(seq.submit(batch("a")).is_some());
        assert!(seq.submit(batch("a")).is_none());
        assert!(seq.submit(batch("a")).is_none());

        let drained = seq.fail("a");
        assert_eq!(drained.len(), 2);
        assert!(seq.is_paused("a"));
        assert!(seq.is_idle());

        assert!(seq.resume("a"));
        assert!(!seq.is_paused("a"));
        assert!(!seq.resume("a"));
    }
}
