//! The per-context candidate slab: the Rust-owned vocabulary array samplers
//! read and mutate in place, one entry per vocabulary id.

use crate::native::Candidate;
use crate::token::TokenId;

/// A reusable, vocab-sized array of [`Candidate`] entries.
///
/// Loaded fresh from a logits row before every sampling pass and mutated in
/// place by each sampler in a chain; no sampler allocates its own copy.
pub struct CandidateSlab {
    entries: Vec<Candidate>,
    sorted: bool,
}

impl CandidateSlab {
    /// Allocates a slab sized for `n_vocab` entries, initially empty.
    pub fn new(n_vocab: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n_vocab),
            sorted: false,
        }
    }

    /// Repopulates the slab from one logits row: entry `i` gets id `i`, raw
    /// logit `logits[i]`, and probability `0.0` (samplers that need
    /// normalized probabilities compute them as they run).
    pub fn load_from_logits(&mut self, logits: &[f32]) {
        self.entries.clear();
        self.entries.extend(
            logits
                .iter()
                .enumerate()
                .map(|(i, &logit)| Candidate {
                    id: i as TokenId,
                    logit,
                    p: 0.0,
                }),
        );
        self.sorted = false;
    }

    pub fn as_slice(&self) -> &[Candidate] {
        &self.entries
    }

    pub fn as_mut_slice(&mut self) -> &mut [Candidate] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Sorts by descending logit and marks the slab sorted. Samplers that
    /// need order (top-k, top-p) call this rather than re-deriving it.
    pub fn sort_by_logit_desc(&mut self) {
        self.entries
            .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap());
        self.sorted = true;
    }

    /// Truncates to the first `k` entries, preserving current order.
    pub fn truncate(&mut self, k: usize) {
        self.entries.truncate(k);
    }

    /// Marks the slab unsorted, e.g. after an in-place reorder that doesn't
    /// preserve the descending-logit invariant.
    pub fn mark_unsorted(&mut self) {
        self.sorted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_logits_assigns_ids_in_order() {
        let mut slab = CandidateSlab::new(4);
        slab.load_from_logits(&[0.1, 0.5, -0.3, 2.0]);
        let ids: Vec<_> = slab.as_slice().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(!slab.is_sorted());
    }

    #[test]
    fn sort_by_logit_desc_orders_descending() {
        let mut slab = CandidateSlab::new(4);
        slab.load_from_logits(&[0.1, 0.5, -0.3, 2.0]);
        slab.sort_by_logit_desc();
        let logits: Vec<_> = slab.as_slice().iter().map(|c| c.logit).collect();
        assert_eq!(logits, vec![2.0, 0.5, 0.1, -0.3]);
        assert!(slab.is_sorted());
    }

    #[test]
    fn truncate_shrinks_len() {
        let mut slab = CandidateSlab::new(4);
        slab.load_from_logits(&[0.1, 0.5, -0.3, 2.0]);
        slab.sort_by_logit_desc();
        slab.truncate(2);
        assert_eq!(slab.len(), 2);
    }
}
