//! The prefill/ingest driver: advances a context's logits buffer up to its
//! token buffer by issuing batched decode calls of width <= batch width.

use crate::context_state::ContextState;
use crate::error::Result;
use crate::token::SEQ_ID;

/// Signals whether an in-progress ingest should keep running. Takes `&mut
/// self` since checking typically drains a channel.
pub trait CancelSignal {
    fn is_cancelled(&mut self) -> bool;
}

/// Outcome of one [`run_ingest`] call.
pub enum IngestOutcome {
    /// `logits.length == tokens.length`; ingest is complete.
    Done,
    /// A cancellation was observed at a yield point; `logits.length` may
    /// have advanced partway and is safe to resume from.
    Cancelled,
}

/// Runs the ingest loop described in the design: repeatedly fills the
/// context's batch slab with up to `batch_width` un-ingested tokens,
/// decodes, and appends the resulting logits rows, until the token and
/// logits buffers agree or cancellation is observed.
///
/// Runs synchronously on the worker thread. One cooperative yield point per
/// iteration, immediately before decode, is where `cancel` is checked; a
/// native decode call in progress is never interrupted.
pub fn run_ingest(state: &mut ContextState, cancel: &mut dyn CancelSignal) -> Result<IngestOutcome> {
    while state.needs_ingesting() {
        let i = state.logits_len();
        let remaining = state.tokens_len() - i;
        let fill = remaining.min(state.batch_width());

        state.batch.clear();
        for offset in 0..fill {
            let pos = (i + offset) as i32;
            let token = state.tokens()[i + offset];
            let want_logits = true;
            state.batch.push(token, pos, SEQ_ID, want_logits)?;
        }

        if cancel.is_cancelled() {
            return Ok(IngestOutcome::Cancelled);
        }

        let raw_batch = state.batch.as_raw();
        state.native.decode(raw_batch)?;

        for offset in 0..fill {
            let row = state.native.logits_ith(offset as i32);
            state.push_logits_row(row.to_vec());
        }
    }
    Ok(IngestOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCancelled;
    impl CancelSignal for NeverCancelled {
        fn is_cancelled(&mut self) -> bool {
            false
        }
    }

    struct AlwaysCancelled;
    impl CancelSignal for AlwaysCancelled {
        fn is_cancelled(&mut self) -> bool {
            true
        }
    }

    #[test]
    fn cancel_signal_trait_objects_behave() {
        let mut never = NeverCancelled;
        let mut always = AlwaysCancelled;
        assert!(!never.is_cancelled());
        assert!(always.is_cancelled());
    }
}
