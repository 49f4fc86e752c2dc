//! The per-context batch slab: a fixed-capacity staging area for one decode
//! call, backed by native-owned memory obtained once at context creation and
//! reused for the life of the context.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::native::NativeLib;
use crate::token::{Pos, SeqId, TokenId};

pub struct BatchSlab {
    raw: llama_sys::Batch,
    capacity: usize,
    len: usize,
    lib: Arc<NativeLib>,
}

unsafe impl Send for BatchSlab {}

impl BatchSlab {
    /// Allocates native storage for up to `capacity` tokens. The allocation
    /// is not resized again; `capacity` should be the context's batch width.
    pub fn new(lib: &Arc<NativeLib>, capacity: usize) -> Self {
        let raw = unsafe { (lib.lib.batch_init)(capacity as i32, 0) };
        Self {
            raw,
            capacity,
            len: 0,
            lib: Arc::clone(lib),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resets the slab for reuse without releasing native storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends one token at absolute position `pos` on the single sequence
    /// `seq_id`, requesting logits iff `want_logits`.
    pub fn push(&mut self, token: TokenId, pos: Pos, seq_id: SeqId, want_logits: bool) -> Result<()> {
        if self.len >= self.capacity {
            return Err(Error::InvalidArgument(format!(
                "batch slab at capacity ({})",
                self.capacity
            )));
        }
        let i = self.len;
        unsafe {
            *self.raw.token.add(i) = token;
            *self.raw.pos.add(i) = pos;
            *self.raw.n_seq_id.add(i) = 1;
            *(*self.raw.seq_id.add(i)) = seq_id;
            *self.raw.logits.add(i) = if want_logits { 1 } else { 0 };
        }
        self.len += 1;
        Ok(())
    }

    /// Returns the raw batch truncated to the tokens pushed so far, ready to
    /// pass to [`crate::native::NativeContext::decode`].
    pub(crate) fn as_raw(&self) -> llama_sys::Batch {
        let mut raw = self.raw;
        raw.n_tokens = self.len as i32;
        raw
    }
}

impl Drop for BatchSlab {
    fn drop(&mut self) {
        unsafe { (self.lib.lib.batch_free)(self.raw) }
    }
}

// `BatchSlab::new` allocates through the loaded native library, so its
// push/clear/capacity bookkeeping isn't covered by a unit test here; the
// same constraint as `ContextState` (see that module's test note).
