//! Per-context state: token buffer, logits buffer, and the owned batch and
//! candidate slabs, with the invariant `logits.length <= tokens.length <=
//! contextSize` enforced at every mutation.

use std::sync::Arc;

use crate::batch::BatchSlab;
use crate::candidates::CandidateSlab;
use crate::context_params::ContextParams;
use crate::error::{Error, Result};
use crate::native::{NativeContext, NativeModel};
use crate::token::{SEQ_ID, TokenId};

pub struct ContextState {
    pub(crate) native: NativeContext,
    pub(crate) params: ContextParams,
    tokens: Vec<TokenId>,
    /// One logits row per ingested token, flattened; row width is `n_vocab`.
    logits: Vec<Vec<f32>>,
    pub(crate) batch: BatchSlab,
    pub(crate) candidates: CandidateSlab,
}

impl ContextState {
    pub fn new(model: &Arc<NativeModel>, params: ContextParams) -> Result<Self> {
        let native = NativeContext::new(model, &params)?;
        let batch = BatchSlab::new(&model.lib, params.n_batch as usize);
        let candidates = CandidateSlab::new(model.n_vocab() as usize);
        Ok(Self {
            native,
            params,
            tokens: Vec::new(),
            logits: Vec::new(),
            batch,
            candidates,
        })
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn tokens_len(&self) -> usize {
        self.tokens.len()
    }

    pub fn logits_len(&self) -> usize {
        self.logits.len()
    }

    pub fn context_size(&self) -> usize {
        self.params.n_ctx as usize
    }

    pub fn batch_width(&self) -> usize {
        self.params.n_batch as usize
    }

    pub fn needs_ingesting(&self) -> bool {
        self.logits_len() < self.tokens_len()
    }

    /// The most recently ingested token's logits row, if any.
    pub fn last_logits_row(&self) -> Option<&[f32]> {
        self.logits.last().map(|row| row.as_slice())
    }

    /// Tokenizes `text` and appends the resulting ids to the token buffer.
    /// Prepends BOS iff this is the first tokenize call on a fresh context.
    /// Returns the appended slice's start index.
    pub fn tokenize(&mut self, model: &NativeModel, text: &str) -> Result<usize> {
        let add_bos = self.tokens.is_empty();
        let new_tokens = model.tokenize(text, add_bos)?;
        let start = self.tokens.len();
        if start + new_tokens.len() > self.context_size() {
            return Err(Error::InvalidArgument(format!(
                "tokenize would grow token buffer to {} beyond context size {}",
                start + new_tokens.len(),
                self.context_size()
            )));
        }
        self.tokens.extend(new_tokens);
        Ok(start)
    }

    /// Truncates the token (and, if needed, logits) buffer to `new_length`.
    /// `None` or a no-op length leaves the context unchanged. Rejects growth.
    pub fn edit(&mut self, new_length: Option<usize>) -> Result<()> {
        let l = match new_length {
            None => return Ok(()),
            Some(l) => l,
        };
        if l == self.tokens.len() {
            return Ok(());
        }
        if l > self.tokens.len() {
            return Err(Error::InvalidArgument(format!(
                "edit({l}) exceeds current token length {}",
                self.tokens.len()
            )));
        }
        self.tokens.truncate(l);
        if self.logits.len() > l {
            self.logits.truncate(l);
            self.native.kv_cache_seq_rm(SEQ_ID, l as i32, -1);
        }
        Ok(())
    }

    /// Appends one ingested token's logits row, extending `logits.length` by
    /// one position.
    pub(crate) fn push_logits_row(&mut self, row: Vec<f32>) {
        self.logits.push(row);
    }

    /// Appends a generated token id to the token buffer (used by the
    /// generate loop once a sampler chain has chosen a token).
    pub(crate) fn push_token(&mut self, id: TokenId) {
        self.tokens.push(id);
    }
}

// `ContextState::new` requires a real loaded native model handle to
// construct, so its buffer invariants aren't covered by a unit test here;
// exercising `tokenize`/`edit`/`needs_ingesting` needs a real shared library
// and model file, same constraint as the scenarios in DESIGN.md's known gaps.
