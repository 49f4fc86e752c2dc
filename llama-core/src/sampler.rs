//! The sampler chain: an ordered list of transformations over a
//! [`CandidateSlab`], ending in a terminal sampler that picks a token.
//!
//! Non-terminal samplers (top-k, top-p, min-p, temperature, repetition
//! penalty) mutate the slab in place and return `None`. The two terminal
//! samplers (greedy, probabilistic) call through to the native context and
//! return `Some(token)`.

use crate::candidates::CandidateSlab;
use crate::error::{Error, Result};
use crate::native::NativeContext;
use crate::token::{Token, TokenId};

/// One stage in a sampler chain.
///
/// A sampler that needs native scratch memory overrides `allocate`/`free`;
/// the engine calls `allocate` once before the generate loop and `free` once
/// after, on every exit path. Most samplers need neither and use the default
/// no-op implementations.
pub trait Sampler: Send {
    /// Applies this stage. Non-terminal stages mutate `candidates` and
    /// return `Ok(None)`; a terminal stage calls into `ctx` and returns
    /// `Ok(Some(token_id))`.
    fn sample(
        &mut self,
        ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        tokens: &[TokenId],
    ) -> Result<Option<TokenId>>;

    /// Whether this stage terminates the chain. Only the last entry in a
    /// chain may return `true`.
    fn is_terminal(&self) -> bool {
        false
    }

    /// A short name for this stage, used in [`Error::SamplerMisuse`] reports.
    fn name(&self) -> &'static str;

    /// Acquires any native scratch this stage needs, called once before the
    /// generate loop begins.
    fn allocate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases scratch acquired by `allocate`. Called on every exit path,
    /// including error and cancellation.
    fn free(&mut self) {}
}

/// Restricts candidates to the top `k` by logit, discarding the rest.
pub struct TopK {
    pub k: usize,
}

impl Sampler for TopK {
    fn sample(
        &mut self,
        _ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        if !candidates.is_sorted() {
            candidates.sort_by_logit_desc();
        }
        if self.k < candidates.len() {
            candidates.truncate(self.k);
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "top_k"
    }
}

/// Restricts candidates to the smallest prefix whose cumulative probability
/// mass reaches `p`, after converting logits to a softmax distribution.
pub struct TopP {
    pub p: f32,
}

impl Sampler for TopP {
    fn sample(
        &mut self,
        _ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        if !candidates.is_sorted() {
            candidates.sort_by_logit_desc();
        }
        softmax_in_place(candidates.as_mut_slice());
        let mut cumulative = 0.0f32;
        let mut cutoff = candidates.len();
        for (i, c) in candidates.as_slice().iter().enumerate() {
            cumulative += c.p;
            if cumulative >= self.p {
                cutoff = i + 1;
                break;
            }
        }
        candidates.truncate(cutoff);
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "top_p"
    }
}

/// Discards candidates whose probability is below `p` times the most likely
/// candidate's probability.
pub struct MinP {
    pub p: f32,
}

impl Sampler for MinP {
    fn sample(
        &mut self,
        _ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        if !candidates.is_sorted() {
            candidates.sort_by_logit_desc();
        }
        softmax_in_place(candidates.as_mut_slice());
        let top_p = candidates.as_slice().first().map(|c| c.p).unwrap_or(0.0);
        let threshold = top_p * self.p;
        let keep = candidates
            .as_slice()
            .iter()
            .take_while(|c| c.p >= threshold)
            .count()
            .max(1);
        candidates.truncate(keep);
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "min_p"
    }
}

/// Scales logits by `1 / temperature` before any downstream softmax. A
/// temperature of 0 is rejected by callers that want true greedy behavior —
/// use the [`Greedy`] terminal instead.
pub struct Temperature {
    pub temperature: f32,
}

impl Sampler for Temperature {
    fn sample(
        &mut self,
        _ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        let t = self.temperature.max(1e-4);
        for c in candidates.as_mut_slice() {
            c.logit /= t;
        }
        candidates.mark_unsorted();
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "temperature"
    }
}

/// Penalizes logits for tokens seen in the last `last_n` generated tokens by
/// dividing (positive logits) or multiplying (negative logits) by `penalty`.
pub struct RepetitionPenalty {
    pub penalty: f32,
    pub last_n: usize,
}

impl Sampler for RepetitionPenalty {
    fn sample(
        &mut self,
        _ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        if self.penalty == 1.0 {
            return Ok(None);
        }
        let recent = &tokens[tokens.len().saturating_sub(self.last_n)..];
        for c in candidates.as_mut_slice() {
            if recent.contains(&c.id) {
                c.logit = if c.logit > 0.0 {
                    c.logit / self.penalty
                } else {
                    c.logit * self.penalty
                };
            }
        }
        candidates.mark_unsorted();
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Terminal sampler: arg-max over logits, via the native greedy primitive.
pub struct Greedy;

impl Sampler for Greedy {
    fn sample(
        &mut self,
        ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        Ok(Some(ctx.sample_token_greedy(candidates.as_mut_slice())))
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "greedy"
    }
}

/// Terminal sampler: weighted draw over the current distribution, using the
/// native context's own PRNG (seeded from context params at creation).
pub struct Probabilistic;

impl Sampler for Probabilistic {
    fn sample(
        &mut self,
        ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        _tokens: &[TokenId],
    ) -> Result<Option<TokenId>> {
        Ok(Some(ctx.sample_token(candidates.as_mut_slice())))
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "probabilistic"
    }
}

fn softmax_in_place(candidates: &mut [crate::native::Candidate]) {
    let max_logit = candidates
        .iter()
        .map(|c| c.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max_logit).exp();
        sum += c.p;
    }
    if sum > 0.0 {
        for c in candidates.iter_mut() {
            c.p /= sum;
        }
    }
}

/// An ordered chain of samplers. Validates misuse (a terminal stage followed
/// by further stages) once, up front; if the chain does not end in a
/// terminal stage, a default probabilistic terminal is appended.
pub struct SamplerChain {
    stages: Vec<Box<dyn Sampler>>,
}

impl SamplerChain {
    /// Builds a chain from `stages`, appending a default [`Probabilistic`]
    /// terminal if none of the supplied stages is terminal. Fails if a
    /// terminal stage appears anywhere but last.
    pub fn new(mut stages: Vec<Box<dyn Sampler>>) -> Result<Self> {
        if let Some(first_terminal) = stages.iter().position(|s| s.is_terminal()) {
            if first_terminal != stages.len() - 1 {
                let unused: Vec<String> = stages[first_terminal + 1..]
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect();
                return Err(Error::SamplerMisuse(unused));
            }
        } else {
            stages.push(Box::new(Probabilistic));
        }
        Ok(Self { stages })
    }

    pub fn allocate(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.allocate()?;
        }
        Ok(())
    }

    pub fn free(&mut self) {
        for stage in &mut self.stages {
            stage.free();
        }
    }

    /// Runs every stage in order, returning the terminal's chosen token.
    pub fn run(
        &mut self,
        ctx: &mut NativeContext,
        candidates: &mut CandidateSlab,
        tokens: &[TokenId],
    ) -> Result<Token> {
        let mut chosen = None;
        for stage in &mut self.stages {
            if let Some(id) = stage.sample(ctx, candidates, tokens)? {
                chosen = Some(id);
            }
        }
        let id = chosen.expect("chain validated to end in a terminal sampler");
        let text = ctx.token_text(id)?;
        Ok(Token { id, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NonTerminalStub;
    impl Sampler for NonTerminalStub {
        fn sample(
            &mut self,
            _ctx: &mut NativeContext,
            _candidates: &mut CandidateSlab,
            _tokens: &[TokenId],
        ) -> Result<Option<TokenId>> {
            Ok(None)
        }
        fn name(&self) -> &'static str {
            "stub"
        }
    }

    struct TerminalStub;
    impl Sampler for TerminalStub {
        fn sample(
            &mut self,
            _ctx: &mut NativeContext,
            _candidates: &mut CandidateSlab,
            _tokens: &[TokenId],
        ) -> Result<Option<TokenId>> {
            Ok(Some(7))
        }
        fn is_terminal(&self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "terminal_stub"
        }
    }

    #[test]
    fn terminal_not_last_is_misuse() {
        let result = SamplerChain::new(vec![Box::new(TerminalStub), Box::new(NonTerminalStub)]);
        match result {
            Err(Error::SamplerMisuse(names)) => assert_eq!(names, vec!["stub".to_string()]),
            other => panic!("expected SamplerMisuse, got {other:?}"),
        }
    }

    #[test]
    fn chain_without_terminal_gets_default_appended() {
        let chain = SamplerChain::new(vec![Box::new(NonTerminalStub)]).unwrap();
        assert_eq!(chain.stages.len(), 2);
        assert!(chain.stages.last().unwrap().is_terminal());
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut candidates = vec![
            crate::native::Candidate {
                id: 0,
                logit: 1.0,
                p: 0.0,
            },
            crate::native::Candidate {
                id: 1,
                logit: 2.0,
                p: 0.0,
            },
            crate::native::Candidate {
                id: 2,
                logit: 0.5,
                p: 0.0,
            },
        ];
        softmax_in_place(&mut candidates);
        let sum: f32 = candidates.iter().map(|c| c.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
