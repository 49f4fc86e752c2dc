/// Parameters governing a single inference context.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// RNG seed used by the context's native sampler state.
    pub seed: u32,
    /// Context window size, in tokens.
    pub n_ctx: u32,
    /// Maximum number of tokens submitted to a single decode call.
    pub n_batch: u32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub mul_mat_q: bool,
    pub f16_kv: bool,
    /// Request logits for every ingested token, not just the last. Enabled
    /// by default.
    pub compute_all_logits: bool,
    pub embedding_only: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            seed: llama_sys::LLAMA_DEFAULT_SEED,
            n_ctx: 512,
            n_batch: 512,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            mul_mat_q: true,
            f16_kv: true,
            compute_all_logits: true,
            embedding_only: false,
        }
    }
}

impl ContextParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(mut self, v: u32) -> Self {
        self.seed = v;
        self
    }

    pub fn n_ctx(mut self, v: u32) -> Self {
        self.n_ctx = v;
        self
    }

    pub fn n_batch(mut self, v: u32) -> Self {
        self.n_batch = v;
        self
    }

    pub fn rope_freq_base(mut self, v: f32) -> Self {
        self.rope_freq_base = v;
        self
    }

    pub fn rope_freq_scale(mut self, v: f32) -> Self {
        self.rope_freq_scale = v;
        self
    }

    pub fn mul_mat_q(mut self, v: bool) -> Self {
        self.mul_mat_q = v;
        self
    }

    pub fn f16_kv(mut self, v: bool) -> Self {
        self.f16_kv = v;
        self
    }

    pub fn compute_all_logits(mut self, v: bool) -> Self {
        self.compute_all_logits = v;
        self
    }

    pub fn embedding_only(mut self, v: bool) -> Self {
        self.embedding_only = v;
        self
    }

    pub(crate) fn to_native(&self) -> llama_sys::ContextParams {
        llama_sys::ContextParams {
            seed: self.seed,
            n_ctx: self.n_ctx,
            n_batch: self.n_batch,
            rope_freq_base: self.rope_freq_base,
            rope_freq_scale: self.rope_freq_scale,
            mul_mat_q: self.mul_mat_q,
            f16_kv: self.f16_kv,
            logits_all: self.compute_all_logits,
            embedding: self.embedding_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_in_defaults() {
        let parsed: ContextParams = serde_json::from_str(r#"{"n_ctx": 19, "n_batch": 19}"#).unwrap();
        assert_eq!(parsed.n_ctx, 19);
        assert_eq!(parsed.n_batch, 19);
        assert_eq!(parsed.seed, llama_sys::LLAMA_DEFAULT_SEED);
        assert!(parsed.compute_all_logits);
    }

    #[test]
    fn round_trips_through_json() {
        let original = ContextParams::new().n_ctx(4096).seed(7);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ContextParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.n_ctx, 4096);
        assert_eq!(parsed.seed, 7);
    }
}
