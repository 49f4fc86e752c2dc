/// Parameters governing how model weights are loaded.
///
/// Derives `Serialize`/`Deserialize` so callers can load these from a config
/// file or environment-sourced JSON rather than constructing them in code.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Number of transformer layers to offload to the GPU (0 = CPU only).
    pub n_gpu_layers: i32,
    /// Index of the primary GPU, when more than one is available.
    pub main_gpu: i32,
    /// Load only vocabulary metadata, skipping tensor weights.
    pub vocab_only: bool,
    /// Use memory-mapped I/O for the weights file when available.
    pub use_mmap: bool,
    /// Lock weight pages in RAM, preventing them from being swapped out.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            main_gpu: 0,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl ModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_gpu_layers(mut self, n: i32) -> Self {
        self.n_gpu_layers = n;
        self
    }

    pub fn main_gpu(mut self, n: i32) -> Self {
        self.main_gpu = n;
        self
    }

    pub fn vocab_only(mut self, v: bool) -> Self {
        self.vocab_only = v;
        self
    }

    pub fn use_mmap(mut self, v: bool) -> Self {
        self.use_mmap = v;
        self
    }

    pub fn use_mlock(mut self, v: bool) -> Self {
        self.use_mlock = v;
        self
    }

    pub(crate) fn to_native(
        &self,
        progress_callback: Option<llama_sys::ProgressCallback>,
        progress_callback_user_data: *mut std::ffi::c_void,
    ) -> llama_sys::ModelParams {
        llama_sys::ModelParams {
            n_gpu_layers: self.n_gpu_layers,
            main_gpu: self.main_gpu,
            vocab_only: self.vocab_only,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            progress_callback,
            progress_callback_user_data,
        }
    }
}
