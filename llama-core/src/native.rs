//! Thin value-level bindings over [`llama_sys`].
//!
//! Every function here does exactly one native call (plus, where the native
//! contract requires it, a null/status check translated into [`Error`]). No
//! buffering, batching, or bookkeeping lives at this layer — that is the
//! worker and context state's job.

use std::ffi::{CStr, CString, c_void};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model_params::ModelParams;
use crate::token::{Pos, SeqId, TokenId, normalize_piece};

/// One vocabulary candidate during sampling: its id, raw logit, and
/// (once normalized by a sampler) probability.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// A native log message's severity, as reported to `log_set`'s callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl TryFrom<i32> for LogLevel {
    type Error = Error;

    fn try_from(level: i32) -> Result<Self> {
        match level {
            0 => Ok(LogLevel::Error),
            1 => Ok(LogLevel::Warn),
            2 => Ok(LogLevel::Info),
            3 => Ok(LogLevel::Debug),
            4 => Ok(LogLevel::Trace),
            other => Err(Error::UnknownLogLevel(other)),
        }
    }
}

/// Owns the dynamically loaded library handle.
pub struct NativeLib {
    pub(crate) lib: llama_sys::LlamaLib,
}

impl NativeLib {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let lib = unsafe { llama_sys::LlamaLib::new(path) }.map_err(|source| Error::LibraryOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Arc::new(Self { lib }))
    }

    pub fn backend_init(&self, numa: bool) {
        unsafe { (self.lib.backend_init)(numa) }
    }

    pub fn backend_free(&self) {
        unsafe { (self.lib.backend_free)() }
    }

    /// Registers a native log callback. Pass `None` to silence the native
    /// library's own logging.
    pub fn set_log_callback(&self, callback: Option<llama_sys::LogCallback>) {
        unsafe { (self.lib.log_set)(callback, std::ptr::null_mut()) }
    }
}

/// A loaded set of model weights. Freed when the last reference (held by the
/// worker's model registry and any contexts built on it) is dropped.
pub struct NativeModel {
    pub(crate) handle: llama_sys::ModelHandle,
    pub(crate) lib: Arc<NativeLib>,
}

unsafe impl Send for NativeModel {}
unsafe impl Sync for NativeModel {}

impl Drop for NativeModel {
    fn drop(&mut self) {
        unsafe { (self.lib.lib.free_model)(self.handle) }
    }
}

impl NativeModel {
    /// Loads model weights from `path`. `progress` and `progress_user_data`
    /// are forwarded verbatim to the native loader; the worker uses
    /// `progress_user_data` to smuggle a request id through the callback
    /// (see [`crate::worker`]).
    pub fn load_from_file(
        lib: &Arc<NativeLib>,
        path: &str,
        params: &ModelParams,
        progress: Option<llama_sys::ProgressCallback>,
        progress_user_data: *mut c_void,
    ) -> Result<Self> {
        let c_path = CString::new(path)?;
        let native_params = params.to_native(progress, progress_user_data);
        let handle = unsafe { (lib.lib.load_model_from_file)(c_path.as_ptr(), native_params) };
        if handle.is_null() {
            return Err(Error::NativeLoadFailure);
        }
        Ok(Self {
            handle,
            lib: Arc::clone(lib),
        })
    }

    /// Tokenizes `text`. On the very first call for a fresh context the
    /// caller passes `add_bos = true` to prepend the beginning-of-sequence
    /// marker; later calls pass `false`.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let bytes = text.as_bytes();
        let n = unsafe {
            (self.lib.lib.tokenize)(
                self.handle,
                bytes.as_ptr() as *const std::os::raw::c_char,
                bytes.len() as i32,
                std::ptr::null_mut(),
                0,
                add_bos,
            )
        };
        let required = if n < 0 { (-n) as usize } else { n as usize };
        if required == 0 {
            return Ok(Vec::new());
        }
        let mut tokens: Vec<TokenId> = vec![0; required];
        let n2 = unsafe {
            (self.lib.lib.tokenize)(
                self.handle,
                bytes.as_ptr() as *const std::os::raw::c_char,
                bytes.len() as i32,
                tokens.as_mut_ptr(),
                required as i32,
                add_bos,
            )
        };
        if n2 < 0 {
            return Err(Error::NativeCallFailure(n2));
        }
        tokens.truncate(n2 as usize);
        Ok(tokens)
    }

    pub fn n_vocab(&self) -> i32 {
        unsafe { (self.lib.lib.n_vocab)(self.handle) }
    }
}

/// A live inference context bound to exactly one model.
pub struct NativeContext {
    pub(crate) handle: llama_sys::ContextHandle,
    pub(crate) model: Arc<NativeModel>,
}

unsafe impl Send for NativeContext {}
unsafe impl Sync for NativeContext {}

impl Drop for NativeContext {
    fn drop(&mut self) {
        unsafe { (self.model.lib.lib.free)(self.handle) }
    }
}

impl NativeContext {
    pub fn new(model: &Arc<NativeModel>, params: &crate::context_params::ContextParams) -> Result<Self> {
        let native_params = params.to_native();
        let handle =
            unsafe { (model.lib.lib.new_context_with_model)(model.handle, native_params) };
        if handle.is_null() {
            return Err(Error::NativeAllocFailure);
        }
        Ok(Self {
            handle,
            model: Arc::clone(model),
        })
    }

    /// Resolves a token id to its native text rendering, with the library's
    /// space-substitution glyph rewritten to ASCII space.
    pub fn token_text(&self, id: TokenId) -> Result<String> {
        let ptr = unsafe { (self.model.lib.lib.token_get_text)(self.handle, id) };
        if ptr.is_null() {
            return Err(Error::NativeCallFailure(0));
        }
        let cstr = unsafe { CStr::from_ptr(ptr) };
        let raw = cstr.to_str()?;
        Ok(normalize_piece(raw))
    }

    pub fn token_eos(&self) -> TokenId {
        unsafe { (self.model.lib.lib.token_eos)(self.handle) }
    }

    /// Runs one decode call over `batch`, which must have been populated via
    /// [`crate::batch::BatchSlab`]. Returns the native status on failure.
    pub fn decode(&mut self, batch: llama_sys::Batch) -> Result<()> {
        let status = unsafe { (self.model.lib.lib.decode)(self.handle, batch) };
        if status != 0 {
            Err(Error::NativeCallFailure(status))
        } else {
            Ok(())
        }
    }

    /// Reads the logits row for output slot `i` of the last decoded batch.
    pub fn logits_ith(&self, i: i32) -> &[f32] {
        let n_vocab = self.model.n_vocab() as usize;
        let ptr = unsafe { (self.model.lib.lib.get_logits_ith)(self.handle, i) };
        assert!(!ptr.is_null(), "get_logits_ith returned null");
        unsafe { std::slice::from_raw_parts(ptr, n_vocab) }
    }

    /// Removes `[p0, p1)` from sequence `seq_id` in the native KV cache.
    pub fn kv_cache_seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> bool {
        unsafe { (self.model.lib.lib.kv_cache_seq_rm)(self.handle, seq_id, p0, p1) }
    }

    /// Greedy (arg-max) terminal sampler.
    pub fn sample_token_greedy(&mut self, candidates: &mut [Candidate]) -> TokenId {
        let mut raw: Vec<llama_sys::TokenData> = candidates
            .iter()
            .map(|c| llama_sys::TokenData {
                id: c.id,
                logit: c.logit,
                p: c.p,
            })
            .collect();
        let mut array = llama_sys::TokenDataArray {
            data: raw.as_mut_ptr(),
            size: raw.len(),
            sorted: false,
        };
        unsafe { (self.model.lib.lib.sample_token_greedy)(self.handle, &mut array) }
    }

    /// Probabilistic terminal sampler: weighted draw using the context's own
    /// PRNG, which was seeded from context params at creation time.
    pub fn sample_token(&mut self, candidates: &mut [Candidate]) -> TokenId {
        let mut raw: Vec<llama_sys::TokenData> = candidates
            .iter()
            .map(|c| llama_sys::TokenData {
                id: c.id,
                logit: c.logit,
                p: c.p,
            })
            .collect();
        let mut array = llama_sys::TokenDataArray {
            data: raw.as_mut_ptr(),
            size: raw.len(),
            sorted: false,
        };
        unsafe { (self.model.lib.lib.sample_token)(self.handle, &mut array) }
    }
}
