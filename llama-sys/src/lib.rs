//! Raw dynamic bindings to a native GGML-style inference library.
//!
//! This crate knows nothing about tokens, contexts, or samplers as concepts —
//! it only knows how to open a shared object and resolve a fixed set of
//! symbols into typed function pointers. Everything here is `unsafe`; safe
//! wrappers live in `llama-core`.
//!
//! Symbol names are deliberately generic (`load_model_from_file`, `decode`,
//! `sample_token_greedy`, ...) rather than tied to any one native library's
//! real export names, since the exact native ABI is an external contract,
//! not something this crate should hard-code.

use std::ffi::{c_char, c_void};
use std::path::Path;

pub type TokenId = i32;
pub type Pos = i32;
pub type SeqId = i32;

/// Opaque handle to native model weights.
pub type ModelHandle = *mut c_void;
/// Opaque handle to a native inference context.
pub type ContextHandle = *mut c_void;

/// Sentinel seed value meaning "pick a non-deterministic seed".
pub const LLAMA_DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Called by the native loader as model weights stream in; returning `false`
/// aborts the load. `user_data` carries a caller-chosen correlation value.
pub type ProgressCallback = unsafe extern "C" fn(progress: f32, user_data: *mut c_void) -> bool;

/// Native log sink. `level` is a native log-level ordinal, `text` a
/// NUL-terminated UTF-8 message.
pub type LogCallback =
    unsafe extern "C" fn(level: i32, text: *const c_char, user_data: *mut c_void);

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModelParams {
    pub n_gpu_layers: i32,
    pub main_gpu: i32,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub progress_callback: Option<ProgressCallback>,
    pub progress_callback_user_data: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ContextParams {
    pub seed: u32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub mul_mat_q: bool,
    pub f16_kv: bool,
    pub logits_all: bool,
    pub embedding: bool,
}

/// Mirrors the native batched-decode input: parallel arrays indexed by
/// position within the batch. Memory is owned by whatever `batch_init`
/// allocated; callers write through these pointers, never free them by hand.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Batch {
    pub n_tokens: i32,
    pub token: *mut TokenId,
    pub pos: *mut Pos,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut SeqId,
    pub logits: *mut i8,
}

/// One vocabulary entry's working state during sampling.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// The native candidate array: a `TokenData` slice plus a sorted flag, as
/// consumed by `sample_token_greedy` / `sample_token`.
#[repr(C)]
pub struct TokenDataArray {
    pub data: *mut TokenData,
    pub size: usize,
    pub sorted: bool,
}

/// Function-value façade over the dynamically loaded native library.
///
/// Every native operation the core uses is resolved once, at load time, into
/// a typed field here. There is no method-call indirection beyond the single
/// pointer dereference — the fields themselves are the "opaque function
/// values" the higher layers invoke directly.
pub struct LlamaLib {
    _lib: libloading::Library,

    pub backend_init: unsafe extern "C" fn(numa_flag: bool),
    pub backend_free: unsafe extern "C" fn(),

    pub model_default_params: unsafe extern "C" fn() -> ModelParams,
    pub load_model_from_file:
        unsafe extern "C" fn(path_utf8: *const c_char, params: ModelParams) -> ModelHandle,
    pub free_model: unsafe extern "C" fn(model: ModelHandle),

    pub context_default_params: unsafe extern "C" fn() -> ContextParams,
    pub new_context_with_model:
        unsafe extern "C" fn(model: ModelHandle, params: ContextParams) -> ContextHandle,
    pub free: unsafe extern "C" fn(ctx: ContextHandle),

    pub n_vocab: unsafe extern "C" fn(model: ModelHandle) -> i32,
    pub tokenize: unsafe extern "C" fn(
        model: ModelHandle,
        text_bytes: *const c_char,
        len: i32,
        out_buf: *mut TokenId,
        cap: i32,
        add_bos: bool,
    ) -> i32,
    pub token_get_text: unsafe extern "C" fn(ctx: ContextHandle, id: TokenId) -> *const c_char,
    pub token_eos: unsafe extern "C" fn(ctx: ContextHandle) -> TokenId,

    pub batch_init: unsafe extern "C" fn(capacity: i32, embd: i32) -> Batch,
    pub batch_free: unsafe extern "C" fn(batch: Batch),
    pub decode: unsafe extern "C" fn(ctx: ContextHandle, batch: Batch) -> i32,
    pub get_logits: unsafe extern "C" fn(ctx: ContextHandle) -> *mut f32,
    pub get_logits_ith: unsafe extern "C" fn(ctx: ContextHandle, i: i32) -> *mut f32,

    pub kv_cache_seq_rm:
        unsafe extern "C" fn(ctx: ContextHandle, seq_id: SeqId, p0: Pos, p1: Pos) -> bool,

    pub sample_token_greedy:
        unsafe extern "C" fn(ctx: ContextHandle, candidates: *mut TokenDataArray) -> TokenId,
    pub sample_token:
        unsafe extern "C" fn(ctx: ContextHandle, candidates: *mut TokenDataArray) -> TokenId,

    pub log_set: unsafe extern "C" fn(callback: Option<LogCallback>, user_data: *mut c_void),
}

macro_rules! load_symbol {
    ($lib:expr, $name:literal) => {
        *$lib.get(concat!($name, "\0").as_bytes())?
    };
}

impl LlamaLib {
    /// Open the shared library at `path` and resolve every symbol this crate
    /// needs. Fails if the library cannot be opened or a symbol is missing.
    ///
    /// # Safety
    /// The caller must ensure `path` names a library implementing the ABI
    /// this struct's function pointers describe; a mismatched library is
    /// undefined behavior the moment any field is called.
    pub unsafe fn new<P: AsRef<Path>>(path: P) -> Result<Self, libloading::Error> {
        let lib = unsafe { libloading::Library::new(path.as_ref())? };
        unsafe {
            Ok(Self {
                backend_init: load_symbol!(lib, "backend_init"),
                backend_free: load_symbol!(lib, "backend_free"),
                model_default_params: load_symbol!(lib, "model_default_params"),
                load_model_from_file: load_symbol!(lib, "load_model_from_file"),
                free_model: load_symbol!(lib, "free_model"),
                context_default_params: load_symbol!(lib, "context_default_params"),
                new_context_with_model: load_symbol!(lib, "new_context_with_model"),
                free: load_symbol!(lib, "free"),
                n_vocab: load_symbol!(lib, "n_vocab"),
                tokenize: load_symbol!(lib, "tokenize"),
                token_get_text: load_symbol!(lib, "token_get_text"),
                token_eos: load_symbol!(lib, "token_eos"),
                batch_init: load_symbol!(lib, "batch_init"),
                batch_free: load_symbol!(lib, "batch_free"),
                decode: load_symbol!(lib, "decode"),
                get_logits: load_symbol!(lib, "get_logits"),
                get_logits_ith: load_symbol!(lib, "get_logits_ith"),
                kv_cache_seq_rm: load_symbol!(lib, "kv_cache_seq_rm"),
                sample_token_greedy: load_symbol!(lib, "sample_token_greedy"),
                sample_token: load_symbol!(lib, "sample_token"),
                log_set: load_symbol!(lib, "log_set"),
                _lib: lib,
            })
        }
    }
}

unsafe impl Send for LlamaLib {}
unsafe impl Sync for LlamaLib {}
