//! The isolated worker: a dedicated OS thread that is the sole owner of
//! every native handle, driven by a control queue and reporting back on
//! per-call response channels.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::context_params::ContextParams;
use crate::context_state::ContextState;
use crate::error::{Error, Result};
use crate::ingest::{self, CancelSignal, IngestOutcome};
use crate::model_params::ModelParams;
use crate::native::{NativeLib, NativeModel};
use crate::sampler::{Sampler, SamplerChain};
use crate::token::{Token, TokenId};

pub type ModelId = u64;
pub type ContextId = u64;
pub type RequestId = u32;

/// The caller's end of a streaming call's cancellation handshake.
#[derive(Clone)]
pub struct CancelHandle {
    tx: mpsc::Sender<()>,
}

impl CancelHandle {
    /// Requests cancellation. A best-effort send: if the worker has already
    /// finished the call, this is a silent no-op.
    pub async fn cancel(&self) {
        let _ = self.tx.send(()).await;
    }

    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }
}

struct ChannelCancel {
    rx: mpsc::Receiver<()>,
    cancelled: bool,
}

impl ChannelCancel {
    fn new() -> (CancelHandle, Self) {
        let (tx, rx) = mpsc::channel(1);
        (CancelHandle { tx }, Self { rx, cancelled: false })
    }
}

impl CancelSignal for ChannelCancel {
    fn is_cancelled(&mut self) -> bool {
        if !self.cancelled {
            if self.rx.try_recv().is_ok() {
                self.cancelled = true;
            }
        }
        self.cancelled
    }
}

/// One event in an ingest call's response stream.
pub enum IngestEvent {
    Handshake(CancelHandle),
    Done,
    Error(Error),
}

/// One event in a generate call's response stream.
pub enum GenerateEvent {
    Handshake(CancelHandle),
    Token(Token),
    Done,
    Error(Error),
}

/// A control message sent to the worker. Every variant carries the request
/// id implicitly via its reply/event channel — responses are correlated by
/// which channel they arrive on, not by an explicit id field, since that is
/// how the oneshot/mpsc primitives already work.
pub enum Control {
    LoadModel {
        id: RequestId,
        path: String,
        params: ModelParams,
        progress_tx: Option<mpsc::UnboundedSender<(RequestId, f32)>>,
        reply_tx: oneshot::Sender<Result<ModelId>>,
    },
    FreeModel {
        model: ModelId,
        reply_tx: oneshot::Sender<Result<()>>,
    },
    NewContext {
        model: ModelId,
        params: ContextParams,
        reply_tx: oneshot::Sender<Result<ContextId>>,
    },
    FreeContext {
        ctx: ContextId,
        reply_tx: oneshot::Sender<Result<()>>,
    },
    Tokenize {
        ctx: ContextId,
        text: String,
        reply_tx: oneshot::Sender<Result<(Vec<TokenId>, usize)>>,
    },
    Edit {
        ctx: ContextId,
        new_length: Option<usize>,
        reply_tx: oneshot::Sender<Result<()>>,
    },
    Ingest {
        ctx: ContextId,
        events_tx: mpsc::Sender<IngestEvent>,
    },
    Generate {
        ctx: ContextId,
        samplers: Vec<Box<dyn Sampler>>,
        events_tx: mpsc::Sender<GenerateEvent>,
    },
    Exit {
        reply_tx: oneshot::Sender<()>,
    },
}

/// Where to deliver progress fractions for the `LoadModel` call currently
/// in flight. Set synchronously around `load_model_from_file` and cleared
/// immediately after; the native callback only ever re-enters on this same
/// thread, synchronously, during that one call, so there is never more than
/// one sink live at a time.
thread_local! {
    static PROGRESS_SINK: RefCell<Option<mpsc::UnboundedSender<(RequestId, f32)>>> =
        RefCell::new(None);
}

const _: () = assert!(
    std::mem::size_of::<RequestId>() <= std::mem::size_of::<*mut c_void>(),
    "a 32-bit request id must fit in a pointer's address bits on this target"
);

/// Recovers the request id smuggled as the callback's `user_data` bit
/// pattern and forwards the progress fraction tagged with it.
unsafe extern "C" fn progress_trampoline(progress: f32, user_data: *mut c_void) -> bool {
    let id = user_data as usize as RequestId;
    PROGRESS_SINK.with(|sink| {
        if let Some(tx) = sink.borrow().as_ref() {
            let _ = tx.send((id, progress));
        }
    });
    true
}

/// Forwards native log messages into `tracing`, tagged by the native
/// library's own severity. An unrecognized severity ordinal is logged as a
/// warning rather than dropped silently.
unsafe extern "C" fn native_log_trampoline(
    level: i32,
    text: *const std::os::raw::c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let msg = unsafe { std::ffi::CStr::from_ptr(text) }.to_string_lossy();
    match crate::native::LogLevel::try_from(level) {
        Ok(crate::native::LogLevel::Error) => tracing::error!(target: "llama_core::native", "{msg}"),
        Ok(crate::native::LogLevel::Warn) => tracing::warn!(target: "llama_core::native", "{msg}"),
        Ok(crate::native::LogLevel::Info) => tracing::info!(target: "llama_core::native", "{msg}"),
        Ok(crate::native::LogLevel::Debug) => tracing::debug!(target: "llama_core::native", "{msg}"),
        Ok(crate::native::LogLevel::Trace) => tracing::trace!(target: "llama_core::native", "{msg}"),
        Err(e) => tracing::warn!(target: "llama_core::native", error = %e, "{msg}"),
    }
}

struct ModelEntry {
    native: Arc<NativeModel>,
}

/// Owns every native handle and the context/model registries. Lives for the
/// life of one background thread; nothing here is `Send` across threads
/// except by the thread itself terminating.
pub struct Worker {
    lib: Arc<NativeLib>,
    models: HashMap<ModelId, ModelEntry>,
    contexts: HashMap<ContextId, ContextState>,
    context_model: HashMap<ContextId, ModelId>,
    contexts_for_model: HashMap<ModelId, HashSet<ContextId>>,
    next_model_id: ModelId,
    next_context_id: ContextId,
    cmd_rx: mpsc::Receiver<Control>,
}

/// A handle to a running worker's inbound control queue.
#[derive(Clone)]
pub struct WorkerHandle {
    pub(crate) cmd_tx: mpsc::Sender<Control>,
}

/// Spawns the worker on a dedicated OS thread and returns a handle to its
/// control queue. `library_path` is opened once, on the worker thread, via
/// [`NativeLib::load`].
pub fn spawn(library_path: impl AsRef<std::path::Path>) -> Result<WorkerHandle> {
    let lib = NativeLib::load(library_path)?;
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let handle = WorkerHandle { cmd_tx };

    std::thread::Builder::new()
        .name("llama-core-worker".into())
        .spawn(move || {
            lib.backend_init(false);
            lib.set_log_callback(Some(native_log_trampoline as llama_sys::LogCallback));
            let mut worker = Worker {
                lib,
                models: HashMap::new(),
                contexts: HashMap::new(),
                context_model: HashMap::new(),
                contexts_for_model: HashMap::new(),
                next_model_id: 1,
                next_context_id: 1,
                cmd_rx,
            };
            worker.run();
        })
        .expect("failed to spawn worker thread");

    Ok(handle)
}

impl Worker {
    fn run(&mut self) {
        while let Some(cmd) = self.cmd_rx.blocking_recv() {
            if self.handle_command(cmd) {
                break;
            }
        }
        self.lib.backend_free();
    }

    /// Returns `true` iff the worker should terminate after this command.
    fn handle_command(&mut self, cmd: Control) -> bool {
        match cmd {
            Control::Exit { reply_tx } => {
                let _ = reply_tx.send(());
                return true;
            }
            Control::LoadModel {
                id,
                path,
                params,
                progress_tx,
                reply_tx,
            } => {
                let result = self.handle_load_model(id, &path, &params, progress_tx);
                let _ = reply_tx.send(result);
            }
            Control::FreeModel { model, reply_tx } => {
                let _ = reply_tx.send(self.handle_free_model(model));
            }
            Control::NewContext {
                model,
                params,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.handle_new_context(model, params));
            }
            Control::FreeContext { ctx, reply_tx } => {
                let _ = reply_tx.send(self.handle_free_context(ctx));
            }
            Control::Tokenize { ctx, text, reply_tx } => {
                let _ = reply_tx.send(self.handle_tokenize(ctx, &text));
            }
            Control::Edit {
                ctx,
                new_length,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.handle_edit(ctx, new_length));
            }
            Control::Ingest { ctx, events_tx } => {
                self.handle_ingest(ctx, events_tx);
            }
            Control::Generate {
                ctx,
                samplers,
                events_tx,
            } => {
                self.handle_generate(ctx, samplers, events_tx);
            }
        }
        false
    }

    fn handle_load_model(
        &mut self,
        id: RequestId,
        path: &str,
        params: &ModelParams,
        progress_tx: Option<mpsc::UnboundedSender<(RequestId, f32)>>,
    ) -> Result<ModelId> {
        PROGRESS_SINK.with(|sink| *sink.borrow_mut() = progress_tx);
        let callback = Some(progress_trampoline as llama_sys::ProgressCallback);
        let user_data = id as usize as *mut c_void;
        let result = NativeModel::load_from_file(&self.lib, path, params, callback, user_data);
        PROGRESS_SINK.with(|sink| *sink.borrow_mut() = None);

        let native = result?;
        let id = self.next_model_id;
        self.next_model_id += 1;
        self.models.insert(
            id,
            ModelEntry {
                native: Arc::new(native),
            },
        );
        self.contexts_for_model.insert(id, HashSet::new());
        info!(model_id = id, "model loaded");
        Ok(id)
    }

    fn handle_free_model(&mut self, model: ModelId) -> Result<()> {
        let live = self
            .contexts_for_model
            .get(&model)
            .map(|s| s.len())
            .unwrap_or(0);
        if live > 0 {
            return Err(Error::HandleStillReferenced {
                model,
                live_contexts: live,
            });
        }
        if self.models.remove(&model).is_none() {
            return Err(Error::UnknownHandle(model));
        }
        self.contexts_for_model.remove(&model);
        Ok(())
    }

    fn handle_new_context(&mut self, model: ModelId, params: ContextParams) -> Result<ContextId> {
        let entry = self
            .models
            .get(&model)
            .ok_or(Error::UnknownHandle(model))?;
        let state = ContextState::new(&entry.native, params)?;
        let id = self.next_context_id;
        self.next_context_id += 1;
        self.contexts.insert(id, state);
        self.context_model.insert(id, model);
        self.contexts_for_model.entry(model).or_default().insert(id);
        Ok(id)
    }

    fn handle_free_context(&mut self, ctx: ContextId) -> Result<()> {
        if self.contexts.remove(&ctx).is_none() {
            return Err(Error::UnknownHandle(ctx));
        }
        if let Some(model) = self.context_model.remove(&ctx) {
            if let Some(set) = self.contexts_for_model.get_mut(&model) {
                set.remove(&ctx);
            }
        }
        Ok(())
    }

    fn handle_tokenize(&mut self, ctx: ContextId, text: &str) -> Result<(Vec<TokenId>, usize)> {
        let model_id = *self.context_model.get(&ctx).ok_or(Error::UnknownHandle(ctx))?;
        let model = Arc::clone(&self.models.get(&model_id).unwrap().native);
        let state = self.contexts.get_mut(&ctx).ok_or(Error::UnknownHandle(ctx))?;
        let start = state.tokenize(&model, text)?;
        Ok((state.tokens()[start..].to_vec(), start))
    }

    fn handle_edit(&mut self, ctx: ContextId, new_length: Option<usize>) -> Result<()> {
        let state = self.contexts.get_mut(&ctx).ok_or(Error::UnknownHandle(ctx))?;
        state.edit(new_length)
    }

    fn handle_ingest(&mut self, ctx: ContextId, events_tx: mpsc::Sender<IngestEvent>) {
        let (handle, mut cancel) = ChannelCancel::new();
        if events_tx.blocking_send(IngestEvent::Handshake(handle)).is_err() {
            return;
        }
        let state = match self.contexts.get_mut(&ctx) {
            Some(s) => s,
            None => {
                let _ = events_tx.blocking_send(IngestEvent::Error(Error::UnknownHandle(ctx)));
                return;
            }
        };
        match ingest::run_ingest(state, &mut cancel) {
            Ok(IngestOutcome::Done) => {
                let _ = events_tx.blocking_send(IngestEvent::Done);
            }
            Ok(IngestOutcome::Cancelled) => {
                debug!(ctx, "ingest cancelled");
            }
            Err(e) => {
                let _ = events_tx.blocking_send(IngestEvent::Error(e));
            }
        }
    }

    fn handle_generate(
        &mut self,
        ctx: ContextId,
        samplers: Vec<Box<dyn Sampler>>,
        events_tx: mpsc::Sender<GenerateEvent>,
    ) {
        let (handle, mut cancel) = ChannelCancel::new();
        if events_tx.blocking_send(GenerateEvent::Handshake(handle)).is_err() {
            return;
        }
        if let Err(e) = self.run_generate_loop(ctx, samplers, &events_tx, &mut cancel) {
            let _ = events_tx.blocking_send(GenerateEvent::Error(e));
        }
    }

    fn run_generate_loop(
        &mut self,
        ctx: ContextId,
        samplers: Vec<Box<dyn Sampler>>,
        events_tx: &mpsc::Sender<GenerateEvent>,
        cancel: &mut ChannelCancel,
    ) -> Result<()> {
        let state = self.contexts.get_mut(&ctx).ok_or(Error::UnknownHandle(ctx))?;
        if state.needs_ingesting() {
            return Err(Error::StateViolation(
                "generate called while tokens are pending ingest".into(),
            ));
        }

        let mut chain = SamplerChain::new(samplers)?;
        chain.allocate()?;
        let result = self.run_generate_steps(ctx, &mut chain, events_tx, cancel);
        chain.free();
        match result? {
            true => {}
            false => {
                let _ = events_tx.blocking_send(GenerateEvent::Done);
            }
        }
        Ok(())
    }

    /// Runs the per-token loop; returns `Ok(true)` if cancellation ended it
    /// early, `Ok(false)` if it ended via EOS or hitting context size.
    fn run_generate_steps(
        &mut self,
        ctx: ContextId,
        chain: &mut SamplerChain,
        events_tx: &mpsc::Sender<GenerateEvent>,
        cancel: &mut ChannelCancel,
    ) -> Result<bool> {
        loop {
            let state = self.contexts.get_mut(&ctx).ok_or(Error::UnknownHandle(ctx))?;
            if state.logits_len() >= state.context_size() {
                return Ok(false);
            }

            let row = state
                .last_logits_row()
                .ok_or_else(|| {
                    Error::StateViolation("generate called with no ingested logits".into())
                })?
                .to_vec();
            state.candidates.load_from_logits(&row);

            let tokens = state.tokens().to_vec();
            let token = chain.run(&mut state.native, &mut state.candidates, &tokens)?;

            if cancel.is_cancelled() {
                return Ok(true);
            }

            state.push_token(token.id);
            if events_tx.blocking_send(GenerateEvent::Token(token.clone())).is_err() {
                return Ok(true);
            }

            let eos = state.native.token_eos();
            if token.id == eos {
                return Ok(false);
            }

            let pos = state.tokens_len() - 1;
            state.batch.clear();
            state.batch.push(token.id, pos as i32, crate::token::SEQ_ID, true)?;
            let raw_batch = state.batch.as_raw();
            state.native.decode(raw_batch)?;
            let logits = state.native.logits_ith(0).to_vec();
            state.push_logits_row(logits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use tracing_test::traced_test;

    #[test]
    fn cancel_handshake_starts_uncancelled() {
        let (_, mut cancel) = ChannelCancel::new();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_handle_marks_channel_cancel() {
        let (handle, mut cancel) = ChannelCancel::new();
        handle.cancel().await;
        assert!(cancel.is_cancelled());
    }

    #[traced_test]
    #[test]
    fn native_log_trampoline_forwards_known_level_to_tracing() {
        let msg = CString::new("loading tensors").unwrap();
        unsafe { native_log_trampoline(2, msg.as_ptr(), std::ptr::null_mut()) };
        assert!(logs_contain("loading tensors"));
    }

    #[traced_test]
    #[test]
    fn native_log_trampoline_warns_on_unknown_level() {
        let msg = CString::new("mystery severity").unwrap();
        unsafe { native_log_trampoline(99, msg.as_ptr(), std::ptr::null_mut()) };
        assert!(logs_contain("mystery severity"));
        assert!(logs_contain("unknown log level"));
    }
}
