//! The public client façade: an async request-response API layered over the
//! worker's control queue.

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::context_params::ContextParams;
use crate::error::{Error, Result};
use crate::model_params::ModelParams;
use crate::sampler::Sampler;
use crate::token::{Token, TokenId};
use crate::worker::{
    CancelHandle, Control, GenerateEvent, IngestEvent, ModelId, RequestId, WorkerHandle,
};

/// One event of a streaming `ingest` call.
#[derive(Debug)]
pub enum IngestStreamEvent {
    Token,
    Done,
}

/// One event of a streaming `generate` call.
#[derive(Debug)]
pub enum GenerateStreamEvent {
    Token(Token),
    Done,
}

/// A handle to an in-flight streaming call, bundling its event stream with
/// the means to cancel it.
pub struct Stream<T> {
    pub events: ReceiverStream<T>,
    pub cancel: CancelHandle,
}

/// Async, clonable handle to a running worker. Every call mints a fresh
/// request id internally; callers never see it, since correlation is
/// expressed by which channel a response arrives on rather than by an
/// explicit id field.
#[derive(Clone)]
pub struct Client {
    worker: WorkerHandle,
}

impl Client {
    pub fn new(worker: WorkerHandle) -> Self {
        Self { worker }
    }

    /// Spawns a worker backed by the native library at `library_path` and
    /// wraps it in a client.
    pub fn spawn(library_path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(crate::worker::spawn(library_path)?))
    }

    /// Loads a model, returning its handle once loading completes.
    /// `on_progress`, if given, receives fraction-complete events as the
    /// native loader reports them.
    pub async fn load_model(
        &self,
        path: impl Into<String>,
        params: ModelParams,
        on_progress: Option<mpsc::UnboundedSender<(RequestId, f32)>>,
    ) -> Result<ModelId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = random_request_id();
        self.worker
            .cmd_tx
            .send(Control::LoadModel {
                id,
                path: path.into(),
                params,
                progress_tx: on_progress,
                reply_tx,
            })
            .await
            .map_err(|_| Error::UnknownHandle(0))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(0))?
    }

    pub async fn free_model(&self, model: ModelId) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::FreeModel { model, reply_tx })
            .await
            .map_err(|_| Error::UnknownHandle(model))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(model))?
    }

    pub async fn new_context(&self, model: ModelId, params: ContextParams) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::NewContext {
                model,
                params,
                reply_tx,
            })
            .await
            .map_err(|_| Error::UnknownHandle(model))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(model))?
    }

    pub async fn free_context(&self, ctx: u64) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::FreeContext { ctx, reply_tx })
            .await
            .map_err(|_| Error::UnknownHandle(ctx))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(ctx))?
    }

    pub async fn tokenize(&self, ctx: u64, text: impl Into<String>) -> Result<(Vec<TokenId>, usize)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::Tokenize {
                ctx,
                text: text.into(),
                reply_tx,
            })
            .await
            .map_err(|_| Error::UnknownHandle(ctx))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(ctx))?
    }

    pub async fn edit(&self, ctx: u64, new_length: Option<usize>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::Edit {
                ctx,
                new_length,
                reply_tx,
            })
            .await
            .map_err(|_| Error::UnknownHandle(ctx))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(ctx))?
    }

    /// Starts an ingest call. Awaits only the handshake; the returned
    /// stream yields `Token`/`Done` events (or fails on the stream's first
    /// poll if ingest itself errors).
    pub async fn ingest(&self, ctx: u64) -> Result<Stream<Result<IngestStreamEvent>>> {
        let (events_tx, events_rx) = mpsc::channel(16);
        self.worker
            .cmd_tx
            .send(Control::Ingest { ctx, events_tx })
            .await
            .map_err(|_| Error::UnknownHandle(ctx))?;
        translate_ingest_stream(events_rx).await
    }

    /// Starts a generate call with the given sampler chain. Fails fast with
    /// [`Error::StateViolation`] style errors surfaced through the stream
    /// rather than this function, matching the worker's own error path.
    pub async fn generate(
        &self,
        ctx: u64,
        samplers: Vec<Box<dyn Sampler>>,
    ) -> Result<Stream<Result<GenerateStreamEvent>>> {
        let (events_tx, events_rx) = mpsc::channel(16);
        self.worker
            .cmd_tx
            .send(Control::Generate {
                ctx,
                samplers,
                events_tx,
            })
            .await
            .map_err(|_| Error::UnknownHandle(ctx))?;
        translate_generate_stream(events_rx).await
    }

    /// Requests worker shutdown and waits for it to acknowledge.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .cmd_tx
            .send(Control::Exit { reply_tx })
            .await
            .map_err(|_| Error::UnknownHandle(0))?;
        reply_rx.await.map_err(|_| Error::UnknownHandle(0))
    }
}

async fn translate_ingest_stream(
    mut events_rx: mpsc::Receiver<IngestEvent>,
) -> Result<Stream<Result<IngestStreamEvent>>> {
    let cancel = match events_rx.recv().await {
        Some(IngestEvent::Handshake(h)) => h,
        Some(IngestEvent::Error(e)) => return Err(e),
        Some(IngestEvent::Done) | None => return Err(Error::UnknownHandle(0)),
    };
    let (out_tx, out_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let translated = match event {
                IngestEvent::Handshake(_) => continue,
                IngestEvent::Done => Ok(IngestStreamEvent::Done),
                IngestEvent::Error(e) => Err(e),
            };
            if out_tx.send(translated).await.is_err() {
                break;
            }
        }
    });
    Ok(Stream {
        events: ReceiverStream::new(out_rx),
        cancel,
    })
}

async fn translate_generate_stream(
    mut events_rx: mpsc::Receiver<GenerateEvent>,
) -> Result<Stream<Result<GenerateStreamEvent>>> {
    let cancel = match events_rx.recv().await {
        Some(GenerateEvent::Handshake(h)) => h,
        Some(GenerateEvent::Error(e)) => return Err(e),
        Some(GenerateEvent::Token(_)) | Some(GenerateEvent::Done) | None => {
            return Err(Error::UnknownHandle(0));
        }
    };
    let (out_tx, out_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let translated = match event {
                GenerateEvent::Handshake(_) => continue,
                GenerateEvent::Token(t) => Ok(GenerateStreamEvent::Token(t)),
                GenerateEvent::Done => Ok(GenerateStreamEvent::Done),
                GenerateEvent::Error(e) => Err(e),
            };
            if out_tx.send(translated).await.is_err() {
                break;
            }
        }
    });
    Ok(Stream {
        events: ReceiverStream::new(out_rx),
        cancel,
    })
}

/// Mints a request id uniformly at random in `1..=u32::MAX`; `0` is
/// reserved for the worker's own initial handshake response.
fn random_request_id() -> RequestId {
    rand::random::<u32>().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn random_request_id_is_never_zero() {
        for _ in 0..1000 {
            assert_ne!(random_request_id(), 0);
        }
    }

    #[tokio::test]
    async fn ingest_stream_translates_done_after_handshake() {
        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, _cancel_rx) = mpsc::channel(1);
        tx.send(IngestEvent::Handshake(CancelHandle::for_test(cancel_tx)))
            .await
            .unwrap();
        tx.send(IngestEvent::Done).await.unwrap();
        drop(tx);

        let mut stream = translate_ingest_stream(rx).await.unwrap();
        match stream.events.next().await {
            Some(Ok(IngestStreamEvent::Done)) => {}
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(stream.events.next().await.is_none());
    }

    #[tokio::test]
    async fn ingest_stream_without_handshake_is_an_error() {
        let (tx, rx) = mpsc::channel(4);
        drop(tx);
        assert!(translate_ingest_stream(rx).await.is_err());
    }

    #[tokio::test]
    async fn generate_stream_translates_tokens_then_done() {
        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, _cancel_rx) = mpsc::channel(1);
        tx.send(GenerateEvent::Handshake(CancelHandle::for_test(cancel_tx)))
            .await
            .unwrap();
        tx.send(GenerateEvent::Token(Token::new(1, "hi"))).await.unwrap();
        tx.send(GenerateEvent::Done).await.unwrap();
        drop(tx);

        let mut stream = translate_generate_stream(rx).await.unwrap();
        match stream.events.next().await {
            Some(Ok(GenerateStreamEvent::Token(t))) => assert_eq!(t.text, "hi"),
            other => panic!("expected Token, got {other:?}"),
        }
        match stream.events.next().await {
            Some(Ok(GenerateStreamEvent::Done)) => {}
            other => panic!("expected Done, got {other:?}"),
        }
    }
}
