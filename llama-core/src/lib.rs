//! Asynchronous, message-driven wrapper around a native GGML-style LLM
//! inference engine.
//!
//! A single background worker thread owns every native handle (model
//! weights, inference contexts, the KV cache) and serializes all calls into
//! it. Callers talk to the worker through [`client::Client`], which issues
//! control messages and correlates their responses; long-running calls
//! (ingest, generate) stream events back and support cooperative
//! cancellation via a handshake channel.
//!
//! ```no_run
//! # async fn example() -> llama_core::error::Result<()> {
//! use llama_core::client::Client;
//! use llama_core::model_params::ModelParams;
//! use llama_core::context_params::ContextParams;
//! use llama_core::sampler::Greedy;
//! use tokio_stream::StreamExt;
//!
//! let client = Client::spawn("/path/to/libinference.so")?;
//! let model = client.load_model("model.gguf", ModelParams::new(), None).await?;
//! let ctx = client.new_context(model, ContextParams::new()).await?;
//! client.tokenize(ctx, "hello").await?;
//!
//! let mut ingest = client.ingest(ctx).await?;
//! while let Some(event) = ingest.events.next().await {
//!     event?;
//! }
//!
//! let mut gen = client.generate(ctx, vec![Box::new(Greedy)]).await?;
//! while let Some(event) = gen.events.next().await {
//!     event?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod candidates;
pub mod client;
pub mod context_params;
pub mod context_state;
pub mod error;
pub mod ingest;
pub mod model_params;
pub mod native;
pub mod sampler;
pub mod token;
pub mod worker;

pub use client::Client;
pub use error::{Error, Result};
