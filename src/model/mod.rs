//! Model endpoint client.
//!
//! - [`types`]: request payload and decoded response shapes
//! - [`stream`]: line splitting for streamed bodies
//! - [`retry`]: retry policy with exponential backoff
//! - [`dispatcher`]: HTTP transport and the retrying batch dispatcher

pub mod dispatcher;
pub mod retry;
pub mod stream;
pub mod types;

pub use dispatcher::{
    is_stream_content_type, DispatchOutcome, HttpModelClient, ModelDispatcher, ModelTransport,
    ResponseMode, TransportReply,
};
pub use retry::{Retried, RetryError, RetryPolicy, Retryable};
pub use stream::LineBuffer;
pub use types::{BatchPayload, CommentPayload, ModelResponse, ModelResult, StreamLine};
