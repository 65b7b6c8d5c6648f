use std::pin::Pin;

/// A boxed async stream, used for the model's token stream.
///
/// The orchestration loop consumes one of these per turn: each item is
/// an incremental text fragment; end-of-stream completes the turn.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;
