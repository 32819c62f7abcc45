use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::stream::Stream;

use crate::error::Error;

/// size hint for a streaming request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// total byte count known up front.
    Sized(u64),
    /// unknown length. the request is framed with chunked transfer encoding.
    Stream,
}

/// request body attached to a dispatch.
pub enum Body {
    /// no body bytes.
    Empty,
    /// a single pre allocated buffer.
    Bytes(Bytes),
    /// lazy, finite, non restartable chunk source with back-pressure.
    Stream(BoxBody),
}

impl Body {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// declared byte count when knowable from the body alone.
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(b) => Some(b.len() as u64),
            Self::Stream(b) => match b.size {
                BodySize::Sized(n) => Some(n),
                BodySize::Stream => None,
            },
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(b) => write!(f, "Body::Bytes({})", b.len()),
            Self::Stream(b) => write!(f, "Body::Stream({:?})", b.size),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&'static str> for Body {
    fn from(b: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(b.as_bytes()))
    }
}

/// boxed body stream with a size hint.
pub struct BoxBody {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>,
    size: BodySize,
}

impl BoxBody {
    pub fn new<S>(stream: S, size: BodySize) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            size,
        }
    }

    pub fn size(&self) -> BodySize {
        self.size
    }

    pub(crate) fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, Error>>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl Stream for BoxBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.as_mut().poll_next(cx)
    }
}

/// stream yielding one buffer and then ending.
pub struct Once(Option<Bytes>);

impl Once {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(Some(bytes.into()))
    }
}

impl Stream for Once {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().0.take().map(Ok))
    }
}
