//! WebSocket-as-byte-stream adapter.
//!
//! SSH tunnels carry raw bytes as binary WebSocket frames. Wrapping the
//! socket in [`WsByteStream`] gives both tunnel ends an ordinary
//! `AsyncRead + AsyncWrite`, so the relay code is a plain byte copy and does
//! not care whether the other end is a TCP socket, a server-side socket, or
//! a client-side one.
//!
//! Text frames are treated as data, ping/pong as transparent control
//! traffic, and a close frame (or stream end) as EOF.

use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::{Sink, TryStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a received frame means to the byte stream.
#[derive(Debug)]
pub enum WsPayload {
    /// Application bytes.
    Data(Vec<u8>),
    /// Transparent control traffic (ping/pong); invisible to the reader.
    Control,
    /// Orderly end of stream.
    Close,
}

/// The minimal surface the adapter needs from a WebSocket message type.
pub trait WsFrame: Sized {
    /// A binary data frame carrying `data`.
    fn binary(data: Vec<u8>) -> Self;
    /// Classify a received frame for the byte stream.
    fn into_payload(self) -> WsPayload;
}

impl WsFrame for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        axum::extract::ws::Message::Binary(data)
    }

    fn into_payload(self) -> WsPayload {
        use axum::extract::ws::Message;
        match self {
            Message::Binary(data) => WsPayload::Data(data),
            Message::Text(text) => WsPayload::Data(text.into_bytes()),
            Message::Ping(_) | Message::Pong(_) => WsPayload::Control,
            Message::Close(_) => WsPayload::Close,
        }
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        tokio_tungstenite::tungstenite::Message::Binary(data)
    }

    fn into_payload(self) -> WsPayload {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Binary(data) => WsPayload::Data(data),
            Message::Text(text) => WsPayload::Data(text.into_bytes()),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => WsPayload::Control,
            Message::Close(_) => WsPayload::Close,
        }
    }
}

/// Adapts a `Stream + Sink` of WebSocket messages into a byte stream.
#[derive(Debug)]
pub struct WsByteStream<S, M> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
    _frame: PhantomData<fn() -> M>,
}

impl<S, M> WsByteStream<S, M> {
    /// Wrap a WebSocket.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            _frame: PhantomData,
        }
    }

    /// Unwrap the underlying socket.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn to_io<E: Into<BoxError>>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.into())
}

impl<S, M> AsyncRead for WsByteStream<S, M>
where
    S: TryStream<Ok = M> + Unpin,
    S::Error: Into<BoxError>,
    M: WsFrame,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.buf.len() {
                let n = std::cmp::min(buf.remaining(), this.buf.len() - this.pos);
                buf.put_slice(&this.buf[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.buf.len() {
                    this.buf.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).try_poll_next(cx)) {
                Some(Ok(frame)) => match frame.into_payload() {
                    WsPayload::Data(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        this.buf = data;
                        this.pos = 0;
                    }
                    WsPayload::Control => continue,
                    WsPayload::Close => return Poll::Ready(Ok(())),
                },
                Some(Err(err)) => return Poll::Ready(Err(to_io(err))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S, M> AsyncWrite for WsByteStream<S, M>
where
    S: Sink<M> + Unpin,
    S::Error: Into<BoxError>,
    M: WsFrame,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(err) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(to_io(err)));
        }
        Pin::new(&mut this.inner)
            .start_send(M::binary(data.to_vec()))
            .map_err(to_io)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx).map_err(to_io)
    }
}
