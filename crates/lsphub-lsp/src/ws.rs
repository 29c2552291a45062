use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;

/// Adapts a message-oriented WebSocket into the byte stream the framed
/// JSON-RPC codec expects: message payloads are concatenated, with partial
/// reads buffered.
pub(crate) struct WsByteStream<S> {
    inner: S,
    read_buf: Vec<u8>,
}

impl<S> WsByteStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.drain(..n);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Text(text) => this.read_buf.extend_from_slice(text.as_bytes()),
                    Message::Binary(bytes) => this.read_buf.extend_from_slice(&bytes),
                    // Pings/pongs are answered by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    Message::Close(_) => return Poll::Ready(Ok(())),
                },
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
            Poll::Pending => return Poll::Pending,
        }

        // LSP frames are UTF-8 (ASCII headers + JSON body), sent as text
        // messages the way lsp-ws-proxy style servers expect.
        let message = match std::str::from_utf8(data) {
            Ok(text) => Message::text(text.to_string()),
            Err(_) => Message::binary(data.to_vec()),
        };
        match Pin::new(&mut this.inner).start_send(message) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(err) => Poll::Ready(Err(io::Error::other(err))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn concatenates_message_payloads_and_buffers_partial_reads() {
        let messages: Vec<Result<Message, tokio_tungstenite::tungstenite::Error>> = vec![
            Ok(Message::text("Content-Len".to_string())),
            Ok(Message::text("gth: 2\r\n\r\n{}".to_string())),
        ];
        let mut adapter = WsByteStream::new(stream::iter(messages));

        let mut out = Vec::new();
        let mut chunk = [0u8; 4];
        loop {
            let n = adapter.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"Content-Length: 2\r\n\r\n{}");
    }

    #[tokio::test]
    async fn close_message_reads_as_eof() {
        let messages: Vec<Result<Message, tokio_tungstenite::tungstenite::Error>> =
            vec![Ok(Message::Close(None))];
        let mut adapter = WsByteStream::new(stream::iter(messages));
        let mut buf = [0u8; 8];
        assert_eq!(adapter.read(&mut buf).await.unwrap(), 0);
    }
}
