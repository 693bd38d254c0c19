//! Acceptor-side CompID routing.
//!
//! A single `TcpListener` can serve several registered sessions that share one port. Each inbound
//! connection's Logon(35=A) frame is peeked off the wire, its SenderCompID(49)/TargetCompID(56)
//! pair is matched against the acceptor's registered [`RouteKey`]s, and the stream (with the
//! Logon frame still to be replayed) is handed to the matching session's [`super::spin_session`].
//! A connection whose CompID pair matches nothing registered is rejected with a Reject(35=3) and
//! closed, per the acceptor-multiplexing scenario this crate adds beyond the single-session
//! acceptor the engine was grown from.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::fix::decode::{self, ParserCallback};
use crate::fix::encode::MessageBuilder;
use crate::fix::generated::{MsgType, Tags};
use crate::fix::mem::MsgBuf;
use crate::fix::stream::{read_header, HeaderBuf, Lingerable, TryRead, PEEK_LEN};
use crate::fix::SessionError;

/// The SenderCompID/TargetCompID pair (as seen from the acceptor, i.e. the *inbound* 49/56) that
/// identifies which registered session a connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey {
    pub(crate) sender_comp_id: Vec<u8>,
    pub(crate) target_comp_id: Vec<u8>,
}

/// A byte stream that replays a prefix it was constructed with before falling through to the
/// live socket. Used to hand a connection to [`super::spin_session`] after the router has already
/// consumed the Logon frame off the wire to inspect it.
pub(crate) struct PeekedStream<S> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        PeekedStream {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: TryRead> TryRead for PeekedStream<S> {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = std::cmp::min(remaining.len(), buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Ok(n);
        }
        self.inner.try_read(buf)
    }
}

impl<S: Lingerable> Lingerable for PeekedStream<S> {
    fn set_linger_zero(&mut self) {
        self.inner.set_linger_zero();
    }
}

#[derive(Default)]
struct RouteParserCallback<'a> {
    msg_type: char,
    sender_comp_id: Option<&'a [u8]>,
    target_comp_id: Option<&'a [u8]>,
}

impl<'a> ParserCallback<'a> for RouteParserCallback<'a> {
    fn header(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError> {
        match key.try_into() {
            Ok(Tags::MsgType) if value.len() == 1 => self.msg_type = value[0] as char,
            Ok(Tags::SenderCompID) => self.sender_comp_id = Some(value),
            Ok(Tags::TargetCompID) => self.target_comp_id = Some(value),
            _ => (),
        }
        Ok(true)
    }
    fn body(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(false)
    }
    fn trailer(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(false)
    }
    fn sequence_num(&self) -> u32 {
        0
    }
}

/// Owns the `TcpListener` for one port shared by any number of registered sessions.
pub(crate) struct AcceptorRouter {
    listener: TcpListener,
}

/// The outcome of peeking one inbound connection's Logon frame.
pub(crate) enum Routed {
    /// The CompID pair matched a registered session; hand this stream to its `spin_session`.
    Matched(RouteKey, PeekedStream<TcpStream>),
    /// No registered session answers to this CompID pair; the connection has already been
    /// rejected and closed.
    Unmatched(RouteKey),
}

impl AcceptorRouter {
    pub(crate) async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        Ok(AcceptorRouter { listener })
    }

    /// Accepts the next inbound connection, peeks its Logon frame, and matches it against
    /// `known`. On no match, writes a `Reject(35=3)` with `Text="CompID mismatch"` and closes.
    pub(crate) async fn accept(&self, known: &HashSet<RouteKey>) -> io::Result<Routed> {
        let (mut stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        let (key, msg_bytes) = match peek_logon(&mut stream).await {
            Ok(v) => v,
            Err(_) => {
                let _ = stream.shutdown().await;
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad logon frame"));
            }
        };

        if known.contains(&key) {
            Ok(Routed::Matched(key, PeekedStream::new(msg_bytes, stream)))
        } else {
            reject_and_close(&mut stream).await;
            Ok(Routed::Unmatched(key))
        }
    }
}

async fn peek_logon(stream: &mut TcpStream) -> Result<(RouteKey, Vec<u8>), SessionError> {
    let mut header: HeaderBuf<{ PEEK_LEN }> = HeaderBuf::new();
    read_header(stream, &mut header).await?;
    let body_len = decode::parse_header(header.filled())?;

    let header_len = header.filled().len();
    let mut msg_vec = vec![0u8; header_len + body_len];
    msg_vec[..header_len].copy_from_slice(header.filled());
    tokio::io::AsyncReadExt::read_exact(stream, &mut msg_vec[header_len..]).await?;

    let mut cb = RouteParserCallback::default();
    decode::parse(&msg_vec[..], &mut cb)?;

    let key = RouteKey {
        sender_comp_id: cb.sender_comp_id.unwrap_or_default().to_vec(),
        target_comp_id: cb.target_comp_id.unwrap_or_default().to_vec(),
    };

    if cb.msg_type != char::from(MsgType::LOGON) {
        return Err(SessionError::new_message_rejected(
            None,
            0,
            None,
            Some(cb.msg_type),
        ));
    }

    Ok((key, msg_vec))
}

async fn reject_and_close(stream: &mut TcpStream) {
    let builder = MessageBuilder::new("FIX.4.2", MsgType::REJECT.into())
        .push(Tags::Text, b"CompID mismatch");
    let mut buf = Vec::with_capacity(128);
    if builder
        .build_async(
            &mut buf,
            1,
            &crate::fix::encode::AdditionalHeaders::default(),
            chrono::Utc::now(),
        )
        .await
        .is_ok()
    {
        let msg: MsgBuf = buf.into();
        let _ = stream.write_all(&msg[..]).await;
    }
    stream.set_linger_zero();
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_route_key_matches_by_comp_ids() {
        let a = RouteKey {
            sender_comp_id: b"T1".to_vec(),
            target_comp_id: b"S".to_vec(),
        };
        let b = RouteKey {
            sender_comp_id: b"T1".to_vec(),
            target_comp_id: b"S".to_vec(),
        };
        let c = RouteKey {
            sender_comp_id: b"T2".to_vec(),
            target_comp_id: b"S".to_vec(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
