//! Response body adapters used by the interceptor stages.
//!
//! gRPC reports the outcome of a call either in the response headers
//! (trailers-only responses, which is how tonic answers a handler error) or
//! in the trailers that follow the last message. The stages that need the
//! final [`Code`] therefore look at the headers first and, when the code is
//! not there yet, wrap the body in an [`ObservedBody`] that reports it once
//! the trailers go by.

use crate::panic::{PanicGuard, catch_unwind_guarded};
use bytes::Bytes;
use core::{
    fmt,
    pin::Pin,
    task::{Context, Poll, ready},
};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tonic::{Code, Status};

/// Reads `grpc-status` from a header or trailer map.
pub fn grpc_code(headers: &HeaderMap) -> Option<Code> {
    headers
        .get("grpc-status")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i32>().ok())
        .map(Code::from)
}

/// Reads the `grpc-message` from a header map, percent-decoded.
pub fn grpc_message(headers: &HeaderMap) -> Option<String> {
    Status::from_header_map(headers)
        .map(|status| status.message().to_owned())
        .filter(|message| !message.is_empty())
}

/// Length of the gRPC message prefix: one flag byte, then a big-endian
/// `u32` message length.
const MESSAGE_PREFIX_LEN: usize = 5;

/// The first message of a gRPC stream, cut to a logging limit.
///
/// Renders as escaped ASCII, so the string fields of a protobuf message stay
/// readable in a log line whatever the message type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    shown: Bytes,
    len: usize,
    compressed: bool,
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.compressed {
            return write!(f, "<compressed, {} bytes>", self.len);
        }
        write!(f, "{}", self.shown.escape_ascii())?;
        if self.shown.len() < self.len {
            write!(f, "... ({} bytes)", self.len)?;
        }
        Ok(())
    }
}

/// Collects the first length-prefixed message out of a stream of data
/// frames, keeping at most `limit` bytes of it.
#[derive(Debug)]
pub(crate) struct MessageSniffer {
    buf: Vec<u8>,
    seen: usize,
    limit: usize,
}

impl MessageSniffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            seen: 0,
            limit,
        }
    }

    pub(crate) fn observe(&mut self, data: &[u8]) {
        let room = (MESSAGE_PREFIX_LEN + self.limit).saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
        self.seen = self.seen.saturating_add(data.len());
    }

    fn declared_len(&self) -> Option<usize> {
        let prefix = self.buf.get(..MESSAGE_PREFIX_LEN)?;
        let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
        Some(usize::try_from(len).unwrap_or(usize::MAX))
    }

    /// Whether the first message has been seen in full.
    pub(crate) fn is_complete(&self) -> bool {
        self.declared_len()
            .is_some_and(|len| self.seen >= MESSAGE_PREFIX_LEN.saturating_add(len))
    }

    pub(crate) fn payload(&self) -> Payload {
        let Some(len) = self.declared_len() else {
            return Payload::default();
        };
        let body = &self.buf[MESSAGE_PREFIX_LEN..];
        let shown = &body[..body.len().min(len).min(self.limit)];
        Payload {
            shown: Bytes::copy_from_slice(shown),
            len,
            compressed: self.buf[0] == 1,
        }
    }
}

/// What an [`ObservedBody`] saw by the time it finished or was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyOutcome {
    /// The final status code, or `None` if the body was dropped before the
    /// trailers arrived.
    pub code: Option<Code>,
    /// The decoded `grpc-message` trailer, if any.
    pub message: Option<String>,
    /// Bytes of message data that went through the body.
    pub bytes: usize,
    /// The first message, when the body was built with
    /// [`ObservedBody::capturing`].
    pub payload: Payload,
}

type Callback = Box<dyn FnOnce(BodyOutcome) + Send + 'static>;

/// Fires its callback exactly once, at the end of the stream or on drop.
struct Completion {
    callback: Option<Callback>,
    bytes: usize,
    sniffer: Option<MessageSniffer>,
}

impl Completion {
    fn observe(&mut self, data: &[u8]) {
        self.bytes += data.len();
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.observe(data);
        }
    }

    fn finish(&mut self, code: Option<Code>, message: Option<String>) {
        if let Some(callback) = self.callback.take() {
            callback(BodyOutcome {
                code,
                message,
                bytes: self.bytes,
                payload: self
                    .sniffer
                    .as_ref()
                    .map(MessageSniffer::payload)
                    .unwrap_or_default(),
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(None, None);
    }
}

pin_project! {
    /// A body that reports its final status and size through a callback.
    pub struct ObservedBody<B> {
        #[pin]
        inner: B,
        completion: Completion,
    }
}

impl<B> ObservedBody<B> {
    pub fn new(inner: B, on_complete: impl FnOnce(BodyOutcome) + Send + 'static) -> Self {
        Self {
            inner,
            completion: Completion {
                callback: Some(Box::new(on_complete)),
                bytes: 0,
                sniffer: None,
            },
        }
    }

    /// Like [`new`](Self::new), and also keeps up to `limit` bytes of the
    /// first message for [`BodyOutcome::payload`].
    pub fn capturing(
        inner: B,
        limit: usize,
        on_complete: impl FnOnce(BodyOutcome) + Send + 'static,
    ) -> Self {
        let mut body = Self::new(inner, on_complete);
        body.completion.sniffer = Some(MessageSniffer::new(limit));
        body
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.completion.observe(data);
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.completion.finish(
                        Some(grpc_code(trailers).unwrap_or(Code::Unknown)),
                        grpc_message(trailers),
                    );
                }
            }
            Some(Err(_)) => this.completion.finish(Some(Code::Internal), None),
            // A well formed gRPC response always ends with trailers.
            None => this.completion.finish(Some(Code::Unknown), None),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

type FirstMessage = Box<dyn FnOnce(Payload) + Send + 'static>;

pin_project! {
    /// An inbound body that counts its data bytes into a shared counter and
    /// hands over the first message as soon as it has been read.
    ///
    /// The callback fires once: when the first message is complete, when
    /// the stream ends without one, or when the body is dropped unread.
    pub struct TappedBody<B> {
        #[pin]
        inner: B,
        counter: Arc<AtomicUsize>,
        tap: Tap,
    }
}

struct Tap {
    sniffer: MessageSniffer,
    on_first: Option<FirstMessage>,
}

impl Tap {
    fn fire(&mut self) {
        if let Some(on_first) = self.on_first.take() {
            on_first(self.sniffer.payload());
        }
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.fire();
    }
}

impl<B> TappedBody<B> {
    pub fn new(
        inner: B,
        counter: Arc<AtomicUsize>,
        limit: usize,
        on_first: impl FnOnce(Payload) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            counter,
            tap: Tap {
                sniffer: MessageSniffer::new(limit),
                on_first: Some(Box::new(on_first)),
            },
        }
    }
}

impl<B> Body for TappedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => match frame.data_ref() {
                Some(data) => {
                    this.counter.fetch_add(data.len(), Ordering::Relaxed);
                    if this.tap.on_first.is_some() {
                        this.tap.sniffer.observe(data);
                        if this.tap.sniffer.is_complete() {
                            this.tap.fire();
                        }
                    }
                }
                None => this.tap.fire(),
            },
            Some(Err(_)) | None => this.tap.fire(),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// A body whose polling runs under a [`PanicGuard`].
    ///
    /// Streaming handlers produce their messages while the body is polled,
    /// after the handler future has already resolved. A panic there ends the
    /// stream with `Code::Internal` trailers.
    pub struct GuardedBody<B> {
        #[pin]
        inner: B,
        guard: PanicGuard,
        method: Arc<str>,
        poisoned: bool,
    }
}

impl<B> GuardedBody<B> {
    pub fn new(inner: B, guard: PanicGuard, method: Arc<str>) -> Self {
        Self {
            inner,
            guard,
            method,
            poisoned: false,
        }
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.poisoned {
            return Poll::Ready(None);
        }
        match catch_unwind_guarded(|| this.inner.as_mut().poll_frame(cx)) {
            Ok(polled) => polled,
            Err(payload) => {
                *this.poisoned = true;
                let status = Status::from(this.guard.recover(&**this.method, payload));
                Poll::Ready(Some(Ok(Frame::trailers(status_trailers(status)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.poisoned || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Renders a status as a trailer map.
fn status_trailers(status: Status) -> HeaderMap {
    let (mut parts, _) = status.into_http::<tonic::body::Body>().into_parts();
    parts.headers.remove(http::header::CONTENT_TYPE);
    parts.headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use futures::future::poll_fn;
    use std::sync::Mutex;

    /// A body that yields pre-baked frames, panicking where asked.
    struct ScriptedBody {
        frames: Vec<Option<Frame<Bytes>>>,
    }

    impl Body for ScriptedBody {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
            if self.frames.is_empty() {
                return Poll::Ready(None);
            }
            match self.frames.remove(0) {
                Some(frame) => Poll::Ready(Some(Ok(frame))),
                None => panic!("stream exploded"),
            }
        }
    }

    fn trailers(code: Code) -> Frame<Bytes> {
        let mut map = HeaderMap::new();
        map.insert("grpc-status", (code as i32).into());
        Frame::trailers(map)
    }

    async fn drain<B: Body<Data = Bytes> + Unpin>(mut body: B) -> Vec<Frame<Bytes>> {
        let mut out = Vec::new();
        while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
            if let Ok(frame) = frame {
                out.push(frame);
            }
        }
        out
    }

    #[test]
    fn reads_grpc_status_from_headers() {
        let mut map = HeaderMap::new();
        assert_eq!(grpc_code(&map), None);
        map.insert("grpc-status", "16".parse().unwrap());
        assert_eq!(grpc_code(&map), Some(Code::Unauthenticated));
    }

    /// Frames `message` the way gRPC does on the wire, uncompressed.
    fn framed(message: &[u8]) -> Bytes {
        let mut out = vec![0];
        out.extend_from_slice(&u32::try_from(message.len()).unwrap().to_be_bytes());
        out.extend_from_slice(message);
        Bytes::from(out)
    }

    #[test]
    fn grpc_message_is_percent_decoded() {
        let mut map = HeaderMap::new();
        map.insert("grpc-status", "3".parse().unwrap());
        assert_eq!(grpc_message(&map), None);
        map.insert("grpc-message", "rejected%20by%20handler".parse().unwrap());
        assert_eq!(grpc_message(&map).as_deref(), Some("rejected by handler"));
    }

    #[test]
    fn sniffer_waits_for_the_whole_first_message() {
        let wire = framed(b"PAYLOAD_MARKER");
        let mut sniffer = MessageSniffer::new(1024);
        sniffer.observe(&wire[..3]);
        assert!(!sniffer.is_complete());
        assert_eq!(sniffer.payload(), Payload::default());
        sniffer.observe(&wire[3..10]);
        assert!(!sniffer.is_complete());
        sniffer.observe(&wire[10..]);
        assert!(sniffer.is_complete());
        assert_eq!(sniffer.payload().to_string(), "PAYLOAD_MARKER");
        assert_eq!(sniffer.payload().len, 14);
    }

    #[test]
    fn payload_is_cut_to_the_limit() {
        let mut sniffer = MessageSniffer::new(4);
        sniffer.observe(&framed(b"\n\x0ePAYLOAD"));
        assert!(sniffer.is_complete());
        assert_eq!(sniffer.payload().to_string(), "\\n\\x0ePA... (9 bytes)");

        let mut compressed = framed(b"gzipped").to_vec();
        compressed[0] = 1;
        let mut sniffer = MessageSniffer::new(1024);
        sniffer.observe(&compressed);
        assert_eq!(sniffer.payload().to_string(), "<compressed, 7 bytes>");
    }

    #[tokio::test]
    async fn capturing_body_reports_first_message() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let wire = framed(b"hello");
        let body = ObservedBody::capturing(
            ScriptedBody {
                frames: vec![
                    Some(Frame::data(wire.slice(..2))),
                    Some(Frame::data(wire.slice(2..))),
                    Some(Frame::data(framed(b"second"))),
                    Some(trailers(Code::Ok)),
                ],
            },
            1024,
            move |outcome| *sink.lock().unwrap() = Some(outcome),
        );
        drain(body).await;
        let outcome = seen.lock().unwrap().take().unwrap();
        assert_eq!(outcome.code, Some(Code::Ok));
        assert_eq!(outcome.bytes, 21);
        assert_eq!(outcome.payload.to_string(), "hello");
    }

    #[tokio::test]
    async fn tapped_body_hands_over_first_message_before_the_stream_ends() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut body = TappedBody::new(
            ScriptedBody {
                frames: vec![
                    Some(Frame::data(framed(b"first"))),
                    Some(Frame::data(framed(b"second"))),
                ],
            },
            Arc::clone(&counter),
            1024,
            move |payload| sink.lock().unwrap().push(payload.to_string()),
        );
        let first = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert!(first.is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["first".to_owned()]);
        drain(body).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first".to_owned()]);
        assert_eq!(counter.load(Ordering::Relaxed), 21);
    }

    #[test]
    fn unread_tapped_body_reports_empty_payload_on_drop() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let body = TappedBody::new(
            ScriptedBody { frames: vec![] },
            Arc::new(AtomicUsize::new(0)),
            1024,
            move |payload| *sink.lock().unwrap() = Some(payload),
        );
        drop(body);
        assert_eq!(*seen.lock().unwrap(), Some(Payload::default()));
    }

    #[tokio::test]
    async fn observed_body_reports_trailer_code_and_size() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let body = ObservedBody::new(
            ScriptedBody {
                frames: vec![
                    Some(Frame::data(Bytes::from_static(b"hello"))),
                    Some(trailers(Code::Ok)),
                ],
            },
            move |outcome| sink.lock().unwrap().push(outcome),
        );
        let frames = drain(body).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![BodyOutcome {
                code: Some(Code::Ok),
                message: None,
                bytes: 5,
                payload: Payload::default(),
            }]
        );
    }

    #[test]
    fn dropped_observed_body_reports_no_code() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let body = ObservedBody::new(ScriptedBody { frames: vec![] }, move |outcome| {
            *sink.lock().unwrap() = Some(outcome);
        });
        drop(body);
        assert_eq!(
            *seen.lock().unwrap(),
            Some(BodyOutcome {
                code: None,
                message: None,
                bytes: 0,
                payload: Payload::default(),
            })
        );
    }

    #[tokio::test]
    async fn guarded_body_turns_panic_into_internal_trailers() {
        let body = GuardedBody::new(
            ScriptedBody {
                frames: vec![Some(Frame::data(Bytes::from_static(b"one"))), None],
            },
            PanicGuard::new(Environment::Development),
            Arc::from("/pkg.Svc/Stream"),
        );
        let frames = drain(body).await;
        assert_eq!(frames.len(), 2);
        let last = frames.last().and_then(Frame::trailers_ref).unwrap();
        assert_eq!(grpc_code(last), Some(Code::Internal));
        assert!(last.get(http::header::CONTENT_TYPE).is_none());
    }
}
