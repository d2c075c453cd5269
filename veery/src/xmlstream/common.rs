// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::borrow::Cow;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;

use bytes::{Buf, BytesMut};

use futures::{ready, Stream, StreamExt};

use minidom::Element;

use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    time::Instant,
};

use rxml::{
    writer::{SimpleNamespaces, TrackNamespace},
    Event, Namespace,
};

use crate::connect::AsyncReadAndWrite;
use crate::protocol::{ns, FromElement, ParseError};

use super::capture::{log_enabled, log_recv, log_send, CaptureBufRead};

/// Configuration for silence timeouts on an XML stream.
///
/// The defaults follow the keep-alive settings of the session layer: a
/// soft timeout after 60 s of inbound silence (which the session answers
/// with an ack request or a ping) and a hard timeout 20 s later.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Maximum inbound silence before a
    /// [`ReadError::SoftTimeout`][`super::ReadError::SoftTimeout`] is
    /// returned. `None` disables both timeouts.
    ///
    /// Soft timeouts are not fatal, but user code must react to them by
    /// sending something which provokes peer traffic before the response
    /// timeout expires.
    pub read_timeout: Option<Duration>,

    /// Maximum further silence after a soft timeout before the stream
    /// fails with a hard [`TimedOut`][`io::ErrorKind::TimedOut`] I/O
    /// error.
    pub response_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::new(60, 0)),
            response_timeout: Duration::new(20, 0),
        }
    }
}

impl Timeouts {
    /// Tight timeouts suitable for tests and localhost communication.
    pub fn tight() -> Self {
        Self {
            read_timeout: Some(Duration::new(1, 0)),
            response_timeout: Duration::new(1, 0),
        }
    }

    /// No timeouts at all; silence is never reported.
    pub fn disabled() -> Self {
        Self {
            read_timeout: None,
            response_timeout: Duration::new(0, 0),
        }
    }
}

#[derive(Clone, Copy)]
enum TimeoutLevel {
    Soft,
    Hard,
}

#[derive(Debug)]
pub(super) enum RawError {
    Io(io::Error),
    SoftTimeout,
}

impl From<io::Error> for RawError {
    fn from(other: io::Error) -> Self {
        Self::Io(other)
    }
}

struct TimeoutState {
    timeouts: Timeouts,

    /// Level of the next timeout which will trip.
    level: TimeoutLevel,

    // Boxed so that the containing stream stays movable; the state is
    // re-armed in place on every reset.
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl TimeoutState {
    fn new(timeouts: Timeouts) -> Self {
        Self {
            deadline: Box::pin(tokio::time::sleep(
                timeouts.read_timeout.unwrap_or(Duration::ZERO),
            )),
            level: TimeoutLevel::Soft,
            timeouts,
        }
    }

    fn poll(&mut self, cx: &mut Context) -> Poll<TimeoutLevel> {
        if self.timeouts.read_timeout.is_none() {
            return Poll::Pending;
        }
        ready!(self.deadline.as_mut().poll(cx));
        let tripped = self.level;
        let next_duration = match self.level {
            TimeoutLevel::Soft => {
                self.level = TimeoutLevel::Hard;
                self.timeouts.response_timeout
            }
            // Fire again periodically until someone kills the stream.
            TimeoutLevel::Hard => Duration::new(1, 0),
        };
        self.deadline.as_mut().reset(Instant::now() + next_duration);
        Poll::Ready(tripped)
    }

    fn reset(&mut self) {
        let Some(read_timeout) = self.timeouts.read_timeout else {
            return;
        };
        self.level = TimeoutLevel::Soft;
        self.deadline.as_mut().reset(Instant::now() + read_timeout);
    }
}

pin_project_lite::pin_project! {
    /// Byte-level half of the XML stream: an incremental parser on the
    /// read side and a buffered serializer on the write side.
    ///
    /// The write buffer has a high water mark; `poll_ready` signals
    /// backpressure once it is exceeded, but `queue_*` never fails on a
    /// full buffer, because element serialization cannot be suspended
    /// halfway.
    #[project = RawXmlStreamProj]
    pub(super) struct RawXmlStream<Io> {
        #[pin]
        parser: rxml::AsyncReader<CaptureBufRead<Io>>,

        timeouts: TimeoutState,

        tx_buffer: BytesMut,

        // Position inside tx_buffer up to which to-be-sent data has
        // already been logged.
        tx_buffer_logged: usize,

        tx_buffer_high_water_mark: usize,
    }
}

impl<Io: AsyncBufRead + AsyncWrite> RawXmlStream<Io> {
    pub(super) fn new(io: Io, timeouts: Timeouts) -> Self {
        let parser = rxml::Parser::default();
        let mut io = CaptureBufRead::wrap(io);
        if log_enabled() {
            io.enable_capture();
        }
        Self {
            parser: rxml::AsyncReader::wrap(io, parser),
            timeouts: TimeoutState::new(timeouts),
            tx_buffer: BytesMut::new(),
            tx_buffer_logged: 0,
            tx_buffer_high_water_mark: 2048,
        }
    }

    /// Discard all parser state, e.g. across STARTTLS or after SASL.
    pub(super) fn reset_state(self: Pin<&mut Self>) {
        let this = self.project();
        *this.parser.parser_pinned() = rxml::Parser::default();
    }

    pub(super) fn into_inner(self) -> Io {
        self.parser.into_inner().0.into_inner()
    }

    /// Box the underlying transport stream.
    pub(super) fn box_stream(self) -> RawXmlStream<Box<dyn AsyncReadAndWrite + Send + 'static>>
    where
        Io: AsyncReadAndWrite + Send + 'static,
    {
        let (io, parser) = self.parser.into_inner();
        let mut io = CaptureBufRead::wrap(Box::new(io) as Box<_>);
        if log_enabled() {
            io.enable_capture();
        }
        RawXmlStream {
            parser: rxml::AsyncReader::wrap(io, parser),
            timeouts: self.timeouts,
            tx_buffer: self.tx_buffer,
            tx_buffer_logged: self.tx_buffer_logged,
            tx_buffer_high_water_mark: self.tx_buffer_high_water_mark,
        }
    }
}

impl<Io> RawXmlStream<Io> {
    fn parser_pinned(self: Pin<&mut Self>) -> &mut rxml::Parser {
        self.project().parser.parser_pinned()
    }

    pub(super) fn stream_pinned(self: Pin<&mut Self>) -> Pin<&mut CaptureBufRead<Io>> {
        self.project().parser.inner_pinned()
    }

    pub(super) fn get_stream(&self) -> &Io {
        self.parser.inner().inner()
    }

    /// Queue raw, pre-serialized bytes (the stream header and footer).
    pub(super) fn queue_raw(self: Pin<&mut Self>, data: &[u8]) {
        self.project().tx_buffer.extend_from_slice(data);
    }

    /// Serialize an element into the transmit buffer.
    pub(super) fn queue_element(self: Pin<&mut Self>, element: &Element) -> io::Result<()> {
        let this = self.project();
        let prev_len = this.tx_buffer.len();
        match element.write_to(&mut BytesWriter(this.tx_buffer)) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Rewind so that a failed serialization leaves no
                // half-written element behind.
                let truncated = this.tx_buffer.len() - prev_len;
                this.tx_buffer.truncate(prev_len);
                log::trace!("SEND failed: {}. Rewinding buffer by {} bytes.", e, truncated);
                Err(io::Error::new(io::ErrorKind::InvalidInput, e))
            }
        }
    }
}

/// minidom serializes into `std::io::Write`; BytesMut only implements
/// `fmt::Write`.
struct BytesWriter<'x>(&'x mut BytesMut);

impl<'x> io::Write for BytesWriter<'x> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<Io: AsyncBufRead> Stream for RawXmlStream<Io> {
    type Item = Result<rxml::Event, RawError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.parser.as_mut().poll_read(cx) {
                Poll::Pending => (),
                Poll::Ready(v) => {
                    // Any inbound bytes, whitespace pings included, reset
                    // the silence timers.
                    this.timeouts.reset();
                    match v.transpose() {
                        // Skip the XML declaration, nobody wants to hear
                        // about that.
                        Some(Ok(rxml::Event::XmlDeclaration(_, _))) => continue,
                        other => return Poll::Ready(other.map(|x| x.map_err(RawError::Io))),
                    }
                }
            };

            // poll_read returned pending; what do the timeouts say?
            match ready!(this.timeouts.poll(cx)) {
                TimeoutLevel::Soft => return Poll::Ready(Some(Err(RawError::SoftTimeout))),
                TimeoutLevel::Hard => {
                    return Poll::Ready(Some(Err(RawError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read and response timeouts elapsed",
                    )))))
                }
            }
        }
    }
}

impl<'x, Io: AsyncWrite> RawXmlStreamProj<'x, Io> {
    fn flush_tx_log(&mut self) {
        let range = &self.tx_buffer[*self.tx_buffer_logged..];
        if range.is_empty() {
            return;
        }
        log_send(range);
        *self.tx_buffer_logged = self.tx_buffer.len();
    }

    fn progress_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flush_tx_log();
        while !self.tx_buffer.is_empty() {
            let written = match ready!(self
                .parser
                .as_mut()
                .inner_pinned()
                .poll_write(cx, self.tx_buffer))
            {
                Ok(v) => v,
                Err(e) => return Poll::Ready(Err(e)),
            };
            self.tx_buffer.advance(written);
            *self.tx_buffer_logged = self
                .tx_buffer_logged
                .checked_sub(written)
                .expect("tx log position out of sync");
        }
        Poll::Ready(Ok(()))
    }
}

impl<Io: AsyncWrite> RawXmlStream<Io> {
    /// Progress writes; ready once the buffer is below the high water
    /// mark.
    pub(super) fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match this.progress_write(cx) {
            // No progress, but enough space in the buffer is fine too.
            Poll::Pending => (),
            Poll::Ready(Ok(())) => (),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }
        if this.tx_buffer.len() < *this.tx_buffer_high_water_mark {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    /// Flush the buffer all the way down to the transport.
    pub(super) fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_flush(cx)
    }

    /// Flush and shut down the transport's write side.
    pub(super) fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_shutdown(cx)
    }
}

fn is_xml_whitespace(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
}

/// A non-success state which may occur while reading an element.
pub(super) enum ReadElementError {
    /// The stream footer (`</stream:stream>`) was read.
    Footer,

    /// A real I/O or XML error. Not recoverable.
    Hard(io::Error),

    /// The soft silence timeout tripped between two elements.
    ///
    /// A soft timeout in the middle of an element is masked into a hard
    /// timeout: a peer which stalls inside an element is not waiting for
    /// us to make it talk.
    SoftTimeout,

    /// The element was well-formed XML, but did not match the expected
    /// type. Recoverable; the nesting level has been restored.
    Parse(ParseError),
}

impl From<io::Error> for ReadElementError {
    fn from(other: io::Error) -> Self {
        Self::Hard(other)
    }
}

/// Incremental [`minidom::Element`] assembly from [`rxml::Event`]s.
struct ElementBuilder {
    inner: Option<Element>,
    nested: Option<Box<ElementBuilder>>,
}

impl ElementBuilder {
    fn start(qname: rxml::QName, attrs: rxml::AttrMap) -> Self {
        let mut prefixes = SimpleNamespaces::new();
        let mut builder = Element::builder(qname.1, qname.0);
        for ((namespace, name), value) in attrs.into_iter() {
            if namespace.is_none() {
                builder = builder.attr(name, value);
            } else if namespace == Namespace::XML {
                builder = builder.attr(format!("xml:{}", name), value);
            } else {
                let (is_new, prefix) = prefixes.declare_with_auto_prefix(namespace.clone());
                let name = prefix.with_suffix(&name);
                if is_new {
                    builder = builder
                        .prefix(
                            Some(prefix.as_str().to_owned()),
                            namespace.as_str().to_owned(),
                        )
                        .unwrap();
                }
                builder = builder.attr(name, value);
            }
        }
        Self {
            inner: Some(builder.build()),
            nested: None,
        }
    }

    /// Feed one event; returns the finished element once its end tag has
    /// been consumed.
    fn feed(&mut self, ev: Event) -> Option<Element> {
        let inner = self.inner.as_mut().expect("feed() called after completion");
        if let Some(nested) = self.nested.as_mut() {
            if let Some(child) = nested.feed(ev) {
                inner.append_child(child);
                self.nested = None;
            }
            return None;
        }
        match ev {
            Event::XmlDeclaration(_, _) => None,
            Event::StartElement(_, qname, attrs) => {
                self.nested = Some(Box::new(ElementBuilder::start(qname, attrs)));
                None
            }
            Event::Text(_, text) => {
                inner.append_text_node(text);
                None
            }
            Event::EndElement(_) => self.inner.take(),
        }
    }
}

/// State for reading one typed element from a [`RawXmlStream`].
///
/// Due to pinning, it is simpler to implement the state machine in a
/// dedicated enum and have the pinned stream passed into it.
pub(super) enum ReadElementState<T: FromElement> {
    /// Between top-level elements. XML whitespace is discarded here (per
    /// RFC 6120 § 11.7), other text is rejected.
    PreData,

    /// Inside a top-level element.
    Parsing {
        builder: ElementBuilder,
        marker: core::marker::PhantomData<T>,
    },

    /// Terminal state; advancing again panics, matching the contract of
    /// [`core::future::Future::poll`].
    Done,
}

// A derived Default would demand `T: Default` for no reason.
impl<T: FromElement> Default for ReadElementState<T> {
    fn default() -> Self {
        Self::PreData
    }
}

impl<T: FromElement> ReadElementState<T> {
    /// Advance until one complete element has been read and parsed.
    ///
    /// Whitespace before the element is discarded. When the element fails
    /// to parse into `T`, the XML structure has nonetheless been consumed
    /// entirely: parse errors leave the stream at the original nesting
    /// level and further elements can be read.
    pub(super) fn poll_advance<Io: AsyncBufRead>(
        &mut self,
        mut source: Pin<&mut RawXmlStream<Io>>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, ReadElementError>> {
        loop {
            // Do not buffer text between elements; whitespace keepalives
            // would otherwise accumulate indefinitely.
            let text_buffering = !matches!(self, ReadElementState::PreData);
            source
                .as_mut()
                .parser_pinned()
                .set_text_buffering(text_buffering);

            let ev = ready!(source.as_mut().poll_next(cx)).transpose();
            match self {
                ReadElementState::PreData => match ev {
                    Ok(Some(Event::XmlDeclaration(_, _))) => (),
                    Ok(Some(Event::Text(_, data))) => {
                        if is_xml_whitespace(data.as_bytes()) {
                            log::trace!("Received {} bytes of whitespace", data.len());
                            source.as_mut().stream_pinned().discard_capture();
                        } else {
                            *self = ReadElementState::Done;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "non-whitespace text at stream level",
                            )
                            .into()));
                        }
                    }
                    Ok(Some(Event::StartElement(_, qname, attrs))) => {
                        *self = ReadElementState::Parsing {
                            builder: ElementBuilder::start(qname, attrs),
                            marker: core::marker::PhantomData,
                        };
                    }
                    // The end of the element wrapping us: the stream
                    // footer.
                    Ok(Some(Event::EndElement(_))) => {
                        *self = ReadElementState::Done;
                        return Poll::Ready(Err(ReadElementError::Footer));
                    }
                    Ok(None) => {
                        *self = ReadElementState::Done;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "eof between stream elements",
                        )
                        .into()));
                    }
                    Err(RawError::SoftTimeout) => {
                        *self = ReadElementState::Done;
                        return Poll::Ready(Err(ReadElementError::SoftTimeout));
                    }
                    Err(RawError::Io(e)) => {
                        *self = ReadElementState::Done;
                        return Poll::Ready(Err(ReadElementError::Hard(e)));
                    }
                },
                ReadElementState::Parsing { builder, .. } => {
                    let ev = match ev {
                        Ok(Some(ev)) => ev,
                        Ok(None) => {
                            *self = ReadElementState::Done;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "eof in the middle of an element",
                            )
                            .into()));
                        }
                        Err(RawError::Io(e)) => {
                            *self = ReadElementState::Done;
                            return Poll::Ready(Err(e.into()));
                        }
                        Err(RawError::SoftTimeout) => {
                            // See ReadElementError::SoftTimeout on the
                            // masking.
                            *self = ReadElementState::Done;
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "silence in the middle of an element",
                            )
                            .into()));
                        }
                    };

                    if let Some(element) = builder.feed(ev) {
                        *self = ReadElementState::Done;
                        return match T::from_element(element) {
                            Ok(v) => {
                                log_recv(None, source.as_mut().stream_pinned().take_capture());
                                Poll::Ready(Ok(v))
                            }
                            Err(e) => {
                                log_recv(
                                    Some(&e),
                                    source.as_mut().stream_pinned().take_capture(),
                                );
                                Poll::Ready(Err(ReadElementError::Parse(e)))
                            }
                        };
                    }
                }

                ReadElementState::Done => panic!("future polled after completion"),
            }
        }
    }
}

/// Contents of a stream header.
#[derive(Default, Debug)]
pub struct StreamHeader<'x> {
    /// The optional `from` attribute.
    pub from: Option<Cow<'x, str>>,

    /// The optional `to` attribute.
    pub to: Option<Cow<'x, str>>,

    /// The optional `id` attribute.
    pub id: Option<Cow<'x, str>>,

    /// The advertised stream version. Pre-RFC 3920 servers omit it, which
    /// signals that only legacy (non-SASL) authentication is available.
    pub version: Option<Cow<'x, str>>,
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

impl<'x> StreamHeader<'x> {
    /// Take the contents, leaving all parts set to `None`.
    pub fn take(&mut self) -> Self {
        Self {
            from: self.from.take(),
            to: self.to.take(),
            id: self.id.take(),
            version: self.version.take(),
        }
    }

    /// Whether the peer advertised XMPP 1.0.
    pub fn supports_features(&self) -> bool {
        self.version.as_deref() == Some("1.0")
    }

    pub(super) async fn send<Io: AsyncBufRead + AsyncWrite + Unpin>(
        self,
        mut stream: Pin<&mut RawXmlStream<Io>>,
    ) -> io::Result<()> {
        let mut header = String::new();
        header.push_str("<?xml version='1.0'?><stream:stream");
        if let Some(from) = self.from {
            header.push_str(&format!(" from='{}'", escape_attr(&from)));
        }
        if let Some(to) = self.to {
            header.push_str(&format!(" to='{}'", escape_attr(&to)));
        }
        if let Some(id) = self.id {
            header.push_str(&format!(" id='{}'", escape_attr(&id)));
        }
        header.push_str(&format!(
            " version='1.0' xmlns='{}' xmlns:stream='{}'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
        ));
        stream.as_mut().queue_raw(header.as_bytes());
        futures::future::poll_fn(|cx| stream.as_mut().poll_flush(cx)).await
    }
}

impl StreamHeader<'static> {
    pub(super) async fn recv<Io: AsyncBufRead>(
        mut stream: Pin<&mut RawXmlStream<Io>>,
    ) -> io::Result<Self> {
        loop {
            match stream.as_mut().next().await {
                Some(Err(RawError::Io(e))) => return Err(e),
                Some(Err(RawError::SoftTimeout)) => (),
                Some(Ok(Event::StartElement(_, (namespace, name), mut attrs))) => {
                    if namespace != ns::STREAM || name != "stream" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unknown stream header",
                        ));
                    }

                    let version = attrs.remove(Namespace::none(), "version");
                    let from = attrs.remove(Namespace::none(), "from");
                    let to = attrs.remove(Namespace::none(), "to");
                    let id = attrs.remove(Namespace::none(), "id");

                    return Ok(StreamHeader {
                        from: from.map(|v| Cow::Owned(v.into())),
                        to: to.map(|v| Cow::Owned(v.into())),
                        id: id.map(|v| Cow::Owned(v.into())),
                        version: version.map(|v| Cow::Owned(v.into())),
                    });
                }
                Some(Ok(Event::Text(_, _))) | Some(Ok(Event::EndElement(_))) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected content before stream header",
                    ))
                }
                // The XML parser prevents more than one XML declaration,
                // so this cannot loop forever.
                Some(Ok(Event::XmlDeclaration(_, _))) => (),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream header",
                    ))
                }
            }
        }
    }
}
