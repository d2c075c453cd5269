// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # RFC 6120 XML streams
//!
//! **Note:** The XML stream is a low-level API which you should probably
//! not use directly.
//!
//! Establishing an XML stream is a multi-stage process: the client sends
//! its stream header with [`initiate_stream`], inspects the header the
//! server answered with, and then receives the server's features through
//! [`PendingFeaturesRecv::recv_features`], which yields the actual
//! [`XmlStream`].
//!
//! Stream negotiation may reset the stream several times (after STARTTLS
//! and after authentication). [`XmlStream::initiate_reset`] drops all
//! parser state and returns the stream to the header stage.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::connect::AsyncReadAndWrite;
use crate::protocol::{AsElement, FromElement, ParseError, StreamFeatures};

mod capture;
mod common;
#[cfg(test)]
mod tests;

pub use self::common::{StreamHeader, Timeouts};
use self::common::{RawXmlStream, ReadElementError, ReadElementState};

/// Initiate a new stream.
///
/// Sends a stream header with the attributes in `stream_header` and waits
/// for the peer's header.
pub async fn initiate_stream<Io: AsyncBufRead + AsyncWrite + Unpin>(
    io: Io,
    stream_header: StreamHeader<'_>,
    timeouts: Timeouts,
) -> Result<PendingFeaturesRecv<Io>, io::Error> {
    let stream = InitiatingStream(RawXmlStream::new(io, timeouts));
    stream.send_header(stream_header).await
}

/// A non-success state which may occur while reading from an
/// [`XmlStream`].
#[derive(Debug)]
pub enum ReadError {
    /// The soft timeout of the stream tripped.
    ///
    /// User code should handle this by sending something which makes the
    /// peer produce data before the hard timeout trips.
    SoftTimeout,

    /// An I/O error. Generally fatal.
    HardError(io::Error),

    /// An element failed to parse. Non-fatal; more elements may be read.
    ParseError(ParseError),

    /// The stream footer was received; the peer has closed the stream.
    ///
    /// All further reads will return this error again.
    StreamFooterReceived,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadError::SoftTimeout => f.write_str("soft timeout"),
            ReadError::HardError(e) => write!(f, "hard error: {}", e),
            ReadError::ParseError(e) => write!(f, "parse error: {}", e),
            ReadError::StreamFooterReceived => f.write_str("stream footer received"),
        }
    }
}

/// A stream which has had its header sent and is waiting for the peer's
/// header.
pub struct InitiatingStream<Io>(pub(super) RawXmlStream<Io>);

impl<Io: AsyncBufRead + AsyncWrite + Unpin> InitiatingStream<Io> {
    /// Send the stream header.
    pub async fn send_header(
        self,
        header: StreamHeader<'_>,
    ) -> io::Result<PendingFeaturesRecv<Io>> {
        let Self(mut stream) = self;
        header.send(Pin::new(&mut stream)).await?;
        let header = StreamHeader::recv(Pin::new(&mut stream)).await?;
        Ok(PendingFeaturesRecv { stream, header })
    }
}

/// A stream whose headers have been exchanged and which waits for the
/// peer's `<stream:features/>`.
pub struct PendingFeaturesRecv<Io> {
    stream: RawXmlStream<Io>,
    header: StreamHeader<'static>,
}

impl<Io> PendingFeaturesRecv<Io> {
    /// The header the peer sent.
    pub fn header(&self) -> &StreamHeader<'static> {
        &self.header
    }

    /// Extract the header the peer sent.
    pub fn take_header(&mut self) -> StreamHeader<'static> {
        self.header.take()
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin> PendingFeaturesRecv<Io> {
    /// Receive the peer's stream features and produce the element stream.
    pub async fn recv_features<T: FromElement + AsElement>(
        mut self,
    ) -> io::Result<(StreamFeatures, XmlStream<Io, T>)> {
        let mut state = ReadElementState::<StreamFeatures>::default();
        let features = loop {
            match futures::future::poll_fn(|cx| {
                state.poll_advance(Pin::new(&mut self.stream), cx)
            })
            .await
            {
                Ok(features) => break features,
                // Soft timeouts while waiting for features are unusual
                // but harmless; keep waiting for the hard timeout to
                // decide.
                Err(ReadElementError::SoftTimeout) => {
                    state = ReadElementState::default();
                }
                Err(ReadElementError::Parse(e)) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e))
                }
                Err(ReadElementError::Footer) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the stream before sending features",
                    ))
                }
                Err(ReadElementError::Hard(e)) => return Err(e),
            }
        };
        Ok((features, XmlStream::wrap(self.stream)))
    }

    /// Skip the features stage entirely.
    ///
    /// Needed for legacy (pre-XMPP-1.0) streams which carry no features;
    /// the peer's header decides whether this is allowed.
    pub fn into_stream<T: FromElement + AsElement>(self) -> XmlStream<Io, T> {
        XmlStream::wrap(self.stream)
    }
}

enum WriteState {
    Open,
    FooterQueued,
    Failed,
}

impl WriteState {
    fn check_ok(&self) -> io::Result<()> {
        match self {
            WriteState::Failed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "XML stream sink unusable because of previous write error",
            )),
            WriteState::Open | WriteState::FooterQueued => Ok(()),
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        match self {
            WriteState::FooterQueued => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream footer already sent",
            )),
            WriteState::Failed | WriteState::Open => self.check_ok(),
        }
    }
}

pin_project_lite::pin_project! {
    /// XML stream
    ///
    /// Represents an [RFC 6120](https://tools.ietf.org/html/rfc6120) XML
    /// stream carrying items of type `T`, which must implement
    /// [`FromElement`] and [`AsElement`].
    pub struct XmlStream<Io, T: FromElement> {
        #[pin]
        inner: RawXmlStream<Io>,
        read_state: Option<ReadElementState<T>>,
        write_state: WriteState,
    }
}

impl<Io, T: FromElement> XmlStream<Io, T> {
    /// Obtain a reference to the `Io` stream.
    pub fn get_stream(&self) -> &Io {
        self.inner.get_stream()
    }
}

impl<Io: AsyncBufRead, T: FromElement + AsElement> XmlStream<Io, T> {
    fn wrap(inner: RawXmlStream<Io>) -> Self {
        Self {
            inner,
            read_state: Some(ReadElementState::default()),
            write_state: WriteState::Open,
        }
    }

    fn assert_retypable(&self) {
        match self.read_state {
            Some(ReadElementState::PreData) => (),
            Some(_) => panic!("cannot reset stream: element parsing in progress!"),
            None => panic!("cannot reset stream: stream footer received!"),
        }
        match self.write_state.check_writable() {
            Ok(()) => (),
            Err(e) => panic!("cannot reset stream: {}", e),
        }
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin, T: FromElement + AsElement> XmlStream<Io, T> {
    /// Initiate a stream reset.
    ///
    /// Discards all parser state; call
    /// [`send_header`][`InitiatingStream::send_header`] on the result to
    /// open the new stream.
    ///
    /// # Panics
    ///
    /// Panics when called in the middle of receiving an element, after
    /// the stream has been closed by either side, or after a write error.
    pub fn initiate_reset(self) -> InitiatingStream<Io> {
        self.assert_retypable();

        let mut stream = self.inner;
        Pin::new(&mut stream).reset_state();
        InitiatingStream(stream)
    }

    /// Discard all XML state and return the inner I/O object.
    pub fn into_inner(self) -> Io {
        self.assert_retypable();
        self.inner.into_inner()
    }
}

impl<Io: AsyncReadAndWrite + AsyncBufRead + Send + 'static, T: FromElement + AsElement>
    XmlStream<Io, T>
{
    /// Box the underlying transport, erasing its type.
    pub fn box_stream(self) -> XmlStream<Box<dyn AsyncReadAndWrite + Send + 'static>, T> {
        XmlStream {
            inner: self.inner.box_stream(),
            read_state: self.read_state,
            write_state: self.write_state,
        }
    }
}

impl<Io: AsyncBufRead, T: FromElement + AsElement> Stream for XmlStream<Io, T> {
    type Item = Result<T, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let result = match this.read_state.as_mut() {
            None => return Poll::Ready(Some(Err(ReadError::StreamFooterReceived))),
            Some(read_state) => ready!(read_state.poll_advance(this.inner, cx)),
        };
        let result = match result {
            Ok(v) => Poll::Ready(Some(Ok(v))),
            Err(ReadElementError::Hard(e)) => Poll::Ready(Some(Err(ReadError::HardError(e)))),
            Err(ReadElementError::Parse(e)) => Poll::Ready(Some(Err(ReadError::ParseError(e)))),
            Err(ReadElementError::SoftTimeout) => Poll::Ready(Some(Err(ReadError::SoftTimeout))),
            Err(ReadElementError::Footer) => {
                *this.read_state = None;
                return Poll::Ready(Some(Err(ReadError::StreamFooterReceived)));
            }
        };
        *this.read_state = Some(ReadElementState::default());
        result
    }
}

impl<'x, Io: AsyncWrite, T: FromElement + AsElement> Sink<&'x T> for XmlStream<Io, T> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_writable()?;
        this.inner.poll_ready(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_ok()?;
        this.inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        this.write_state.check_ok()?;
        if let WriteState::Open = this.write_state {
            this.inner.as_mut().queue_raw(b"</stream:stream>");
            *this.write_state = WriteState::FooterQueued;
        }
        match ready!(this.inner.poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => {
                *this.write_state = WriteState::Failed;
                Poll::Ready(Err(e))
            }
        }
    }

    fn start_send(self: Pin<&mut Self>, item: &'x T) -> Result<(), Self::Error> {
        let this = self.project();
        this.write_state.check_writable()?;
        // queue_element rewinds the buffer on failure, so an error here
        // does not poison the stream.
        this.inner.queue_element(&item.as_element())
    }
}
