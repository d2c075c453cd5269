// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `ServerConnector` provides negotiated streams for XMPP clients.

use core::future::Future;
use std::io;

use tokio::io::{AsyncBufRead, AsyncWrite};

use veery_jid::Jid;
use veery_sasl::common::ChannelBinding;

use crate::protocol::{StreamFeatures, XmppStreamElement};
use crate::xmlstream::{PendingFeaturesRecv, StreamHeader, Timeouts, XmlStream};
use crate::Error;

#[cfg(feature = "dns")]
mod dns;
#[cfg(feature = "starttls")]
pub mod starttls;
#[cfg(feature = "insecure-tcp")]
pub mod tcp;

#[cfg(feature = "dns")]
pub use dns::DnsConfig;

/// The transport produced by a [`ServerConnector`].
///
/// The buffered read side is required by the incremental XML parser, so
/// connectors wrap their sockets in [`tokio::io::BufStream`].
pub trait AsyncReadAndWrite: AsyncBufRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Trait that must be implemented by the error type of a
/// [`ServerConnector`].
pub trait ServerConnectorError: std::error::Error + Sync + Send {}

/// A freshly connected stream with transport security negotiated and the
/// header exchange done: the input to authentication.
pub struct ConnectedStream<S: AsyncReadAndWrite> {
    /// The header the server answered with.
    pub header: StreamHeader<'static>,

    /// The features of this stream. Empty for pre-XMPP-1.0 servers,
    /// which send none.
    pub features: StreamFeatures,

    /// The stream itself.
    pub stream: XmlStream<S, XmppStreamElement>,
}

/// Complete the feature stage of a freshly opened stream.
///
/// Legacy servers which do not advertise XMPP 1.0 never send features;
/// for those, an empty feature set is reported.
pub async fn recv_features_or_legacy<S: AsyncReadAndWrite>(
    mut pending: PendingFeaturesRecv<S>,
) -> Result<ConnectedStream<S>, io::Error> {
    let header = pending.take_header();
    if header.supports_features() {
        let (features, stream) = pending.recv_features().await?;
        Ok(ConnectedStream {
            header,
            features,
            stream,
        })
    } else {
        Ok(ConnectedStream {
            header,
            features: StreamFeatures::default(),
            stream: pending.into_stream(),
        })
    }
}

/// Properly connects to an XMPP server; called again for every reconnect
/// attempt.
pub trait ServerConnector: Clone + core::fmt::Debug + Send + Unpin + 'static {
    /// The type of transport this connector produces.
    type Stream: AsyncReadAndWrite + 'static;

    /// Produce a connection with transport security negotiated according
    /// to this connector's policy, ready for authentication.
    fn connect(
        &self,
        jid: &Jid,
        timeouts: Timeouts,
    ) -> impl Future<Output = Result<ConnectedStream<Self::Stream>, Error>> + Send;

    /// A copy of this connector which dials the given address instead of
    /// its configured one.
    ///
    /// Used for XEP-0198 resumption locations and `<see-other-host/>`
    /// redirects. The default ignores the hint.
    fn with_preferred_address(&self, _host: &str, _port: u16) -> Self {
        self.clone()
    }

    /// Return channel binding data if available.
    ///
    /// Must not fail when channel binding is simply unavailable; only
    /// call this after the TLS handshake has finished.
    fn channel_binding(_stream: &Self::Stream) -> Result<ChannelBinding, Error> {
        Ok(ChannelBinding::Unsupported)
    }
}

/// Convenience: open a fresh stream on the same transport after a stream
/// reset (post-STARTTLS, post-SASL).
pub(crate) async fn reopen_stream<S: AsyncReadAndWrite>(
    stream: XmlStream<S, XmppStreamElement>,
    domain: &str,
) -> Result<ConnectedStream<S>, io::Error> {
    let pending = stream
        .initiate_reset()
        .send_header(StreamHeader {
            to: Some(domain.into()),
            ..StreamHeader::default()
        })
        .await?;
    recv_features_or_legacy(pending).await
}
