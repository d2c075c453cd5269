// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `starttls::StartTlsServerConnector` provides encrypted connections,
//! either via STARTTLS upgrade on the regular port or via direct TLS on
//! a legacy SSL port.

use alloc::borrow::Cow;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::error::Error as StdError;
use std::io::{self, IoSlice};

use futures::{sink::SinkExt, stream::StreamExt};

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufStream, ReadBuf},
    net::TcpStream,
};

#[cfg(feature = "tls-native")]
use {
    native_tls::{Certificate as NativeCertificate, Error as TlsError, TlsConnector as NativeTlsConnector},
    tokio_native_tls::TlsConnector,
};

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
use {
    std::sync::Arc,
    tokio_rustls::{
        rustls::pki_types::{CertificateDer, InvalidDnsNameError, ServerName},
        rustls::{self, ClientConfig, RootCertStore},
        TlsConnector,
    },
};

use veery_jid::Jid;
use veery_sasl::common::ChannelBinding;

use crate::connect::{
    recv_features_or_legacy, ConnectedStream, DnsConfig, ServerConnector, ServerConnectorError,
};
use crate::error::{Error, ProtocolError};
use crate::protocol::{starttls, XmppStreamElement};
use crate::xmlstream::{initiate_stream, ReadError, StreamHeader, Timeouts, XmlStream};

#[cfg(feature = "tls-native")]
type TlsTransport = tokio_native_tls::TlsStream<TcpStream>;
#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
type TlsTransport = tokio_rustls::client::TlsStream<TcpStream>;

/// When to negotiate TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Never negotiate TLS, even when the server offers it.
    Disabled,

    /// Upgrade via STARTTLS when the server offers it; continue in the
    /// clear otherwise.
    Opportunistic,

    /// Upgrade via STARTTLS; fail when the server does not offer it.
    Required,

    /// Perform the TLS handshake immediately after the TCP connect
    /// (legacy SSL ports, typically 5223).
    Direct,
}

/// Certificate handling knobs.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Additional trust anchors, DER encoded.
    pub ca_certificates: Vec<Vec<u8>>,

    /// Skip certificate verification entirely.
    ///
    /// This defeats the purpose of TLS; only useful against test servers
    /// with self-signed certificates.
    pub ignore_certificate_errors: bool,
}

/// Connect via TCP, negotiating TLS according to a [`TlsPolicy`].
#[derive(Debug, Clone)]
pub struct StartTlsServerConnector {
    /// How to find the server.
    pub dns: DnsConfig,
    /// When to negotiate TLS.
    pub policy: TlsPolicy,
    /// Certificate handling.
    pub tls: TlsOptions,
}

impl From<DnsConfig> for StartTlsServerConnector {
    fn from(dns: DnsConfig) -> StartTlsServerConnector {
        Self {
            dns,
            policy: TlsPolicy::Required,
            tls: TlsOptions::default(),
        }
    }
}

pin_project_lite::pin_project! {
    /// A transport which is either plaintext TCP or TLS over TCP.
    ///
    /// Opportunistic STARTTLS needs both outcomes behind one type.
    #[project = MaybeTlsProj]
    #[allow(missing_docs)]
    pub enum MaybeTlsStream {
        /// Plaintext.
        Plain { #[pin] stream: BufStream<TcpStream> },
        /// Encrypted.
        Tls { #[pin] stream: BufStream<TlsTransport> },
    }
}

impl MaybeTlsStream {
    fn plain(stream: TcpStream) -> Self {
        Self::Plain {
            stream: BufStream::new(stream),
        }
    }

    fn tls(stream: TlsTransport) -> Self {
        Self::Tls {
            stream: BufStream::new(stream),
        }
    }

    /// Whether TLS is active on this transport.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_read(cx, buf),
            MaybeTlsProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncBufRead for MaybeTlsStream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_fill_buf(cx),
            MaybeTlsProj::Tls { stream } => stream.poll_fill_buf(cx),
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.consume(amt),
            MaybeTlsProj::Tls { stream } => stream.consume(amt),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_write(cx, buf),
            MaybeTlsProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_flush(cx),
            MaybeTlsProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_shutdown(cx),
            MaybeTlsProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsProj::Plain { stream } => stream.poll_write_vectored(cx, bufs),
            MaybeTlsProj::Tls { stream } => stream.poll_write_vectored(cx, bufs),
        }
    }
}

impl ServerConnector for StartTlsServerConnector {
    type Stream = MaybeTlsStream;

    async fn connect(
        &self,
        jid: &Jid,
        timeouts: Timeouts,
    ) -> Result<ConnectedStream<Self::Stream>, Error> {
        let tcp_stream = self.dns.resolve().await?;

        let io = if self.policy == TlsPolicy::Direct {
            MaybeTlsStream::tls(tls_handshake(tcp_stream, jid.domain(), &self.tls).await?)
        } else {
            let pending = initiate_stream(
                MaybeTlsStream::plain(tcp_stream),
                StreamHeader {
                    to: Some(Cow::Borrowed(jid.domain())),
                    ..StreamHeader::default()
                },
                timeouts,
            )
            .await?;
            let connected = recv_features_or_legacy(pending).await?;

            if self.policy == TlsPolicy::Disabled {
                return Ok(connected);
            }

            if connected.features.can_starttls() {
                let tcp_stream =
                    negotiate_starttls(connected.stream).await?;
                MaybeTlsStream::tls(tls_handshake(tcp_stream, jid.domain(), &self.tls).await?)
            } else if self.policy == TlsPolicy::Required || connected.features.tls_required() {
                return Err(Error::Protocol(ProtocolError::TlsUnavailable));
            } else {
                // Opportunistic mode against a server without STARTTLS:
                // keep the plaintext stream.
                return Ok(connected);
            }
        };

        let pending = initiate_stream(
            io,
            StreamHeader {
                to: Some(Cow::Borrowed(jid.domain())),
                ..StreamHeader::default()
            },
            timeouts,
        )
        .await?;
        Ok(recv_features_or_legacy(pending).await?)
    }

    fn with_preferred_address(&self, host: &str, port: u16) -> Self {
        Self {
            dns: DnsConfig::no_srv(host, port),
            policy: self.policy,
            tls: self.tls.clone(),
        }
    }

    fn channel_binding(stream: &Self::Stream) -> Result<ChannelBinding, Error> {
        #[cfg(feature = "tls-native")]
        {
            let _ = stream;
            log::warn!("tls-native does not support channel binding, please use tls-rust if you want this feature!");
            Ok(ChannelBinding::Unsupported)
        }
        #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
        {
            let MaybeTlsStream::Tls { stream } = stream else {
                return Ok(ChannelBinding::Unsupported);
            };
            let (_, connection) = stream.get_ref().get_ref();
            match connection.protocol_version() {
                Some(rustls::ProtocolVersion::TLSv1_3) => {
                    let data = vec![0u8; 32];
                    let data = connection
                        .export_keying_material(data, b"EXPORTER-Channel-Binding", None)
                        .map_err(StartTlsError::Tls)?;
                    Ok(ChannelBinding::TlsExporter(data))
                }
                _ => {
                    // tls-unique is gone from rustls; the certificate
                    // hash still works on older TLS versions.
                    match connection.peer_certificates() {
                        Some([cert, ..]) => {
                            use sha2::{Digest, Sha256};
                            Ok(ChannelBinding::TlsServerEndPoint(
                                Sha256::digest(cert.as_ref()).to_vec(),
                            ))
                        }
                        _ => Ok(ChannelBinding::Unsupported),
                    }
                }
            }
        }
    }
}

/// Drive the `<starttls/>` exchange and hand back the raw TCP stream for
/// the handshake.
async fn negotiate_starttls(
    mut stream: XmlStream<MaybeTlsStream, XmppStreamElement>,
) -> Result<TcpStream, Error> {
    stream
        .send(&XmppStreamElement::Starttls(starttls::Nonza::Request))
        .await?;

    loop {
        match stream.next().await {
            Some(Ok(XmppStreamElement::Starttls(starttls::Nonza::Proceed))) => break,
            Some(Ok(XmppStreamElement::Starttls(starttls::Nonza::Failure))) => {
                return Err(Error::Protocol(ProtocolError::TlsRefused));
            }
            Some(Ok(_)) => (),
            Some(Err(ReadError::SoftTimeout)) => (),
            Some(Err(ReadError::HardError(e))) => return Err(e.into()),
            Some(Err(ReadError::ParseError(e))) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, e).into())
            }
            None | Some(Err(ReadError::StreamFooterReceived)) => return Err(Error::Disconnected),
        }
    }

    match stream.into_inner() {
        MaybeTlsStream::Plain { stream } => Ok(stream.into_inner()),
        MaybeTlsStream::Tls { .. } => unreachable!("starttls negotiated on an encrypted stream"),
    }
}

#[cfg(feature = "tls-native")]
async fn tls_handshake(
    stream: TcpStream,
    domain: &str,
    options: &TlsOptions,
) -> Result<TlsTransport, Error> {
    let mut builder = NativeTlsConnector::builder();
    for der in &options.ca_certificates {
        builder.add_root_certificate(
            NativeCertificate::from_der(der).map_err(StartTlsError::Tls)?,
        );
    }
    if options.ignore_certificate_errors {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder.build().map_err(StartTlsError::Tls)?;
    Ok(TlsConnector::from(connector)
        .connect(domain, stream)
        .await
        .map_err(StartTlsError::Tls)?)
}

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
async fn tls_handshake(
    stream: TcpStream,
    domain: &str,
    options: &TlsOptions,
) -> Result<TlsTransport, Error> {
    let domain = ServerName::try_from(domain.to_owned()).map_err(StartTlsError::DnsNameError)?;

    let builder = ClientConfig::builder();
    let config = if options.ignore_certificate_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        #[cfg(feature = "webpki-roots")]
        {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        #[cfg(feature = "rustls-native-certs")]
        {
            root_store.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
        }
        for der in &options.ca_certificates {
            root_store
                .add(CertificateDer::from(der.clone()))
                .map_err(StartTlsError::Tls)?;
        }
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config))
        .connect(domain, stream)
        .await
        .map_err(Error::Io)?)
}

/// Certificate verifier behind `ignore_certificate_errors`.
#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
#[derive(Debug)]
struct AcceptAllVerifier;

#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
impl rustls::client::danger::ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

/// StartTLS connector error.
#[derive(Debug)]
pub enum StartTlsError {
    /// TLS error.
    #[cfg(any(feature = "tls-native", feature = "tls-rust"))]
    Tls(TlsInnerError),
    /// DNS name parsing error.
    #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
    DnsNameError(InvalidDnsNameError),
}

#[cfg(feature = "tls-native")]
type TlsInnerError = TlsError;
#[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
type TlsInnerError = rustls::Error;

impl ServerConnectorError for StartTlsError {}

impl fmt::Display for StartTlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            #[cfg(any(feature = "tls-native", feature = "tls-rust"))]
            Self::Tls(e) => write!(fmt, "TLS error: {}", e),
            #[cfg(all(feature = "tls-rust", not(feature = "tls-native")))]
            Self::DnsNameError(e) => write!(fmt, "DNS name error: {}", e),
        }
    }
}

impl StdError for StartTlsError {}
