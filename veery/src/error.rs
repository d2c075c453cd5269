// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use core::fmt;
use std::error::Error as StdError;
use std::io::Error as IoError;
use std::net::AddrParseError;

#[cfg(feature = "dns")]
use hickory_resolver::{
    error::ResolveError as DnsResolveError, proto::error::ProtoError as DnsProtoError,
};

use veery_sasl::client::MechanismError as SaslMechanismError;

use crate::connect::ServerConnectorError;
use crate::protocol::sasl::DefinedCondition as SaslCondition;
use crate::protocol::{ParseError, StreamError};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing a Jabber-Id
    JidParse(veery_jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Stream error received from the peer
    Stream(StreamError),
    /// Connection closed
    Disconnected,
    /// The stream died because the peer went silent past the keep-alive
    /// timeout
    KeepAlive,
    /// Error specific to the ServerConnector implementation
    Connection(Box<dyn ServerConnectorError>),
    /// DNS protocol error
    #[cfg(feature = "dns")]
    Dns(DnsProtoError),
    /// DNS resolution error
    #[cfg(feature = "dns")]
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`
    #[cfg(feature = "dns")]
    Idna,
    /// Invalid IP/Port address
    Addr(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Stream(e) => write!(fmt, "{}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::KeepAlive => write!(fmt, "keep-alive timeout"),
            Error::Connection(e) => write!(fmt, "connection error: {}", e),
            #[cfg(feature = "dns")]
            Error::Dns(e) => write!(fmt, "{:?}", e),
            #[cfg(feature = "dns")]
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            #[cfg(feature = "dns")]
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl<T: ServerConnectorError + 'static> From<T> for Error {
    fn from(e: T) -> Self {
        Error::Connection(Box::new(e))
    }
}

impl From<veery_jid::Error> for Error {
    fn from(e: veery_jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

#[cfg(feature = "dns")]
impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

#[cfg(feature = "dns")]
impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

#[cfg(feature = "dns")]
impl From<DnsProtoError> for Error {
    fn from(e: DnsProtoError) -> Error {
        Error::Dns(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// An element did not match its expected schema
    Parse(ParseError),
    /// The server offers no TLS, but local policy requires it
    TlsUnavailable,
    /// The server answered the STARTTLS request with a failure
    TlsRefused,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// The server predates XMPP 1.0 and legacy authentication is
    /// disabled
    UnsupportedVersion,
    /// Received an unexpected element during stream negotiation
    UnexpectedElement,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parse(e) => write!(fmt, "error with expected element schema: {}", e),
            ProtocolError::TlsUnavailable => write!(fmt, "no TLS available"),
            ProtocolError::TlsRefused => write!(fmt, "server refused the TLS negotiation"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::UnsupportedVersion => {
                write!(fmt, "server does not support XMPP 1.0")
            }
            ProtocolError::UnexpectedElement => {
                write!(fmt, "unexpected element during stream negotiation")
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<ParseError> for ProtocolError {
    fn from(e: ParseError) -> Self {
        ProtocolError::Parse(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        ProtocolError::Parse(e).into()
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No mechanism both sides support and have credentials for
    MechanismMismatch,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// The server rejected the credentials
    NotAuthorized,
    /// The account is disabled
    AccountDisabled,
    /// The credentials have expired
    CredentialsExpired,
    /// The mechanism requires an encrypted stream
    EncryptionRequired,
    /// The exchange derailed (malformed data, unexpected elements, ...)
    ProcessingError,
    /// SASL-2 requested follow-up tasks (e.g. 2FA) this client cannot
    /// perform
    RequiredTasks(Vec<String>),
}

impl AuthError {
    /// Map a protocol-level SASL failure condition onto the error
    /// variants surfaced to callers.
    pub(crate) fn from_condition(condition: SaslCondition) -> AuthError {
        match condition {
            SaslCondition::AccountDisabled => AuthError::AccountDisabled,
            SaslCondition::CredentialsExpired => AuthError::CredentialsExpired,
            SaslCondition::EncryptionRequired => AuthError::EncryptionRequired,
            SaslCondition::IncorrectEncoding
            | SaslCondition::InvalidAuthzid
            | SaslCondition::InvalidMechanism
            | SaslCondition::MalformedRequest
            | SaslCondition::MechanismTooWeak => AuthError::ProcessingError,
            SaslCondition::Aborted
            | SaslCondition::NotAuthorized
            | SaslCondition::TemporaryAuthFailure => AuthError::NotAuthorized,
        }
    }
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::MechanismMismatch => {
                write!(fmt, "no usable SASL mechanism available")
            }
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::NotAuthorized => write!(fmt, "not authorized"),
            AuthError::AccountDisabled => write!(fmt, "account disabled"),
            AuthError::CredentialsExpired => write!(fmt, "credentials expired"),
            AuthError::EncryptionRequired => write!(fmt, "mechanism requires encryption"),
            AuthError::ProcessingError => write!(fmt, "authentication processing error"),
            AuthError::RequiredTasks(tasks) => {
                write!(fmt, "server requires unsupported tasks: {}", tasks.join(", "))
            }
        }
    }
}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}
