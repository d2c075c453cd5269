// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `tcp::TcpServerConnector` provides plaintext connections, mostly
//! useful for tests and localhost setups.

use alloc::borrow::Cow;

use tokio::{io::BufStream, net::TcpStream};

use veery_jid::Jid;

use crate::connect::{recv_features_or_legacy, ConnectedStream, ServerConnector};
use crate::xmlstream::{initiate_stream, StreamHeader, Timeouts};
use crate::Error;

#[cfg(feature = "dns")]
use crate::connect::DnsConfig;

/// Connect over plain TCP, without any transport security.
#[derive(Debug, Clone)]
pub struct TcpServerConnector {
    #[cfg(feature = "dns")]
    dns: DnsConfig,
    #[cfg(not(feature = "dns"))]
    addr: String,
}

#[cfg(feature = "dns")]
impl From<DnsConfig> for TcpServerConnector {
    fn from(dns: DnsConfig) -> TcpServerConnector {
        Self { dns }
    }
}

impl TcpServerConnector {
    /// Create a connector for the given address.
    #[cfg(not(feature = "dns"))]
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    async fn open(&self) -> Result<TcpStream, Error> {
        #[cfg(feature = "dns")]
        {
            self.dns.resolve().await
        }
        #[cfg(not(feature = "dns"))]
        {
            Ok(TcpStream::connect(&self.addr).await?)
        }
    }
}

impl ServerConnector for TcpServerConnector {
    type Stream = BufStream<TcpStream>;

    async fn connect(
        &self,
        jid: &Jid,
        timeouts: Timeouts,
    ) -> Result<ConnectedStream<Self::Stream>, Error> {
        let stream = BufStream::new(self.open().await?);
        let pending = initiate_stream(
            stream,
            StreamHeader {
                to: Some(Cow::Borrowed(jid.domain())),
                ..StreamHeader::default()
            },
            timeouts,
        )
        .await?;
        Ok(recv_features_or_legacy(pending).await?)
    }

    #[cfg(feature = "dns")]
    fn with_preferred_address(&self, host: &str, port: u16) -> Self {
        Self {
            dns: DnsConfig::no_srv(host, port),
        }
    }
}
