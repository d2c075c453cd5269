// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;

use futures::{future::select_ok, FutureExt};
use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, IntoName, TokioAsyncResolver,
};
use log::debug;
use rand::Rng;
use tokio::net::TcpStream;

use crate::Error;

/// How to find the XMPP server to talk to.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Resolve SRV records, in priority/weight order, with an address
    /// fallback.
    UseSrv {
        /// The domain to resolve records for.
        host: String,
        /// The service label, e.g. `_xmpp-client._tcp`.
        srv: String,
        /// The port to use when no SRV records exist.
        fallback_port: u16,
    },

    /// Skip SRV resolution and connect to the given host and port.
    NoSrv {
        /// Server host name.
        host: String,
        /// Server port.
        port: u16,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseSrv { host, .. } => write!(f, "{}", host),
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// A resolved connection candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub(crate) priority: u16,
    pub(crate) weight: u16,
    pub(crate) target: String,
    pub(crate) port: u16,
}

/// Order candidates per RFC 2782: ascending priority; within one
/// priority, repeated weighted random selection (zero weights come last
/// with a minimal chance).
pub(crate) fn sort_candidates<R: Rng>(mut candidates: Vec<Candidate>, rng: &mut R) -> Vec<Candidate> {
    candidates.sort_by_key(|c| c.priority);
    let mut ordered = Vec::with_capacity(candidates.len());
    let mut group: Vec<Candidate> = Vec::new();
    let mut drain_group = |group: &mut Vec<Candidate>, ordered: &mut Vec<Candidate>| {
        while !group.is_empty() {
            let total: u32 = group.iter().map(|c| c.weight as u32 + 1).sum();
            let mut pick = rng.gen_range(0..total);
            let mut index = 0;
            for (i, candidate) in group.iter().enumerate() {
                let weight = candidate.weight as u32 + 1;
                if pick < weight {
                    index = i;
                    break;
                }
                pick -= weight;
            }
            ordered.push(group.remove(index));
        }
    };
    for candidate in candidates {
        if let Some(first) = group.first() {
            if first.priority != candidate.priority {
                drain_group(&mut group, &mut ordered);
            }
        }
        group.push(candidate);
    }
    drain_group(&mut group, &mut ordered);
    ordered
}

impl DnsConfig {
    /// Constructor for the `UseSrv` variant.
    pub fn srv(host: &str, srv: &str, fallback_port: u16) -> Self {
        Self::UseSrv {
            host: host.to_string(),
            srv: srv.to_string(),
            fallback_port,
        }
    }

    /// The default SRV resolution strategy for clients.
    pub fn srv_default_client(host: &str) -> Self {
        Self::srv(host, "_xmpp-client._tcp", 5222)
    }

    /// Constructor for the `NoSrv` variant.
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_string(),
            port,
        }
    }

    /// Resolve this config to a connected `TcpStream`.
    pub async fn resolve(&self) -> Result<TcpStream, Error> {
        match self {
            Self::UseSrv {
                host,
                srv,
                fallback_port,
            } => Self::resolve_srv(host, srv, *fallback_port).await,
            Self::NoSrv { host, port } => Self::resolve_no_srv(host, *port).await,
        }
    }

    async fn resolve_srv(host: &str, srv: &str, fallback_port: u16) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse() {
            debug!("Attempting connection to {ip}:{fallback_port}");
            return Ok(TcpStream::connect(&SocketAddr::new(ip, fallback_port)).await?);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;

        let srv_domain = format!("{}.{}.", srv, ascii_domain).into_name()?;
        let srv_records = resolver.srv_lookup(srv_domain.clone()).await.ok();

        match srv_records {
            Some(lookup) => {
                let candidates = sort_candidates(
                    lookup
                        .iter()
                        .map(|srv| Candidate {
                            priority: srv.priority(),
                            weight: srv.weight(),
                            target: srv.target().to_ascii(),
                            port: srv.port(),
                        })
                        .collect(),
                    &mut rand::thread_rng(),
                );
                if candidates.is_empty() {
                    debug!("'{srv_domain}' exists but has no records; trying {host}:{fallback_port}");
                    return Self::resolve_no_srv(host, fallback_port).await;
                }
                let mut last_error = Error::Disconnected;
                for candidate in candidates {
                    debug!(
                        "Attempting connection to {} {}:{}",
                        srv_domain, candidate.target, candidate.port
                    );
                    match Self::resolve_no_srv(&candidate.target, candidate.port).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => last_error = e,
                    }
                }
                Err(last_error)
            }
            None => {
                // SRV lookup failure: fall back to the domain itself.
                debug!("Attempting connection to {host}:{fallback_port}");
                Self::resolve_no_srv(host, fallback_port).await
            }
        }
    }

    async fn resolve_no_srv(host: &str, port: u16) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;

        if let Ok(ip) = ascii_domain.parse() {
            return Ok(TcpStream::connect(&SocketAddr::new(ip, port)).await?);
        }

        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());

        let ips = resolver.lookup_ip(ascii_domain).await?;

        // Happy Eyeballs: connect to all records in parallel, return the
        // first to succeed
        select_ok(
            ips.into_iter()
                .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
        )
        .await
        .map(|(result, _)| result)
        .map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn candidate(priority: u16, weight: u16, target: &str) -> Candidate {
        Candidate {
            priority,
            weight,
            target: target.to_owned(),
            port: 5222,
        }
    }

    #[test]
    fn priorities_are_strictly_ascending() {
        let mut rng = StepRng::new(0, 0x9e3779b97f4a7c15);
        let sorted = sort_candidates(
            vec![
                candidate(20, 0, "b"),
                candidate(5, 0, "a"),
                candidate(10, 50, "c"),
                candidate(10, 50, "d"),
            ],
            &mut rng,
        );
        assert_eq!(sorted[0].target, "a");
        assert_eq!(sorted[3].target, "b");
        assert_eq!(sorted[1].priority, 10);
        assert_eq!(sorted[2].priority, 10);
    }

    #[test]
    fn zero_weight_groups_survive_selection() {
        let mut rng = StepRng::new(0, 1);
        let sorted = sort_candidates(
            vec![candidate(1, 0, "a"), candidate(1, 0, "b")],
            &mut rng,
        );
        assert_eq!(sorted.len(), 2);
    }

    #[test]
    fn all_candidates_are_kept() {
        let mut rng = StepRng::new(7, 13);
        let sorted = sort_candidates(
            (0..16)
                .map(|i| candidate(i % 3, i * 5, &format!("host-{i}")))
                .collect(),
            &mut rng,
        );
        assert_eq!(sorted.len(), 16);
    }
}
