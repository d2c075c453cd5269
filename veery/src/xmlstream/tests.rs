// Copyright (c) 2024 Veery contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::io;

use futures::{SinkExt, StreamExt};

use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::protocol::{AsElement, FromElement, ParseError};

use super::*;

/// A primitive test element: `<data xmlns='urn:example'>text</data>`.
#[derive(Debug, PartialEq)]
struct Data {
    contents: String,
}

impl FromElement for Data {
    fn from_element(element: Element) -> Result<Data, ParseError> {
        if !element.is("data", "urn:example") {
            return Err(ParseError("not a data element"));
        }
        Ok(Data {
            contents: element.text(),
        })
    }
}

impl AsElement for Data {
    fn as_element(&self) -> Element {
        Element::builder("data", "urn:example")
            .append(self.contents.as_str())
            .build()
    }
}

const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='srv-1' from='example.org' version='1.0'>";

async fn connected_pair(
    timeouts: Timeouts,
) -> (XmlStream<tokio::io::BufStream<DuplexStream>, Data>, DuplexStream) {
    let (client_io, mut server_io) = tokio::io::duplex(65536);
    let client = tokio::spawn(async move {
        initiate_stream(
            tokio::io::BufStream::new(client_io),
            StreamHeader {
                to: Some("example.org".into()),
                ..StreamHeader::default()
            },
            timeouts,
        )
        .await
    });
    // Consume the client header, then answer with ours.
    let mut buf = vec![0u8; 1024];
    let n = server_io.read(&mut buf).await.unwrap();
    let header = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(header.contains("to='example.org'"), "header: {header}");
    assert!(header.contains("version='1.0'"), "header: {header}");
    server_io.write_all(SERVER_HEADER.as_bytes()).await.unwrap();

    let pending = client.await.unwrap().unwrap();
    assert_eq!(pending.header().id.as_deref(), Some("srv-1"));
    assert!(pending.header().supports_features());
    (pending.into_stream(), server_io)
}

#[tokio::test]
async fn exchanges_elements() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    client
        .send(&Data {
            contents: "hello".to_owned(),
        })
        .await
        .unwrap();
    let mut buf = vec![0u8; 1024];
    let n = server_io.read(&mut buf).await.unwrap();
    assert_eq!(
        &buf[..n],
        b"<data xmlns='urn:example'>hello</data>" as &[u8]
    );

    server_io
        .write_all(b"<data xmlns='urn:example'>world!</data>")
        .await
        .unwrap();
    match client.next().await {
        Some(Ok(Data { contents })) => assert_eq!(contents, "world!"),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test]
async fn reassembles_split_elements() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    server_io
        .write_all(b"<data xmlns='urn:exa")
        .await
        .unwrap();
    server_io.flush().await.unwrap();
    tokio::task::yield_now().await;
    server_io
        .write_all("mple'>z\u{df}</data>".as_bytes())
        .await
        .unwrap();
    match client.next().await {
        Some(Ok(Data { contents })) => assert_eq!(contents, "z\u{df}"),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test]
async fn whitespace_keepalives_are_invisible() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    server_io.write_all(b" \n ").await.unwrap();
    server_io
        .write_all(b"<data xmlns='urn:example'>after-ws</data>")
        .await
        .unwrap();
    match client.next().await {
        Some(Ok(Data { contents })) => assert_eq!(contents, "after-ws"),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test]
async fn parse_errors_are_recoverable() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    server_io
        .write_all(b"<bogus xmlns='urn:example'><nested/></bogus><data xmlns='urn:example'>ok</data>")
        .await
        .unwrap();
    match client.next().await {
        Some(Err(ReadError::ParseError(_))) => (),
        other => panic!("unexpected stream item: {:?}", other),
    }
    // The next element must parse cleanly despite the earlier mismatch.
    match client.next().await {
        Some(Ok(Data { contents })) => assert_eq!(contents, "ok"),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test]
async fn footer_terminates_the_stream() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    server_io.write_all(b"</stream:stream>").await.unwrap();
    match client.next().await {
        Some(Err(ReadError::StreamFooterReceived)) => (),
        other => panic!("unexpected stream item: {:?}", other),
    }
    // And it stays that way.
    match client.next().await {
        Some(Err(ReadError::StreamFooterReceived)) => (),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test]
async fn close_writes_footer() {
    let (mut client, mut server_io) = connected_pair(Timeouts::disabled()).await;

    SinkExt::<&Data>::close(&mut client).await.unwrap();
    let mut buf = Vec::new();
    server_io.read_to_end(&mut buf).await.unwrap();
    assert_eq!(&buf, b"</stream:stream>");
}

#[tokio::test(start_paused = true)]
async fn soft_then_hard_timeout_on_silence() {
    let timeouts = Timeouts {
        read_timeout: Some(Duration::new(60, 0)),
        response_timeout: Duration::new(20, 0),
    };
    let (mut client, _server_io) = connected_pair(timeouts).await;

    // Nothing happens before the soft timeout...
    match tokio::time::timeout(Duration::new(30, 0), client.next()).await {
        Err(_) => (),
        Ok(ev) => panic!("early stream item (before soft timeout): {:?}", ev),
    }
    // ...then the soft timeout...
    match client.next().await {
        Some(Err(ReadError::SoftTimeout)) => (),
        other => panic!("unexpected stream item: {:?}", other),
    }
    // ...and if the peer stays silent, the hard timeout.
    match client.next().await {
        Some(Err(ReadError::HardError(e))) if e.kind() == io::ErrorKind::TimedOut => (),
        other => panic!("unexpected stream item: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn inbound_whitespace_resets_the_timeouts() {
    let timeouts = Timeouts {
        read_timeout: Some(Duration::new(60, 0)),
        response_timeout: Duration::new(20, 0),
    };
    let (mut client, mut server_io) = connected_pair(timeouts).await;

    for _ in 0..3 {
        // Keep sending whitespace pings just before the deadline; the
        // soft timeout must never trip.
        match tokio::time::timeout(Duration::new(59, 0), client.next()).await {
            Err(_) => (),
            Ok(ev) => panic!("unexpected stream item: {:?}", ev),
        }
        server_io.write_all(b" ").await.unwrap();
    }

    server_io
        .write_all(b"<data xmlns='urn:example'>alive</data>")
        .await
        .unwrap();
    match client.next().await {
        Some(Ok(Data { contents })) => assert_eq!(contents, "alive"),
        other => panic!("unexpected stream item: {:?}", other),
    }
}
