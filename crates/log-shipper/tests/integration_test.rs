// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use log_shipper::{
    compressor::{Codec, ZstdCompressor},
    config::{AgentConfig, FileConfig},
    errors::{ShipperError, SubmitError},
    scheduler::LogLine,
    transport::{
        packet::{FileIndex, LogPacket},
        submit::{HttpSubmitter, Port, Submitter},
        Transport,
    },
};
use mockito::{Matcher, Server};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::time::{sleep, timeout, Duration, Instant};

fn sample_packet() -> LogPacket {
    let index = FileIndex::new(["app.log"]).expect("failed to build file index");
    let mut packet = LogPacket::from_lines(
        &[LogLine::new("app.log", b"critical: disk full".to_vec())],
        &index,
    )
    .expect("failed to build packet");
    packet.namespace = "web".to_string();
    packet
}

fn submitter(url: String) -> HttpSubmitter {
    HttpSubmitter::new(url, Duration::from_secs(5)).expect("failed to build submitter")
}

async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn http_submitter_posts_json_packet() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/HotPort/push")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::PartialJsonString(
            r#"{"namespace":"web","files":{"indexes":[0],"mapTable":["app.log"]}}"#.to_string(),
        ))
        .with_status(200)
        .create_async()
        .await;

    let result = submitter(server.url())
        .submit(Port::Hot, &sample_packet())
        .await;
    assert!(result.is_ok());
    mock.assert_async().await;
}

#[tokio::test]
async fn http_submitter_reports_backpressure() {
    let mut server = Server::new_async().await;
    let unavailable = server
        .mock("POST", "/ColdPort/push")
        .with_status(503)
        .create_async()
        .await;
    let err = submitter(server.url())
        .submit(Port::Cold, &sample_packet())
        .await
        .expect_err("503 should fail");
    assert!(err.is_backpressure());
    unavailable.assert_async().await;

    let mut server = Server::new_async().await;
    let marker = server
        .mock("POST", "/HotPort/push")
        .with_status(500)
        .with_body("Queue is full")
        .create_async()
        .await;
    let err = submitter(server.url())
        .submit(Port::Hot, &sample_packet())
        .await
        .expect_err("500 should fail");
    assert!(err.is_backpressure());
    marker.assert_async().await;
}

#[tokio::test]
async fn http_submitter_reports_fatal_errors() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/HotPort/push")
        .with_status(400)
        .with_body("malformed packet")
        .create_async()
        .await;

    let err = submitter(server.url())
        .submit(Port::Hot, &sample_packet())
        .await
        .expect_err("400 should fail");
    match err {
        SubmitError::Destination { status, message } => {
            assert_eq!(status, Some(400));
            assert_eq!(message, "malformed packet");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn pipeline_ships_hot_and_cold_lines() {
    let mut server = Server::new_async().await;
    let hot = server
        .mock("POST", "/HotPort/push")
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;
    let cold = server
        .mock("POST", "/ColdPort/push")
        .match_body(Matcher::PartialJsonString(
            r#"{"namespace":"web","compressed":true}"#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut file = NamedTempFile::new().expect("failed to create log file");
    let config = AgentConfig {
        namespace: "web".to_string(),
        polling_interval_ms: 20,
        cold_send_threshold: 20,
        cold_timeout_ms: 60_000,
        files: vec![FileConfig {
            filename: file.path().to_string_lossy().into_owned(),
            hot_filter: vec!["error".to_string(), "critical".to_string()],
        }],
        ..Default::default()
    };
    let codec = Codec::Gzip
        .compressor(6)
        .expect("failed to build gzip codec");
    let mut transport = Transport::new(&config, Arc::new(submitter(server.url())), codec, None)
        .expect("failed to build transport");
    let handle = transport.handle();

    let task = tokio::spawn(async move { transport.run().await });
    wait_for(|| !handle.watched_files().is_empty()).await;

    // 6 cold lines of 5 bytes cross the 20 byte threshold once.
    for line in ["critical1", "cold1", "cold2", "cold3", "cold4", "critical2"] {
        writeln!(file, "{line}").expect("failed to write log line");
    }
    file.flush().expect("failed to flush log file");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !(hot.matched_async().await && cold.matched_async().await) && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    hot.assert_async().await;
    cold.assert_async().await;

    handle.close();
    let result = timeout(Duration::from_secs(2), task)
        .await
        .expect("transport did not stop")
        .expect("transport task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn pipeline_stops_on_fatal_destination_error() {
    let mut server = Server::new_async().await;
    let _rejected = server
        .mock("POST", "/HotPort/push")
        .with_status(403)
        .create_async()
        .await;

    let mut file = NamedTempFile::new().expect("failed to create log file");
    let config = AgentConfig {
        polling_interval_ms: 20,
        files: vec![FileConfig {
            filename: file.path().to_string_lossy().into_owned(),
            hot_filter: vec!["error".to_string()],
        }],
        ..Default::default()
    };
    let mut transport = Transport::new(
        &config,
        Arc::new(submitter(server.url())),
        Arc::new(ZstdCompressor::default()),
        None,
    )
    .expect("failed to build transport");
    let handle = transport.handle();

    let task = tokio::spawn(async move { transport.run().await });
    wait_for(|| !handle.watched_files().is_empty()).await;
    writeln!(file, "ERROR: cannot reach database").expect("failed to write log line");
    file.flush().expect("failed to flush log file");

    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("transport did not stop")
        .expect("transport task panicked");
    assert!(matches!(
        result,
        Err(ShipperError::Submit(SubmitError::Destination {
            status: Some(403),
            ..
        }))
    ));
    assert!(!handle.is_running());
}

#[test]
fn transport_rejects_invalid_configuration() {
    let file = NamedTempFile::new().expect("failed to create log file");
    let name = file.path().to_string_lossy().into_owned();
    let config = AgentConfig {
        files: vec![
            FileConfig {
                filename: name.clone(),
                hot_filter: vec![],
            },
            FileConfig {
                filename: name,
                hot_filter: vec![],
            },
        ],
        ..Default::default()
    };
    let result = Transport::new(
        &config,
        Arc::new(submitter("http://localhost:8972".to_string())),
        Arc::new(ZstdCompressor::default()),
        None,
    );
    assert!(matches!(result, Err(ShipperError::Config(_))));
}
