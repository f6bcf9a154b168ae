use crate::client::{Client, Config};
use crate::fake::FakeRwClient;
use crate::proto::{encode_write_request, WriteRequest};
use crate::{RemoteWriteError, RwClient};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use oxrule_common::types::{is_stale_nan, stale_nan};
use oxrule_common::{Label, Sample, TimeSeries};
use prost::Message;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn series(name: &str, value: f64) -> TimeSeries {
    TimeSeries::from_labels(
        vec![Label::new("__name__", name), Label::new("job", "test")],
        vec![Sample {
            value,
            timestamp: 1_700_000_000_000,
        }],
    )
}

fn decode(body: &[u8]) -> WriteRequest {
    let raw = snap::raw::Decoder::new().decompress_vec(body).unwrap();
    WriteRequest::decode(raw.as_slice()).unwrap()
}

#[derive(Clone, Default)]
struct Received {
    bodies: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
    status: Arc<Mutex<Option<StatusCode>>>,
}

async fn write_handler(State(rx): State<Received>, headers: HeaderMap, body: Bytes) -> StatusCode {
    rx.bodies.lock().unwrap().push((headers, body.to_vec()));
    rx.status.lock().unwrap().unwrap_or(StatusCode::NO_CONTENT)
}

async fn spawn_storage(received: Received) -> String {
    let app = Router::new()
        .route("/api/v1/write", post(write_handler))
        .with_state(received);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[test]
fn stale_marker_survives_encoding() {
    let body = encode_write_request(&[series("foo", stale_nan()), series("bar", 2.0)]).unwrap();
    let req = decode(&body);
    assert_eq!(req.timeseries.len(), 2);
    assert!(is_stale_nan(req.timeseries[0].samples[0].value));
    assert_eq!(req.timeseries[1].samples[0].value, 2.0);
    assert_eq!(req.timeseries[0].labels[0].name, "__name__");
    assert_eq!(req.timeseries[0].labels[0].value, "foo");
}

#[test]
fn body_is_a_raw_snappy_block() {
    let tss = [series("foo", 1.0)];
    let body = encode_write_request(&tss).unwrap();
    let plain = WriteRequest {
        timeseries: tss.iter().map(Into::into).collect(),
    }
    .encode_to_vec();
    // the raw format starts with the uncompressed length, no stream header
    assert_eq!(snap::raw::decompress_len(&body).unwrap(), plain.len());
    assert_ne!(body[..4], [0xff, 0x06, 0x00, 0x00]);
}

#[test]
fn client_rejects_empty_addr() {
    let err = Client::new(Config::default(), reqwest::Client::new()).err().unwrap();
    assert!(matches!(err, RemoteWriteError::InvalidConfig(_)));
}

#[tokio::test]
async fn close_flushes_pending_series() {
    let received = Received::default();
    let addr = spawn_storage(received.clone()).await;
    let cfg = Config {
        addr,
        concurrency: 1,
        flush_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let client = Client::new(cfg, reqwest::Client::new()).unwrap();
    client.push(series("foo", 1.0)).unwrap();
    client.push(series("bar", 2.0)).unwrap();
    client.close().await.unwrap();

    let bodies = received.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let (headers, body) = &bodies[0];
    assert_eq!(headers["content-encoding"], "snappy");
    assert_eq!(headers["x-prometheus-remote-write-version"], "0.1.0");
    assert_eq!(decode(body).timeseries.len(), 2);
}

#[tokio::test]
async fn batches_are_split_by_size() {
    let received = Received::default();
    let addr = spawn_storage(received.clone()).await;
    let cfg = Config {
        addr,
        concurrency: 1,
        max_batch_size: 2,
        flush_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let client = Client::new(cfg, reqwest::Client::new()).unwrap();
    for i in 0..5 {
        client.push(series("foo", f64::from(i))).unwrap();
    }
    client.close().await.unwrap();

    let sizes: Vec<usize> = received
        .bodies
        .lock()
        .unwrap()
        .iter()
        .map(|(_, b)| decode(b).timeseries.len())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let received = Received::default();
    *received.status.lock().unwrap() = Some(StatusCode::BAD_REQUEST);
    let addr = spawn_storage(received.clone()).await;
    let cfg = Config {
        addr,
        concurrency: 1,
        ..Default::default()
    };
    let client = Client::new(cfg, reqwest::Client::new()).unwrap();
    client.push(series("foo", 1.0)).unwrap();
    client.close().await.unwrap();
    assert_eq!(received.bodies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn push_after_close_fails() {
    let received = Received::default();
    let addr = spawn_storage(received).await;
    let client = Client::new(
        Config {
            addr,
            ..Default::default()
        },
        reqwest::Client::new(),
    )
    .unwrap();
    client.close().await.unwrap();
    let err = client.push(series("foo", 1.0)).unwrap_err();
    assert!(matches!(err, RemoteWriteError::Closed));
    assert_eq!(err.to_string(), "RemoteWrite: client is closed");
}

#[test]
fn status_retriability() {
    let st = |status| RemoteWriteError::Status {
        status,
        body: String::new(),
    };
    assert!(!st(400).is_retriable());
    assert!(st(429).is_retriable());
    assert!(st(503).is_retriable());
}

#[tokio::test]
async fn fake_client_records_and_fails_on_demand() {
    let rw = FakeRwClient::new();
    rw.push(series("foo", 1.0)).unwrap();
    assert_eq!(rw.len(), 1);
    rw.set_err("boom");
    assert!(rw.push(series("foo", 2.0)).is_err());
    rw.close().await.unwrap();
    assert!(rw.is_closed());
}
