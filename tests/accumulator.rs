use std::sync::Arc;
use std::time::Duration;

use mockito::Server;

use log_forwarder::buffer::{BatchAccumulator, BufferConfig};
use log_forwarder::client::DeliveryClient;
use log_forwarder::config::{ClientConfig, Credential, ProxyConfig};
use log_forwarder::record::Record;
use log_forwarder::retry::{deliver_with_retry, RetryPolicy};

const PATH: &str = "/log/v1";

fn client(server: &Server) -> Arc<DeliveryClient> {
    let config = ClientConfig::new(
        format!("{}{}", server.url(), PATH),
        Credential::ApiKey("mock-api-key".to_string()),
    );
    let proxy = ProxyConfig {
        ignore_system_proxy: true,
        ..ProxyConfig::default()
    };
    Arc::new(DeliveryClient::new(&config, &proxy).expect("failed to create client"))
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn count_triggered_flush_is_delivered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut accumulator =
        BatchAccumulator::new(BufferConfig::new(2, Duration::from_secs(60)), client(&server));

    assert!(accumulator.add(Record::new()).is_none());
    let flush = accumulator
        .add(Record::new())
        .expect("second record should trigger a flush");

    let report = flush.await.expect("flush should be accepted");
    assert_eq!(report.records, 2);
    assert!(accumulator.is_empty());
    assert!(!accumulator.should_flush());
    mock.assert_async().await;
}

#[tokio::test]
async fn time_triggered_flush_is_delivered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut accumulator = BatchAccumulator::new(
        BufferConfig::new(usize::MAX, Duration::from_millis(200)),
        client(&server),
    );

    assert!(accumulator.add(Record::new()).is_none());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let flush = accumulator
        .add(Record::new())
        .expect("elapsed time should trigger a flush");
    assert_eq!(flush.len(), 2);

    flush.await.unwrap();
    assert!(accumulator.is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn forced_flush_drains_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut accumulator =
        BatchAccumulator::new(BufferConfig::new(100, Duration::from_secs(60)), client(&server));
    for i in 0..5 {
        assert!(accumulator.add(Record::new().with("n", i)).is_none());
    }

    assert!(!accumulator.is_empty());
    let report = accumulator.flush().await.unwrap();
    assert_eq!(report.records, 5);
    assert!(accumulator.is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn retryable_flush_is_resent_until_retries_run_out() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let mut accumulator =
        BatchAccumulator::new(BufferConfig::new(1, Duration::from_secs(60)), client(&server));
    let flush = accumulator.add(Record::new()).unwrap();

    let err = deliver_with_retry(&flush, &fast_policy(2)).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 503);
    mock.assert_async().await;
}

#[tokio::test]
async fn terminal_flush_is_not_resent() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .with_status(400)
        .expect(1)
        .create_async()
        .await;

    let mut accumulator =
        BatchAccumulator::new(BufferConfig::new(1, Duration::from_secs(60)), client(&server));
    let flush = accumulator.add(Record::new()).unwrap();

    let err = deliver_with_retry(&flush, &fast_policy(3)).await.unwrap_err();
    assert!(!err.is_retryable());
    mock.assert_async().await;
}
