//! End-to-end invocation tests for minirpc

use minirpc::common::ApplicationConfig;
use minirpc::coord::MemoryTree;
use minirpc::registry::{ReferenceDescriptor, ServiceDescriptor};
use minirpc::transport::loopback::{LoopbackNetwork, LoopbackServer, LoopbackTransport, ServiceImpl};
use minirpc::{ApplicationRegistrar, ConsumerRegistrar, Error, ProviderRegistrar};
use serde_json::{json, Value};
use std::sync::Arc;

const A: &str = "10.0.0.1:9100";
const B: &str = "10.0.0.2:9100";

fn identity() -> ApplicationConfig {
    ApplicationConfig::new("calc", "math", "alice", "test")
}

fn calculator() -> ServiceImpl {
    ServiceImpl::new()
        .method("add", |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        })
        .method("reject", |_| Err(Error::IllegalArgument("negative input".into())))
        .method("flaky", |_| Err(Error::Remote("backend unavailable".into())))
}

struct Cluster {
    network: Arc<LoopbackNetwork>,
    consumer: ConsumerRegistrar<LoopbackTransport>,
    _apps: Vec<ApplicationRegistrar>,
}

impl Cluster {
    fn served(&self) -> (u64, u64) {
        (self.network.served(A), self.network.served(B))
    }
}

async fn cluster(retry: i64) -> Cluster {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let mut apps = Vec::new();

    for host in ["10.0.0.1", "10.0.0.2"] {
        let app = ApplicationRegistrar::builder(identity())
            .client(Arc::new(tree.session()))
            .host(host)
            .build()
            .unwrap();
        let server = Arc::new(LoopbackServer::new(Arc::clone(&network)).implement("Calculator", calculator()));
        let provider = ProviderRegistrar::new(
            &app,
            "loopback",
            9100,
            server,
            vec![ServiceDescriptor::new("loopback", "Calculator", "1.0", 9100)],
        )
        .unwrap();
        provider.register().await.unwrap();
        apps.push(app);
    }

    let app = ApplicationRegistrar::builder(identity())
        .client(Arc::new(tree.session()))
        .host("10.0.0.9")
        .build()
        .unwrap();
    let consumer = ConsumerRegistrar::builder(
        "loopback",
        Arc::new(LoopbackTransport::new(Arc::clone(&network))),
    )
    .references(vec![
        ReferenceDescriptor::new("loopback", "Calculator", "1.0").with_retry(retry)
    ])
    .build(&app)
    .unwrap();
    consumer.discovery().await.unwrap();
    apps.push(app);

    Cluster {
        network,
        consumer,
        _apps: apps,
    }
}

#[tokio::test]
async fn test_calls_rotate_across_providers() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    for _ in 0..6 {
        let sum: i64 = stub.call("add", vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(sum, 5);
    }
    assert_eq!(cluster.served(), (3, 3));
}

#[tokio::test]
async fn test_down_provider_is_retried_elsewhere() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();
    cluster.network.take_down(A);

    for _ in 0..4 {
        let sum: i64 = stub.call("add", vec![json!(1)]).await.unwrap();
        assert_eq!(sum, 1);
    }
    assert_eq!(cluster.served(), (0, 4));
}

#[tokio::test]
async fn test_all_providers_down_surfaces_connection_error() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();
    cluster.network.take_down(A);
    cluster.network.take_down(B);

    let result = stub.call_raw("add", vec![json!(1)]).await;
    assert!(matches!(result, Err(Error::Connection(_))));
}

#[tokio::test]
async fn test_transient_failure_uses_whole_budget() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    let result = stub.call_raw("flaky", vec![]).await;
    assert!(matches!(result, Err(Error::Remote(_))));
    let (a, b) = cluster.served();
    assert_eq!(a + b, 3);
}

#[tokio::test]
async fn test_zero_retry_makes_one_attempt() {
    let cluster = cluster(0).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    assert!(stub.call_raw("flaky", vec![]).await.is_err());
    let (a, b) = cluster.served();
    assert_eq!(a + b, 1);
}

#[tokio::test]
async fn test_illegal_argument_is_not_retried() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    let result = stub.call_raw("reject", vec![]).await;
    assert!(matches!(result, Err(Error::IllegalArgument(_))));
    let (a, b) = cluster.served();
    assert_eq!(a + b, 1);
}

#[tokio::test]
async fn test_sub_cluster_pins_calls() {
    let cluster = cluster(2).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    let pinned = stub.with_sub_cluster(&["10.0.0.2"]).unwrap();
    for _ in 0..4 {
        let _: i64 = pinned.call("add", vec![json!(1)]).await.unwrap();
    }
    assert_eq!(cluster.served(), (0, 4));

    let exact = stub.with_sub_cluster(&["loopback://10.0.0.1:9100"]).unwrap();
    let _: i64 = exact.call("add", vec![json!(1)]).await.unwrap();
    assert_eq!(cluster.served(), (1, 4));

    let unknown = stub.with_sub_cluster(&["10.0.0.3:9100"]).unwrap();
    let result = unknown.call_raw("add", vec![json!(1)]).await;
    assert!(matches!(result, Err(Error::ProviderUriIllegal(_))));
    assert_eq!(cluster.served(), (1, 4));
}

#[tokio::test]
async fn test_unusable_sub_cluster_is_rejected() {
    let cluster = cluster(0).await;
    let stub = cluster.consumer.stub("Calculator").unwrap();

    let empty: [&str; 0] = [];
    assert!(matches!(
        stub.with_sub_cluster(&empty),
        Err(Error::MissingRequiredParameter(_))
    ));
    assert!(matches!(
        stub.with_sub_cluster(&["  "]),
        Err(Error::MissingRequiredParameter(_))
    ));
    assert!(matches!(
        stub.with_sub_cluster(&["10.0.0.1:0"]),
        Err(Error::IllegalParameter(_))
    ));
    assert!(matches!(
        stub.with_sub_cluster(&["10.0.0.1:0", ":9100"]),
        Err(Error::IllegalParameter(_))
    ));

    let partly_valid = stub.with_sub_cluster(&["10.0.0.1:0", "10.0.0.1:9100"]).unwrap();
    for _ in 0..4 {
        let _: i64 = partly_valid.call("add", vec![json!(1)]).await.unwrap();
    }
    assert_eq!(cluster.served(), (4, 0));
}

#[tokio::test]
async fn test_validator_can_reject_a_provider() {
    let cluster = cluster(2).await;
    let stub = cluster
        .consumer
        .stub("Calculator")
        .unwrap()
        .with_validator(|address, _call| {
            if address == A {
                Err(Error::NoAvailableProvider(format!("{} rejected", address)))
            } else {
                Ok(())
            }
        });

    for _ in 0..3 {
        let _: i64 = stub.call("add", vec![json!(1)]).await.unwrap();
    }
    assert_eq!(cluster.served(), (0, 3));
}

#[tokio::test]
async fn test_stub_is_cached_per_reference() {
    let cluster = cluster(5).await;
    let first = cluster.consumer.stub("Calculator").unwrap();
    let second = cluster.consumer.stub("Calculator").unwrap();
    assert_eq!(first.reference(), second.reference());
    assert_eq!(first.reference().retry, 5);
}
