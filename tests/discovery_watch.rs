//! Discovery and child-watch tests for minirpc

use minirpc::common::ApplicationConfig;
use minirpc::coord::{CoordinationClient, CreateMode, MemoryTree};
use minirpc::registry::{ReferenceDescriptor, ServiceDescriptor};
use minirpc::transport::loopback::{LoopbackNetwork, LoopbackServer, LoopbackTransport, ServiceImpl};
use minirpc::{ApplicationRegistrar, ConsumerRegistrar, Error, ProviderRegistrar};
use std::sync::Arc;
use std::time::Duration;

const PROVIDERS: &str = "/soa/test/trade/orders_1.0.0/loopback/Echo_1.0/providers";

fn app(tree: &Arc<MemoryTree>, host: &str) -> ApplicationRegistrar {
    ApplicationRegistrar::builder(ApplicationConfig::new("orders", "trade", "alice", "test"))
        .client(Arc::new(tree.session()))
        .host(host)
        .build()
        .unwrap()
}

fn consumer(
    app: &ApplicationRegistrar,
    network: &Arc<LoopbackNetwork>,
) -> ConsumerRegistrar<LoopbackTransport> {
    ConsumerRegistrar::builder("loopback", Arc::new(LoopbackTransport::new(Arc::clone(network))))
        .references(vec![ReferenceDescriptor::new("loopback", "Echo", "1.0")])
        .build(app)
        .unwrap()
}

async fn provider(
    tree: &Arc<MemoryTree>,
    network: &Arc<LoopbackNetwork>,
    host: &str,
    weight: i64,
) -> ProviderRegistrar {
    let app = app(tree, host);
    let server = Arc::new(
        LoopbackServer::new(Arc::clone(network)).implement("Echo", ServiceImpl::new()),
    );
    let provider = ProviderRegistrar::new(
        &app,
        "loopback",
        9100,
        server,
        vec![ServiceDescriptor::new("loopback", "Echo", "1.0", 9100).with_weight(weight)],
    )
    .unwrap();
    provider.register().await.unwrap();
    provider
}

fn entries(consumer: &ConsumerRegistrar<LoopbackTransport>) -> Vec<String> {
    let mut list = consumer
        .book()
        .snapshot("Echo_1.0")
        .map(|l| l.to_vec())
        .unwrap_or_default();
    list.sort();
    list
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_weight_expands_into_repeated_entries() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let _p = provider(&tree, &network, "10.0.0.1", 3).await;

    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();

    assert_eq!(entries(&c), vec!["10.0.0.1:9100"; 3]);
}

#[tokio::test]
async fn test_watch_tracks_providers_joining_and_leaving() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();
    assert!(entries(&c).is_empty());

    let p1 = provider(&tree, &network, "10.0.0.1", 1).await;
    let _p2 = provider(&tree, &network, "10.0.0.2", 2).await;
    assert!(
        eventually(|| entries(&c) == vec!["10.0.0.1:9100", "10.0.0.2:9100", "10.0.0.2:9100"]).await
    );

    p1.disable("Echo", "ops").await.unwrap();
    assert!(eventually(|| entries(&c) == vec!["10.0.0.2:9100", "10.0.0.2:9100"]).await);
}

#[tokio::test]
async fn test_repeated_discovery_keeps_watched_list() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let _p1 = provider(&tree, &network, "10.0.0.1", 1).await;
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();

    let _p2 = provider(&tree, &network, "10.0.0.2", 1).await;
    assert!(eventually(|| entries(&c) == vec!["10.0.0.1:9100", "10.0.0.2:9100"]).await);
    let before = c.book().snapshot("Echo_1.0").unwrap();

    c.discovery().await.unwrap();
    let after = c.book().snapshot("Echo_1.0").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(entries(&c), vec!["10.0.0.1:9100", "10.0.0.2:9100"]);
    assert_eq!(c.watched_keys(), vec!["Echo_1.0"]);

    let _p3 = provider(&tree, &network, "10.0.0.3", 1).await;
    assert!(eventually(|| entries(&c).len() == 3).await);
}

#[tokio::test]
async fn test_removal_drops_one_occurrence_per_weight() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();

    let writer = tree.session();
    writer
        .create(&format!("{}/h1:100:2", PROVIDERS), vec![], CreateMode::Ephemeral)
        .await
        .unwrap();
    assert!(eventually(|| entries(&c) == vec!["h1:100", "h1:100"]).await);

    writer
        .create(&format!("{}/h1:100:1", PROVIDERS), vec![], CreateMode::Ephemeral)
        .await
        .unwrap();
    assert!(eventually(|| entries(&c).len() == 3).await);

    writer.delete(&format!("{}/h1:100:1", PROVIDERS)).await.unwrap();
    assert!(eventually(|| entries(&c) == vec!["h1:100", "h1:100"]).await);
}

#[tokio::test]
async fn test_malformed_child_is_ignored() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let _p = provider(&tree, &network, "10.0.0.1", 1).await;
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();

    let writer = tree.session();
    writer
        .create(&format!("{}/not-a-node", PROVIDERS), vec![], CreateMode::Persistent)
        .await
        .unwrap();
    writer
        .create(&format!("{}/h9:900:1", PROVIDERS), vec![], CreateMode::Persistent)
        .await
        .unwrap();
    assert!(eventually(|| entries(&c) == vec!["10.0.0.1:9100", "h9:900"]).await);
}

#[tokio::test]
async fn test_import_references_is_incremental() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);
    c.discovery().await.unwrap();
    assert_eq!(c.watched_keys(), vec!["Echo_1.0"]);

    c.import_references(vec![
        ReferenceDescriptor::new("loopback", "Echo", "2.0"),
        ReferenceDescriptor::new("loopback", "Clock", "1.0"),
    ])
    .await
    .unwrap();

    assert_eq!(c.watched_keys(), vec!["Clock_1.0", "Echo_1.0"]);
    let versions: Vec<String> = c.references().into_iter().map(|r| r.version).collect();
    assert_eq!(versions, vec!["1.0", "1.0"]);
    assert!(tree
        .paths()
        .contains(&"/soa/test/trade/orders_1.0.0/loopback/Clock_1.0/consumers/10.0.0.9".to_string()));
    assert!(c.book().contains("Clock_1.0"));
}

#[tokio::test]
async fn test_import_before_discovery_only_records() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);

    c.import_references(vec![ReferenceDescriptor::new("loopback", "Clock", "1.0")])
        .await
        .unwrap();
    assert!(c.watched_keys().is_empty());
    assert!(tree.paths().is_empty());

    c.discovery().await.unwrap();
    assert_eq!(c.watched_keys(), vec!["Clock_1.0", "Echo_1.0"]);
}

#[tokio::test]
async fn test_stub_requires_import_and_discovery() {
    let tree = MemoryTree::new();
    let network = LoopbackNetwork::new();
    let app = app(&tree, "10.0.0.9");
    let c = consumer(&app, &network);

    assert!(matches!(c.stub("Clock"), Err(Error::InterfaceNotImported(_))));
    assert!(matches!(c.stub("Echo"), Err(Error::DiscoveryNotInitialized(p)) if p == "loopback"));

    c.discovery().await.unwrap();
    assert!(c.stub("Echo").is_ok());

    c.un_discovery().await.unwrap();
    assert!(matches!(c.stub("Echo"), Err(Error::DiscoveryNotInitialized(_))));
}
