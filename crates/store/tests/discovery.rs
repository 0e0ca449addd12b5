#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kdisc_core::{CompositionNode, KindSchema};
use kdisc_kubehub::StaticCluster;
use kdisc_schema::{FileSource, SchemaHandle, StaticSource};
use kdisc_store::{spawn_discovery, CompositionStore, Discovery, DiscoverySettings};
use serde_json::{json, Value};

fn obj(name: &str, ns: &str, owner: Option<&str>, status: Value) -> Value {
    let mut meta = json!({ "name": name, "namespace": ns });
    if let Some(o) = owner {
        meta["ownerReferences"] = json!([{ "name": o, "kind": "Owner", "apiVersion": "v1" }]);
    }
    json!({ "metadata": meta, "status": status })
}

fn web_cluster() -> StaticCluster {
    StaticCluster::new()
        .with_namespaces(&["default", "empty"])
        .with_items(
            "apis/apps/v1",
            "deployments",
            "default",
            vec![obj("web", "default", None, json!({ "replicas": 1, "readyReplicas": 1, "availableReplicas": 1 }))],
        )
        .with_items("apis/apps/v1", "replicasets", "default", vec![obj("web-abc123", "default", Some("web"), json!({}))])
        .with_items(
            "api/v1",
            "pods",
            "default",
            vec![
                obj("web-abc123-x1", "default", Some("web-abc123"), json!({ "phase": "Running" })),
                obj("web-abc123-x2", "default", Some("web-abc123"), json!({ "phase": "Running" })),
            ],
        )
}

fn discovery(cluster: StaticCluster, store: Arc<CompositionStore>) -> Discovery {
    Discovery {
        cluster: Arc::new(cluster),
        source: Arc::new(StaticSource::default()),
        schema: SchemaHandle::default(),
        store,
        settings: DiscoverySettings::default(),
    }
}

#[tokio::test]
async fn cycle_builds_every_top_level_instance() {
    let store = Arc::new(CompositionStore::new());
    let d = discovery(web_cluster(), Arc::clone(&store));
    let report = d.run_cycle(1).await;

    assert!(report.scanned);
    assert_eq!(report.namespaces, 2);
    assert_eq!(report.kinds, 7);
    // 1 deployment + 1 replicaset + 2 pods
    assert_eq!(report.roots, 4);
    assert_eq!(report.failed_calls, 0);

    let got = store.query("Deployment", "web", "default");
    assert_eq!(got.len(), 1);
    let web = &got[0];
    assert_eq!(web.status, "Ready");
    assert_eq!(web.children[0].name, "web-abc123");
    assert_eq!(web.children[0].children.len(), 2);
    assert!(web.children[0].children.iter().all(|p| p.level == 3 && p.children.is_empty()));

    assert_eq!(store.query("Pod", "*", "default").len(), 2);
}

#[tokio::test]
async fn vanished_objects_are_purged_next_cycle() {
    let store = Arc::new(CompositionStore::new());
    store.upsert("ConfigMap", "orphan", "default", "", CompositionNode::leaf(1, "ConfigMap", "orphan", "default", ""));
    let report = discovery(web_cluster(), Arc::clone(&store)).run_cycle(1).await;
    assert_eq!(report.purged, 1);
    assert!(store.query("ConfigMap", "orphan", "default").is_empty());
}

#[tokio::test]
async fn failed_scope_keeps_its_records() {
    let store = Arc::new(CompositionStore::new());
    discovery(web_cluster(), Arc::clone(&store)).run_cycle(1).await;
    assert_eq!(store.len(), 4);

    let flaky = web_cluster().fail_path("/apis/apps/v1/namespaces/default/deployments");
    let report = discovery(flaky, Arc::clone(&store)).run_cycle(2).await;
    assert_eq!(report.failed_calls, 1);
    assert_eq!(report.purged, 0);
    assert_eq!(store.query("Deployment", "web", "default").len(), 1);
}

#[tokio::test]
async fn namespace_failure_skips_scan_and_purge() {
    let store = Arc::new(CompositionStore::new());
    discovery(web_cluster(), Arc::clone(&store)).run_cycle(1).await;

    let report = discovery(web_cluster().fail_namespaces(), Arc::clone(&store)).run_cycle(2).await;
    assert!(!report.scanned);
    assert_eq!(report.roots, 0);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn schema_error_keeps_previous_schema() {
    let store = Arc::new(CompositionStore::new());
    let schema = SchemaHandle::default();
    schema
        .refresh(&StaticSource::new(vec![KindSchema::new("Etcd", "etcds", "apis/etcd.database.coreos.com/v1beta2", &["Pod"])]))
        .await
        .unwrap();
    let cluster = StaticCluster::new()
        .with_namespaces(&["db"])
        .with_items("apis/etcd.database.coreos.com/v1beta2", "etcds", "db", vec![obj("main", "db", None, json!({}))])
        .with_items("api/v1", "pods", "db", vec![obj("main-0", "db", Some("main"), json!({ "phase": "Running" }))]);
    let d = Discovery {
        cluster: Arc::new(cluster),
        source: Arc::new(FileSource::new("/nonexistent/kind-composition.yaml")),
        schema,
        store: Arc::clone(&store),
        settings: DiscoverySettings::default(),
    };
    let report = d.run_cycle(1).await;
    assert!(report.schema_error.is_some());
    assert_eq!(report.kinds, 8);
    let etcd = store.query("etcds", "main", "db");
    assert!(etcd.is_empty(), "store matches kind keys, not plurals");
    let etcd = store.query("Etcd", "main", "db");
    assert_eq!(etcd[0].children[0].name, "main-0");
}

#[tokio::test]
async fn cluster_scoped_roots_are_built_once() {
    let cluster = StaticCluster::new().with_namespaces(&["a", "b", "c"]).respond(
        "/api/v1/persistentvolumes",
        json!({ "items": [ { "metadata": { "name": "pv0" }, "status": { "phase": "Bound" } } ] }),
    );
    let store = Arc::new(CompositionStore::new());
    let report = discovery(cluster, Arc::clone(&store)).run_cycle(1).await;
    assert_eq!(report.roots, 1);
    let pv = store.query("PersistentVolume", "pv0", "");
    assert_eq!(pv.len(), 1);
    assert_eq!(pv[0].status, "Bound");
}

#[tokio::test]
async fn spawned_loop_publishes_reports() {
    let store = Arc::new(CompositionStore::new());
    let mut d = discovery(web_cluster(), Arc::clone(&store));
    d.settings = DiscoverySettings { interval: Duration::from_millis(10), ..DiscoverySettings::default() };
    let handle = spawn_discovery(d);
    let mut rx = handle.subscribe();

    let report = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.unwrap();
            let latest = rx.borrow().clone();
            if let Some(r) = latest.filter(|r| r.epoch >= 2) {
                break r;
            }
        }
    })
    .await
    .unwrap();
    assert!(report.scanned);
    assert_eq!(store.len(), 4);
    handle.abort();
}

#[tokio::test]
async fn cluster_scoped_root_lists_children_in_first_namespace() {
    let source = StaticSource::new(vec![KindSchema::new(
        "PersistentVolume",
        "persistentvolumes",
        "api/v1/persistentvolumes",
        &["Pod"],
    )]);
    let cluster = StaticCluster::new()
        .with_namespaces(&["a", "b"])
        .respond("/api/v1/persistentvolumes", json!({ "items": [ { "metadata": { "name": "pv0" } } ] }))
        .with_items("api/v1", "pods", "a", vec![obj("pod-a", "a", Some("pv0"), json!({ "phase": "Running" }))])
        .with_items("api/v1", "pods", "b", vec![obj("pod-b", "b", Some("pv0"), json!({ "phase": "Running" }))]);
    let store = Arc::new(CompositionStore::new());
    let mut d = discovery(cluster, Arc::clone(&store));
    d.source = Arc::new(source);
    let report = d.run_cycle(1).await;

    // pv0 plus both pods as roots of their own
    assert_eq!(report.roots, 3);
    let pv = store.query("PersistentVolume", "pv0", "");
    assert_eq!(pv.len(), 1);
    let children: Vec<&str> = pv[0].children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(children, ["pod-a"]);
    assert_eq!(pv[0].children[0].namespace, "a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_see_partial_trees() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let store = Arc::new(CompositionStore::new());
    let mut d = discovery(web_cluster(), Arc::clone(&store));
    d.settings = DiscoverySettings { interval: Duration::from_millis(1), ..DiscoverySettings::default() };
    let handle = spawn_discovery(d);
    let mut rx = handle.subscribe();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut full = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let got = store.query("Deployment", "*", "default");
                match got.as_slice() {
                    [] => {}
                    [web] => {
                        // web -> web-abc123 -> two pods
                        assert_eq!(web.node_count(), 4, "partial tree: {web:?}");
                        full += 1;
                    }
                    more => panic!("unexpected results: {more:?}"),
                }
                tokio::task::yield_now().await;
            }
            full
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.unwrap();
            if rx.borrow().as_ref().is_some_and(|r| r.epoch >= 3) {
                break;
            }
        }
    })
    .await
    .unwrap();
    handle.abort();
    stop.store(true, Ordering::Relaxed);
    let full = reader.await.unwrap();
    assert!(full > 0);
}
