// End-to-end driver tests against the in-memory cluster in tests/common.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use common::{deployer, deployment, test_config, FakeCluster};
use shipyard::distribute;
use shipyard::error::Error;
use shipyard::plugin::{NetworkBuilder, Registry, PARAMS_PATH};
use shipyard::state::Key;
use shipyard::types::{ServiceSpec, SidecarSpec};
use serde_json::{json, Value};
use shipyard::{BuildContext, Result};

#[tokio::test]
async fn five_nodes_fill_the_first_server_before_the_second() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[3, 4], 5);

    let report = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .expect("build succeeds");

    let nums: Vec<usize> = report.new_nodes.iter().map(|n| n.num).collect();
    assert_eq!(nums, vec![0, 1, 2, 3, 4]);
    assert_eq!(doc.servers[0].nodes, 3);
    assert_eq!(doc.servers[1].nodes, 2);
    assert_eq!(doc.build_id, Some(report.build_id));

    let a = cluster.host("host-0");
    let b = cluster.host("host-1");
    assert_eq!(a.containers(), vec!["tn-node1-0", "tn-node1-1", "tn-node1-2"]);
    assert_eq!(b.containers(), vec!["tn-node2-0", "tn-node2-1"]);
    assert_eq!(a.networks(), vec!["tn-net0", "tn-net1", "tn-net2"]);

    assert_eq!(a.container("tn-node1-1").unwrap().ip.as_deref(), Some("10.1.0.10"));
    assert_eq!(b.container("tn-node2-0").unwrap().ip.as_deref(), Some("10.2.0.2"));
    assert_eq!(doc.servers[1].ips, vec![
        "10.2.0.2".parse::<std::net::Ipv4Addr>().unwrap(),
        "10.2.0.10".parse().unwrap(),
    ]);

    // one routing flush per server that got nodes
    assert_eq!(a.routing_flushes(), 1);
    assert_eq!(b.routing_flushes(), 1);
    assert_eq!(report.labels.len(), 5);
    let unique: BTreeSet<&String> = report.labels.iter().collect();
    assert_eq!(unique.len(), 5, "labels repeat: {:?}", report.labels);
}

#[tokio::test]
async fn capacity_shortfall_fails_before_any_remote_work() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2, 2], 5);
    let before = doc.clone();

    let err = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::CapacityExceeded {
            requested: 5,
            available: 4
        }
    ));
    assert_eq!(cluster.command_count(), 0);
    assert_eq!(doc, before);
}

#[tokio::test]
async fn failed_node_is_reported_and_siblings_stay_up() {
    let cluster = FakeCluster::new();
    cluster.host("host-0").fail_when("--name tn-node1-1 ");
    let mut doc = deployment(&[4], 3);

    let err = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap_err();

    let failures = err.failures();
    assert_eq!(failures.len(), 1, "unexpected failures: {}", err);
    assert!(failures[0].target.contains("tn-node1-1"));
    assert!(err.to_string().contains("node provisioning"));

    // no rollback
    let host = cluster.host("host-0");
    assert_eq!(host.containers(), vec!["tn-node1-0", "tn-node1-2"]);
    assert_eq!(host.networks(), vec!["tn-net0", "tn-net1", "tn-net2"]);
}

fn metrics_sidecar() -> SidecarSpec {
    SidecarSpec {
        name: "metrics".into(),
        image: "prom/node-exporter".into(),
        env: BTreeMap::new(),
        resources: Default::default(),
    }
}

fn collector_service() -> ServiceSpec {
    ServiceSpec {
        name: "collector".into(),
        image: "grafana/loki".into(),
        env: BTreeMap::new(),
        ports: vec!["3100:3100".into()],
        entrypoint: None,
        args: vec![],
    }
}

#[tokio::test]
async fn destroy_is_idempotent_when_containers_are_already_gone() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[4], 4);
    doc.details.sidecars = vec![metrics_sidecar()];
    doc.details.services = vec![collector_service()];
    let deployer = deployer(&cluster, test_config());
    deployer.build(&mut doc).await.unwrap();

    let host = cluster.host("host-0");
    assert_eq!(host.containers().len(), 9);
    assert_eq!(host.networks().len(), 5);
    assert!(host.networks().contains(&"tn-services".to_string()));
    host.remove_container("tn-node1-2");

    deployer.destroy(&mut doc).await.expect("destroy succeeds");
    assert!(host.containers().is_empty(), "left: {:?}", host.containers());
    assert!(host.networks().is_empty(), "left: {:?}", host.networks());
    assert!(doc.nodes.is_empty());
    assert_eq!(doc.servers[0].nodes, 0);
    assert_eq!(doc.build_id, None);
    assert!(doc.scratch.is_empty());

    deployer.destroy(&mut doc).await.expect("second destroy succeeds");
}

#[tokio::test]
async fn destroy_keeps_going_when_container_removal_fails() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2], 2);
    doc.details.services = vec![collector_service()];
    let deployer = deployer(&cluster, test_config());
    deployer.build(&mut doc).await.unwrap();

    let host = cluster.host("host-0");
    host.fail_when("grep -E '^tn-node'");
    let err = deployer.destroy(&mut doc).await.unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert!(err.to_string().contains("containers on host-0"), "{}", err);

    // services and networks were still removed
    assert_eq!(host.containers(), vec!["tn-node1-0", "tn-node1-1"]);
    assert!(host.networks().is_empty());
    assert_eq!(doc.nodes.len(), 2);
}

#[tokio::test]
async fn unreachable_server_does_not_stop_destroy_elsewhere() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2, 2], 4);
    let deployer = deployer(&cluster, test_config());
    deployer.build(&mut doc).await.unwrap();

    cluster.cut_off("host-1");
    let err = deployer.destroy(&mut doc).await.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1, "unexpected failures: {}", err);
    assert!(failures[0].target.contains("host-1"));
    assert!(failures[0].message.contains("unreachable"));

    let a = cluster.host("host-0");
    assert!(a.containers().is_empty());
    assert!(a.networks().is_empty());
    assert_eq!(cluster.host("host-1").containers().len(), 2);

    // only the cleared server is forgotten
    assert_eq!(doc.servers[0].nodes, 0);
    assert_eq!(doc.servers[1].nodes, 2);
    assert!(doc.nodes.iter().all(|n| n.server == 2));
    assert!(doc.build_id.is_some());
}

#[tokio::test]
async fn build_only_warns_about_unreachable_idle_servers() {
    let cluster = FakeCluster::new();
    cluster.cut_off("host-1");
    let mut doc = deployment(&[2, 2], 2);

    let report = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .expect("nodes fit on the reachable server");
    assert_eq!(report.new_nodes.len(), 2);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("host-1"), "{:?}", report.warnings);
    assert_eq!(cluster.host("host-1").commands(), Vec::<String>::new());
}

#[tokio::test]
async fn build_reports_each_unreachable_server_that_gets_nodes() {
    let cluster = FakeCluster::new();
    cluster.cut_off("host-1");
    let mut doc = deployment(&[2, 2, 2], 6);

    let err = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1, "unexpected failures: {}", err);
    assert!(failures[0].target.contains("host-1"));
    assert_eq!(doc.build_id, None);
}

#[tokio::test]
async fn params_reach_every_node_and_staging_is_cleaned_up() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2, 2], 3);
    deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap();

    let expected = serde_json::to_vec_pretty(&doc.details.params).unwrap();
    for (addr, name) in [("host-0", "tn-node1-0"), ("host-0", "tn-node1-1"), ("host-1", "tn-node2-0")] {
        let container = cluster.host(addr).container(name).unwrap();
        assert_eq!(container.files.get(PARAMS_PATH), Some(&expected), "{} on {}", name, addr);
    }
    assert!(cluster.host("host-0").host_files().is_empty());
    assert!(cluster.host("host-1").host_files().is_empty());

    // one staging upload per server, not per node
    let uploads = cluster
        .host("host-0")
        .commands()
        .iter()
        .filter(|c| c.starts_with("scp "))
        .count();
    assert_eq!(uploads, 1);
}

#[tokio::test]
async fn clean_build_wipes_leftovers() {
    let cluster = FakeCluster::new();
    let deployer = deployer(&cluster, test_config());
    let mut doc = deployment(&[4], 3);
    deployer.build(&mut doc).await.unwrap();

    let mut again = deployment(&[4], 2);
    deployer.build(&mut again).await.expect("rebuild succeeds");
    assert_eq!(cluster.host("host-0").containers(), vec!["tn-node1-0", "tn-node1-1"]);
    assert_eq!(again.servers[0].nodes, 2);
}

#[tokio::test]
async fn add_nodes_continues_numbering_on_the_next_free_server() {
    let cluster = FakeCluster::new();
    let deployer = deployer(&cluster, test_config());
    let mut doc = deployment(&[2, 2], 2);
    deployer.build(&mut doc).await.unwrap();

    let report = deployer.add_nodes(&mut doc, 1, None).await.unwrap();
    assert_eq!(report.new_nodes.len(), 1);
    let added = &report.new_nodes[0];
    assert_eq!(added.num, 2);
    assert_eq!(added.server, 2);
    assert_eq!(added.local_id, 0);
    assert_eq!(report.nodes.len(), 3);
    assert_eq!(doc.nodes.len(), 3);

    // the original nodes were left alone
    assert_eq!(cluster.host("host-0").containers(), vec!["tn-node1-0", "tn-node1-1"]);
    let container = cluster.host("host-1").container("tn-node2-0").unwrap();
    assert!(container.files.contains_key(PARAMS_PATH));
}

#[tokio::test]
async fn add_nodes_requires_a_built_network() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2], 1);
    let err = deployer(&cluster, test_config())
        .add_nodes(&mut doc, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn sidecars_share_the_node_segment_and_services_run_once() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2, 2], 3);
    doc.details.sidecars = vec![metrics_sidecar()];
    doc.details.services = vec![collector_service()];

    deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap();

    let a = cluster.host("host-0");
    let b = cluster.host("host-1");
    let sidecar = a.container("tn-node1-0-metrics").unwrap();
    assert_eq!(sidecar.network, "tn-net0");
    assert_eq!(sidecar.ip.as_deref(), Some("10.1.0.3"));
    assert!(b.container("tn-node2-0-metrics").is_some());

    let service = a.container("tn-svc-collector").unwrap();
    assert_eq!(service.network, "tn-services");
    assert_eq!(service.ip, None);
    assert!(b.container("tn-svc-collector").is_none());
}

#[tokio::test]
async fn delete_nodes_removes_node_group_and_keeps_the_slot() {
    let cluster = FakeCluster::new();
    let deployer = deployer(&cluster, test_config());
    let mut doc = deployment(&[4], 3);
    doc.details.sidecars = vec![SidecarSpec {
        name: "proxy".into(),
        image: "envoyproxy/envoy".into(),
        env: BTreeMap::new(),
        resources: Default::default(),
    }];
    deployer.build(&mut doc).await.unwrap();

    deployer.delete_nodes(&mut doc, &[1]).await.unwrap();
    let host = cluster.host("host-0");
    assert_eq!(
        host.containers(),
        vec!["tn-node1-0", "tn-node1-0-proxy", "tn-node1-2", "tn-node1-2-proxy"]
    );
    assert_eq!(host.networks(), vec!["tn-net0", "tn-net2"]);
    let nums: Vec<usize> = doc.nodes.iter().map(|n| n.num).collect();
    assert_eq!(nums, vec![0, 2]);
    assert_eq!(doc.servers[0].nodes, 3);
    assert_eq!(doc.servers[0].ips.len(), 2);

    let report = deployer.add_nodes(&mut doc, 1, None).await.unwrap();
    assert_eq!(report.new_nodes[0].local_id, 3);
    assert_eq!(report.new_nodes[0].num, 3);

    let err = deployer.delete_nodes(&mut doc, &[9]).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn readiness_gives_up_after_the_attempt_budget() {
    let cluster = FakeCluster::new();
    cluster.host("host-0").fail_when("docker exec tn-node1-0 sh -c true");
    let mut doc = deployment(&[2], 2);

    let err = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert!(err.failures()[0].message.contains("after 3 attempts"));
    let probes = cluster
        .host("host-0")
        .commands()
        .iter()
        .filter(|c| c.as_str() == "docker exec tn-node1-0 sh -c true")
        .count();
    assert_eq!(probes, 3);
}

#[tokio::test]
async fn cancel_stops_unbounded_readiness_loops() {
    let cluster = FakeCluster::new();
    cluster.host("host-0").fail_when("sh -c true");
    let config = shipyard::Config {
        ready_attempts: 0,
        ..test_config()
    };
    let deployer = Arc::new(deployer(&cluster, config));
    let mut doc = deployment(&[1], 1);

    let canceller = Arc::clone(&deployer);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = deployer.build(&mut doc).await.unwrap_err();
    assert!(err.failures()[0].message.contains("cancelled"), "{}", err);
}

#[tokio::test]
async fn operator_key_is_installed_in_every_node() {
    let mut key = tempfile::NamedTempFile::new().unwrap();
    writeln!(key, "ssh-ed25519 AAAAC3Nza operator@example").unwrap();

    let cluster = FakeCluster::new();
    let config = shipyard::Config {
        ssh_public_key: Some(key.path().to_path_buf()),
        ..test_config()
    };
    let mut doc = deployment(&[2], 2);
    let report = deployer(&cluster, config).build(&mut doc).await.unwrap();
    assert!(report.warnings.is_empty());

    let installs = cluster
        .host("host-0")
        .commands()
        .iter()
        .filter(|c| c.contains("ssh-ed25519 AAAAC3Nza operator@example") && c.contains("authorized_keys"))
        .count();
    assert_eq!(installs, 2);
}

#[tokio::test]
async fn unreadable_operator_key_is_only_a_warning() {
    let cluster = FakeCluster::new();
    let config = shipyard::Config {
        ssh_public_key: Some("/nonexistent/id_ed25519.pub".into()),
        ..test_config()
    };
    let mut doc = deployment(&[1], 1);
    let report = deployer(&cluster, config).build(&mut doc).await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("/nonexistent/id_ed25519.pub"));
}

#[tokio::test]
async fn unknown_network_type_is_rejected_up_front() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2], 1);
    doc.details.network_type = "nosuchchain".into();
    let err = deployer(&cluster, test_config())
        .build(&mut doc)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownNetworkType(_)));
    assert_eq!(cluster.command_count(), 0);
}

const MARK: Key<Value> = Key::new("courier.mark");
const BLOB: &[u8] = b"\x00\x01binary genesis\xff\xfe";
const SHARED_PATH: &str = "/opt/courier/blob.bin";

/// Ships a blob to the first node and to every server, and leaves a mark
/// for add-nodes sessions.
struct Courier {
    fail: bool,
}

#[async_trait]
impl NetworkBuilder for Courier {
    fn name(&self) -> &str {
        "courier"
    }

    async fn build(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>> {
        ctx.state.put(&MARK, json!("from-build"));
        let node = ctx.new_nodes[0].clone();
        distribute::wait_for_server(ctx, node.server, "docker info").await?;
        distribute::copy_bytes_to_node(ctx, &node, "blob.bin", BLOB, "/data/blob.bin").await?;
        let local = ctx.state.write("shared/blob.bin", BLOB).await?;
        distribute::copy_to_servers(ctx, &local, SHARED_PATH).await?;
        if self.fail {
            return Err(Error::Internal("courier refused".into()));
        }
        Ok(vec![node.name])
    }

    async fn add(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>> {
        let mark = ctx.state.need(&MARK)?;
        Ok(vec![mark.as_str().unwrap_or_default().to_string()])
    }
}

fn courier_deployer(cluster: &Arc<FakeCluster>, fail: bool) -> shipyard::Deployer {
    let mut registry = Registry::with_builtin();
    registry.register(Arc::new(Courier { fail })).unwrap();
    deployer(cluster, test_config()).with_registry(registry)
}

#[tokio::test]
async fn two_hop_copy_delivers_identical_bytes() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2], 2);
    doc.details.network_type = "courier".into();

    let report = courier_deployer(&cluster, false).build(&mut doc).await.unwrap();
    assert_eq!(report.labels, vec!["tn-node1-0"]);

    let host = cluster.host("host-0");
    let node = host.container("tn-node1-0").unwrap();
    assert_eq!(node.files.get("/data/blob.bin").map(Vec::as_slice), Some(BLOB));
    assert!(host.container("tn-node1-1").unwrap().files.is_empty());
    // staged copies are gone, the server-level copy stays
    assert_eq!(host.host_files(), vec![SHARED_PATH]);
    assert!(host.commands().iter().any(|c| c == "docker info"));
}

#[tokio::test]
async fn deferred_cleanup_runs_when_the_builder_fails() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[2], 1);
    doc.details.network_type = "courier".into();

    let err = courier_deployer(&cluster, true).build(&mut doc).await.unwrap_err();
    assert!(err.to_string().contains("courier refused"));

    let host = cluster.host("host-0");
    assert!(host.host_files().iter().all(|f| !f.starts_with("/tmp/shipyard/")));
    assert!(host.commands().iter().any(|c| c.starts_with("rm -f ")));
}

#[tokio::test]
async fn add_nodes_sees_what_the_build_stored() {
    let cluster = FakeCluster::new();
    let deployer = courier_deployer(&cluster, false);
    let mut doc = deployment(&[3], 1);
    doc.details.network_type = "courier".into();

    let built = deployer.build(&mut doc).await.unwrap();
    assert!(deployer.scratch_for(built.build_id).is_some());

    let added = deployer.add_nodes(&mut doc, 1, None).await.unwrap();
    assert_eq!(added.labels, vec!["from-build"]);
    assert_ne!(added.build_id, built.build_id);
}

#[tokio::test]
async fn a_new_process_continues_from_the_document() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[3], 1);
    doc.details.network_type = "courier".into();
    let built = courier_deployer(&cluster, false).build(&mut doc).await.unwrap();
    assert_eq!(doc.scratch.get("courier.mark"), Some(&json!("from-build")));

    // round-trip through the file the command line keeps
    let file = tempfile::NamedTempFile::new().unwrap();
    doc.write(file.path()).unwrap();
    let mut doc = shipyard::types::Deployment::from_file(file.path()).unwrap();

    let added = courier_deployer(&cluster, false)
        .add_nodes(&mut doc, 1, Some(built.build_id))
        .await
        .unwrap();
    assert_eq!(added.labels, vec!["from-build"]);
    assert_eq!(doc.build_id, Some(added.build_id));
    assert_eq!(doc.scratch.get("courier.mark"), Some(&json!("from-build")));
}

#[tokio::test]
async fn add_nodes_without_stored_data_fails_cleanly() {
    let cluster = FakeCluster::new();
    let mut doc = deployment(&[3], 1);
    doc.details.network_type = "courier".into();
    courier_deployer(&cluster, false).build(&mut doc).await.unwrap();
    doc.scratch.clear();

    // a fresh deployer has nothing but the document to go on
    let err = courier_deployer(&cluster, false)
        .add_nodes(&mut doc, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingKey(_)));
}

#[tokio::test]
async fn unknown_parent_session_is_rejected() {
    let cluster = FakeCluster::new();
    let deployer = deployer(&cluster, test_config());
    let mut doc = deployment(&[3], 1);
    deployer.build(&mut doc).await.unwrap();
    let before = cluster.command_count();

    let err = deployer
        .add_nodes(&mut doc, 1, Some(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{}", err);
    assert_eq!(cluster.command_count(), before);
    assert_eq!(doc.nodes.len(), 1);
}

#[tokio::test]
async fn failed_add_nodes_keeps_the_previous_session() {
    let cluster = FakeCluster::new();
    let deployer = courier_deployer(&cluster, false);
    let mut doc = deployment(&[3], 1);
    doc.details.network_type = "courier".into();
    let built = deployer.build(&mut doc).await.unwrap();

    cluster.host("host-0").fail_when("--name tn-node1-1 ");
    assert!(deployer.add_nodes(&mut doc, 1, None).await.is_err());
    assert_eq!(doc.build_id, Some(built.build_id));
    // the failed node stays on record
    assert_eq!(doc.nodes.len(), 2);

    let added = deployer.add_nodes(&mut doc, 1, None).await.unwrap();
    assert_eq!(added.labels, vec!["from-build"]);
    assert_eq!(added.new_nodes[0].name, "tn-node1-2");
}
