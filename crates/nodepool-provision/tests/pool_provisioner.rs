//! PoolProvisioner against an in-memory backend.

mod common;

use std::sync::Arc;

use nodepool_core::{HintOverlay, MachineOverlay, VolumeOverlay, VolumeStatus};
use nodepool_provision::{
    BATCH_TAG_PROPERTY, CreateRequest, OWNER_PROPERTY, PoolProvisioner, ProvisionError,
    Provisioner, UP_MARKER,
};
use tempfile::TempDir;

use common::{FakeBackend, FakeProbe, LAB_DOMAIN, fast_timings, fqdn_for, settings};

struct Harness {
    backend: Arc<FakeBackend>,
    provisioner: PoolProvisioner,
    _dir: TempDir,
}

fn harness(backend: FakeBackend, probe: FakeProbe) -> Harness {
    let (dir, settings) = settings();
    let backend = Arc::new(backend);
    let provisioner = PoolProvisioner::new(
        "ovh",
        backend.clone(),
        Arc::new(probe),
        settings,
        LAB_DOMAIN,
    )
    .with_timings(fast_timings());
    Harness {
        backend,
        provisioner,
        _dir: dir,
    }
}

fn request(num: u32) -> CreateRequest {
    CreateRequest {
        num,
        os_type: "ubuntu".to_string(),
        os_version: "22.04".to_string(),
        arch: None,
        hints: Vec::new(),
    }
}

fn with_volumes(num: u32, count: u32) -> CreateRequest {
    CreateRequest {
        hints: vec![HintOverlay {
            machine: None,
            volumes: Some(VolumeOverlay {
                count: Some(count),
                size: Some(10),
            }),
        }],
        ..request(num)
    }
}

#[tokio::test]
async fn creates_named_ready_instances() {
    let h = harness(FakeBackend::new(), FakeProbe::default());

    let fqdns = h.provisioner.create(&request(3)).await.unwrap();

    assert_eq!(fqdns, vec![fqdn_for(1), fqdn_for(2), fqdn_for(3)]);
    let state = h.backend.state();
    assert_eq!(state.create_requests.len(), 1);
    assert_eq!(state.create_requests[0].count, 3);
    assert_eq!(
        state.renames,
        vec![
            ("srv-0".to_string(), "target010000000001".to_string()),
            ("srv-1".to_string(), "target010000000002".to_string()),
            ("srv-2".to_string(), "target010000000003".to_string()),
        ]
    );
    assert!(state.deleted_servers.is_empty());
}

#[tokio::test]
async fn create_request_carries_tags_and_rendered_user_data() {
    let h = harness(FakeBackend::new(), FakeProbe::default());

    h.provisioner.create(&request(1)).await.unwrap();

    let state = h.backend.state();
    let sent = &state.create_requests[0];
    assert_eq!(sent.properties[BATCH_TAG_PROPERTY].len(), 32);
    assert_eq!(sent.properties[OWNER_PROPERTY], "192.168.0.10");
    assert_eq!(sent.security_group, "teuthology-worker");
    assert_eq!(sent.keypair, "teuthology");
    assert_eq!(sent.image, "image-ubuntu-22.04-x86_64");
    assert!(sent.network_id.is_none());
    assert!(state.user_data_seen[0].contains("nameserver 8.8.8.8"));
    assert!(state.user_data_seen[0].contains(UP_MARKER));
    // Removed once the batch is done.
    assert!(!sent.user_data.exists());
}

#[tokio::test]
async fn each_batch_gets_a_fresh_tag() {
    let h = harness(FakeBackend::new(), FakeProbe::default());

    h.provisioner.create(&request(1)).await.unwrap();
    h.provisioner.create(&request(1)).await.unwrap();

    let state = h.backend.state();
    assert_ne!(
        state.create_requests[0].properties[BATCH_TAG_PROPERTY],
        state.create_requests[1].properties[BATCH_TAG_PROPERTY]
    );
}

#[tokio::test]
async fn hints_only_raise_defaults_and_arch_is_passed_through() {
    let h = harness(FakeBackend::new(), FakeProbe::default());
    let req = CreateRequest {
        arch: Some("aarch64".to_string()),
        hints: vec![
            HintOverlay {
                machine: Some(MachineOverlay {
                    disk: Some(5),
                    ram: Some(16000),
                    cpus: None,
                }),
                volumes: None,
            },
            HintOverlay {
                machine: Some(MachineOverlay {
                    disk: None,
                    ram: None,
                    cpus: Some(4),
                }),
                volumes: None,
            },
        ],
        ..request(1)
    };

    h.provisioner.create(&req).await.unwrap();

    let state = h.backend.state();
    let hint = state.flavor_hints[0];
    assert_eq!((hint.disk, hint.ram, hint.cpus), (20, 16000, 4));
    assert_eq!(state.image_requests[0].2, "aarch64");
}

#[tokio::test]
async fn ssh_failure_on_one_instance_destroys_the_whole_batch() {
    let probe = FakeProbe {
        unreachable: vec![fqdn_for(2)],
        ..Default::default()
    };
    let h = harness(FakeBackend::new(), probe);

    let err = h.provisioner.create(&request(3)).await.unwrap_err();

    assert!(
        matches!(&err, ProvisionError::Readiness { fqdn, .. } if *fqdn == fqdn_for(2)),
        "unexpected error: {err}"
    );
    let state = h.backend.state();
    let mut destroyed = state.deleted_servers.clone();
    destroyed.sort();
    assert_eq!(destroyed, vec!["srv-0", "srv-1", "srv-2"]);
    assert!(state.servers.is_empty());
    assert_eq!(state.console_requests, vec!["srv-1"]);
    // Setup is sequential: the third instance was never reached.
    assert_eq!(state.renames.len(), 2);
}

#[tokio::test]
async fn boot_failure_destroys_the_batch() {
    let probe = FakeProbe {
        never_boots: vec![fqdn_for(1)],
        ..Default::default()
    };
    let h = harness(FakeBackend::new(), probe);

    let err = h.provisioner.create(&request(2)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Readiness { .. }));
    assert_eq!(h.backend.state().deleted_servers.len(), 2);
}

#[tokio::test]
async fn quota_error_is_reported_and_nothing_is_destroyed() {
    let backend = FakeBackend {
        create_error: Some(
            "Quota exceeded for instances: Requested 3, but already used 10 of 10 instances (HTTP 403)"
                .to_string(),
        ),
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(3)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::QuotaExceeded(ref m) if m.contains("10 of 10")));
    let state = h.backend.state();
    assert!(state.deleted_servers.is_empty());
    assert!(state.renames.is_empty());
}

#[tokio::test]
async fn other_create_errors_pass_through() {
    let backend = FakeBackend {
        create_error: Some("No valid host was found".to_string()),
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(1)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Backend { .. }));
}

#[tokio::test]
async fn create_failing_after_building_tears_down_the_batch() {
    let backend = FakeBackend {
        create_error: Some("Server srv-2 went to status ERROR".to_string()),
        build_before_failing: true,
        ..Default::default()
    }
    .with_foreign_server("foreign-1", "someone-else");
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(3)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Backend { ref message, .. } if message.contains("ERROR")));
    let state = h.backend.state();
    let mut destroyed = state.deleted_servers.clone();
    destroyed.sort();
    assert_eq!(destroyed, vec!["srv-0", "srv-1", "srv-2"]);
    assert_eq!(state.servers.len(), 1);
    assert_eq!(state.servers[0].summary.id, "foreign-1");
}

#[tokio::test]
async fn partial_quota_failure_is_still_reported_as_quota() {
    let backend = FakeBackend {
        create_error: Some("Quota exceeded for cores: Requested 8, but already used 60 of 64 cores".to_string()),
        build_before_failing: true,
        create_shortfall: 1,
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(3)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::QuotaExceeded(_)));
    let state = h.backend.state();
    assert_eq!(state.deleted_servers.len(), 2);
    assert!(state.servers.is_empty());
}

#[tokio::test]
async fn listing_failure_after_create_tears_down_the_batch() {
    // Enough failures to exhaust the first listing; the teardown listing works.
    let backend = FakeBackend {
        list_failures: 3,
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(2)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Backend { ref command, .. } if command == "openstack server list"));
    let state = h.backend.state();
    assert!(state.servers.is_empty());
    assert_eq!(state.deleted_servers.len(), 2);
    assert!(state.renames.is_empty());
}

#[tokio::test]
async fn rename_is_retried() {
    let backend = FakeBackend {
        rename_failures: 2,
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let fqdns = h.provisioner.create(&request(1)).await.unwrap();

    assert_eq!(fqdns, vec![fqdn_for(1)]);
    let state = h.backend.state();
    assert_eq!(state.rename_calls, 3);
    assert!(state.deleted_servers.is_empty());
}

#[tokio::test]
async fn other_callers_instances_are_never_touched() {
    let backend = FakeBackend::new().with_foreign_server("foreign-1", "someone-else");
    let probe = FakeProbe {
        unreachable: vec![fqdn_for(1)],
        ..Default::default()
    };
    let h = harness(backend, probe);

    h.provisioner.create(&request(1)).await.unwrap_err();

    let state = h.backend.state();
    assert_eq!(state.deleted_servers, vec!["srv-0"]);
    assert!(state.servers.iter().any(|s| s.summary.id == "foreign-1"));
    assert!(state.renames.iter().all(|(id, _)| id != "foreign-1"));
}

#[tokio::test]
async fn short_batch_is_rolled_back() {
    let backend = FakeBackend {
        create_shortfall: 1,
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&request(3)).await.unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::BatchMismatch {
            expected: 3,
            found: 2,
            ..
        }
    ));
    assert_eq!(h.backend.state().deleted_servers.len(), 2);
}

#[tokio::test]
async fn volumes_are_attached_to_every_instance() {
    let h = harness(FakeBackend::new(), FakeProbe::default());

    h.provisioner.create(&with_volumes(2, 2)).await.unwrap();

    let state = h.backend.state();
    let mut names: Vec<&str> = state.volumes.values().map(|v| v.name.as_str()).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "target010000000001-0",
            "target010000000001-1",
            "target010000000002-0",
            "target010000000002-1",
        ]
    );
    assert!(state.volumes.values().all(|v| v.status == VolumeStatus::InUse));
    assert!(state.deleted_volumes.is_empty());
}

#[tokio::test]
async fn attach_failure_rolls_back_instances_and_volumes() {
    let backend = FakeBackend {
        attach_always_fails: true,
        ..Default::default()
    };
    let h = harness(backend, FakeProbe::default());

    let err = h.provisioner.create(&with_volumes(2, 1)).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Backend { .. }), "unexpected error: {err}");
    let state = h.backend.state();
    assert!(state.volumes.is_empty());
    assert_eq!(state.deleted_servers.len(), 2);
}

#[tokio::test]
async fn rollback_releases_volumes_before_destroying_instances() {
    let probe = FakeProbe {
        unreachable: vec![fqdn_for(2)],
        ..Default::default()
    };
    let h = harness(FakeBackend::new(), probe);

    h.provisioner.create(&with_volumes(2, 1)).await.unwrap_err();

    let state = h.backend.state();
    let undo: Vec<&str> = state
        .events
        .iter()
        .filter(|e| e.starts_with("delete-"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        undo,
        vec!["delete-volume vol-0", "delete-server srv-1", "delete-server srv-0"]
    );
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let h = harness(FakeBackend::new(), FakeProbe::default());
    h.provisioner.create(&request(1)).await.unwrap();

    h.provisioner.destroy("target010000000001").await.unwrap();
    h.provisioner.destroy("target010000000001").await.unwrap();

    assert_eq!(h.backend.state().deleted_servers, vec!["srv-0"]);
}

#[tokio::test]
async fn attach_volumes_through_the_capability_trait() {
    let h = harness(FakeBackend::new(), FakeProbe::default());
    let provisioner: &dyn Provisioner = &h.provisioner;

    let ids = provisioner
        .attach_volumes(
            "target010000000009",
            &nodepool_core::VolumeHint { count: 1, size: 5 },
        )
        .await
        .unwrap();

    assert_eq!(ids, vec!["vol-0"]);
}
