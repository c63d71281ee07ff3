//! Behaviour of the simulated host that executor tests rely on.

use fleet_host::fakes::MemoryHost;
use fleet_host::*;

#[tokio::test]
async fn write_then_read_reports_digest_and_perms() {
    let host = MemoryHost::new();
    assert!(host.read_file("/etc/app.conf").await.unwrap().is_none());

    let perms = FilePerms {
        mode: 0o600,
        owner: "app".to_string(),
        group: "app".to_string(),
    };
    host.write_file("/etc/app.conf", b"port=8080\n", &perms)
        .await
        .unwrap();

    let state = host.read_file("/etc/app.conf").await.unwrap().unwrap();
    assert_eq!(state.mode, 0o600);
    assert_eq!(state.owner, "app");
    assert_eq!(state.digest.len(), 64);
    assert_eq!(host.mutations(), vec!["write_file /etc/app.conf"]);
}

#[tokio::test]
async fn seeding_does_not_count_as_mutation() {
    let host = MemoryHost::new();
    host.seed_file("/etc/motd", b"hi", FilePerms::default());
    host.seed_package("curl", None, "8.0");
    host.seed_service("sshd", true, true);
    assert_eq!(host.mutation_count(), 0);
    assert_eq!(host.installed_packages().await.unwrap().len(), 1);
    assert!(host.service_status("sshd").await.unwrap().running);
}

#[tokio::test]
async fn injected_failure_by_op_and_by_target() {
    let host = MemoryHost::new();
    host.fail_target("write_file", "/etc/bad.conf", "disk full");

    host.write_file("/etc/good.conf", b"a", &FilePerms::default())
        .await
        .unwrap();
    let err = host
        .write_file("/etc/bad.conf", b"b", &FilePerms::default())
        .await
        .unwrap_err();
    assert_eq!(err.log(), "disk full");

    host.fail_op("install_package", "could not get lock /var/lib/dpkg/lock");
    let err = host.install_package("nginx", None, None).await.unwrap_err();
    assert!(matches!(err, HostError::Injected { .. }));
    assert!(host.package_version("nginx", None).is_none());

    host.clear_failures();
    host.install_package("nginx", None, None).await.unwrap();
    assert_eq!(
        host.package_version("nginx", None).as_deref(),
        Some(fleet_host::fakes::DEFAULT_PACKAGE_VERSION)
    );
}

#[tokio::test]
async fn unknown_service_cannot_be_managed() {
    let host = MemoryHost::new();
    let err = host
        .set_service_state("ghost", ServiceAction::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NotFound(_)));
    assert_eq!(host.mutation_count(), 0);

    host.seed_service("nginx", false, false);
    host.set_service_state("nginx", ServiceAction::Start)
        .await
        .unwrap();
    host.set_service_state("nginx", ServiceAction::Enable)
        .await
        .unwrap();
    let status = host.service_status("nginx").await.unwrap();
    assert!(status.running && status.enabled);
}

#[tokio::test]
async fn containers_keep_labels_and_refuse_duplicate_names() {
    let host = MemoryHost::new();
    let mut spec = ContainerSpec {
        name: "web".to_string(),
        image: "nginx:1.25".to_string(),
        command: vec![],
        ports: vec!["80:80".to_string()],
        env: Default::default(),
        volumes: vec![],
        restart: Some("always".to_string()),
        labels: Default::default(),
    };
    spec.labels
        .insert(FINGERPRINT_LABEL.to_string(), "abc".to_string());

    host.run_container(&spec).await.unwrap();
    assert!(host.run_container(&spec).await.is_err());

    let status = host.container_status("web").await.unwrap().unwrap();
    assert!(status.running);
    assert_eq!(status.labels.get(FINGERPRINT_LABEL).unwrap(), "abc");

    host.stop_container_externally("web");
    assert!(!host.container_status("web").await.unwrap().unwrap().running);

    host.remove_container("web").await.unwrap();
    assert!(host.container_status("web").await.unwrap().is_none());
}

#[tokio::test]
async fn compose_up_needs_the_compose_file() {
    let host = MemoryHost::new();
    assert!(host
        .compose_up("shop", "/var/lib/fleet/compose/shop.yml", false)
        .await
        .is_err());

    host.write_file(
        "/var/lib/fleet/compose/shop.yml",
        b"services:\n  web:\n    image: nginx\n  db:\n    image: postgres\n",
        &FilePerms::default(),
    )
    .await
    .unwrap();
    host.compose_up("shop", "/var/lib/fleet/compose/shop.yml", false)
        .await
        .unwrap();
    let status = host.compose_status("shop").await.unwrap().unwrap();
    assert_eq!(status.total_services, 2);
    assert!(status.is_up());
}

#[tokio::test]
async fn failed_commands_carry_captured_output() {
    let host = MemoryHost::new();
    host.fail_target("run_command", "nginx", "emerg: unknown directive");
    let err = host
        .run_command(&["nginx".to_string(), "-t".to_string()], &[])
        .await
        .unwrap_err();
    assert!(err.log().contains("unknown directive"));
    assert_eq!(host.commands().len(), 1);
}
