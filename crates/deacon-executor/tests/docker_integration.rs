//! Exercises DockerRuntime against a real daemon. Each test returns early
//! when Docker is not reachable.

use deacon_executor::common::{
    ContainerFilter, ContainerRuntime, ContainerSpec, ExecCommand, ResourceLimits, SeedFile,
    SeedOutcome, VolumeBinding, VolumeSeed, VolumeStore,
};
use deacon_executor::{require_docker, DockerRuntime};
use std::collections::BTreeMap;
use std::time::Duration;

// Long-running image so exec has something to attach to.
const TEST_IMAGE: &str = "nginx:alpine";

fn test_spec(name: &str, volume: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: TEST_IMAGE.to_string(),
        env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
        volumes: vec![VolumeBinding::rw(volume, "/data")],
        network: None,
        dns: vec![],
        limits: ResourceLimits::new("128m", 0.5).unwrap(),
        labels: BTreeMap::from([("deacon.test".to_string(), name.to_string())]),
        restart_unless_stopped: false,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_container_lifecycle() {
    require_docker!();

    let runtime = DockerRuntime::connect_local("alpine:latest").unwrap();
    let name = unique("deacon-it");
    let volume = format!("{name}-vol");
    runtime.ensure(&volume, &BTreeMap::new()).await.unwrap();

    let handle = runtime.create(&test_spec(&name, &volume)).await.unwrap();
    assert_eq!(handle.name, name);
    assert!(handle.is_running());

    let found = runtime.get(&name).await.unwrap().expect("container should exist");
    assert_eq!(found.id, handle.id);

    let listed = runtime
        .list(&ContainerFilter::label("deacon.test", name.as_str()))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let output = runtime
        .exec(&handle.id, &ExecCommand::new(["sh", "-c", "echo $GREETING"]))
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.output_lossy().trim(), "hello");

    let failed = runtime
        .exec(&handle.id, &ExecCommand::new(["sh", "-c", "exit 3"]))
        .await
        .unwrap();
    assert_eq!(failed.exit_code, 3);

    let mut streamed: Vec<u8> = Vec::new();
    let output = runtime
        .exec_streaming(
            &handle.id,
            &ExecCommand::new(["sh", "-c", "echo out; echo err >&2"]),
            &mut streamed,
        )
        .await
        .unwrap();
    assert!(output.stdout.is_empty());
    assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    assert_eq!(String::from_utf8_lossy(&streamed).trim(), "out");

    runtime.stop(&handle.id, Duration::from_secs(1)).await.unwrap();
    // stopping twice is not an error
    runtime.stop(&handle.id, Duration::from_secs(1)).await.unwrap();
    runtime.remove(&handle.id, true).await.unwrap();
    assert!(runtime.get(&name).await.unwrap().is_none());

    runtime.remove(&handle.id, true).await.unwrap();
    let err = runtime.stop(&handle.id, Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_initialize_if_absent_only_seeds_once() {
    require_docker!();

    let runtime = DockerRuntime::connect_local("alpine:latest").unwrap();
    let volume = unique("deacon-it-seed");
    runtime.ensure(&volume, &BTreeMap::new()).await.unwrap();
    // ensure is idempotent
    runtime.ensure(&volume, &BTreeMap::new()).await.unwrap();

    let seed = VolumeSeed {
        probe: "config.json".to_string(),
        directories: vec!["state".to_string()],
        files: vec![SeedFile {
            path: "config.json".to_string(),
            contents: br#"{"seeded": true}"#.to_vec(),
        }],
    };

    let first = runtime.initialize_if_absent(&volume, &seed).await.unwrap();
    assert_eq!(first, SeedOutcome::Seeded);
    let second = runtime.initialize_if_absent(&volume, &seed).await.unwrap();
    assert_eq!(second, SeedOutcome::AlreadyPresent);
}
