use deacon_executor::common::{
    ContainerFilter, ContainerRuntime, ContainerSpec, ContainerState, ExecCommand,
    ResourceLimits, SeedFile, SeedOutcome, VolumeBinding, VolumeSeed, VolumeStore,
};
use deacon_executor::mock::{ExecBehavior, MockRuntime, RuntimeCall};
use std::collections::BTreeMap;
use std::time::Duration;

fn spec(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: "test:latest".to_string(),
        env: BTreeMap::new(),
        volumes: vec![VolumeBinding::rw(format!("{name}-data"), "/data")],
        network: None,
        dns: vec![],
        limits: ResourceLimits::default(),
        labels: BTreeMap::from([("managed".to_string(), "true".to_string())]),
        restart_unless_stopped: true,
    }
}

#[tokio::test]
async fn test_create_rejects_name_conflict() {
    let runtime = MockRuntime::new();
    let first = runtime.create(&spec("c1")).await.unwrap();
    assert!(first.is_running());
    assert!(runtime.create(&spec("c1")).await.is_err());
    assert_eq!(runtime.container_count().await, 1);
    assert!(runtime.volume_exists("c1-data").await);
}

#[tokio::test]
async fn test_stop_and_remove_semantics() {
    let runtime = MockRuntime::new();
    let handle = runtime.create(&spec("c1")).await.unwrap();

    assert!(runtime.remove(&handle.id, false).await.is_err());
    runtime.stop(&handle.id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        runtime.container("c1").await.unwrap().handle.state,
        ContainerState::Exited
    );
    runtime.remove(&handle.id, false).await.unwrap();
    assert!(runtime.get("c1").await.unwrap().is_none());

    // both are idempotent or typed on absence
    runtime.remove(&handle.id, true).await.unwrap();
    assert!(runtime
        .stop(&handle.id, Duration::from_secs(5))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_exec_behaviors() {
    let runtime = MockRuntime::new();
    let handle = runtime.create(&spec("c1")).await.unwrap();

    let ok = runtime.exec(&handle.id, &ExecCommand::new(["true"])).await.unwrap();
    assert!(ok.success());

    runtime
        .set_program_behavior("c1", "pgrep", ExecBehavior::ExitCode(1))
        .await;
    let probe = runtime.exec(&handle.id, &ExecCommand::new(["pgrep"])).await.unwrap();
    assert_eq!(probe.exit_code, 1);
    let other = runtime.exec(&handle.id, &ExecCommand::new(["npm"])).await.unwrap();
    assert!(other.success());

    runtime
        .set_exec_behavior("c1", ExecBehavior::Error("boom".to_string()))
        .await;
    assert!(runtime.exec(&handle.id, &ExecCommand::new(["npm"])).await.is_err());

    runtime.set_state("c1", ContainerState::Exited).await;
    assert!(runtime.exec(&handle.id, &ExecCommand::new(["pgrep"])).await.is_err());
}

#[tokio::test]
async fn test_exec_streaming_writes_stdout_to_sink() {
    let runtime = MockRuntime::new();
    let handle = runtime.create(&spec("c1")).await.unwrap();

    let mut sink: Vec<u8> = Vec::new();
    let output = runtime
        .exec_streaming(&handle.id, &ExecCommand::new(["tar"]), &mut sink)
        .await
        .unwrap();
    assert!(output.success());
    assert!(output.stdout.is_empty());
    assert_eq!(sink, b"c1: ok");
}

#[tokio::test(start_paused = true)]
async fn test_hang_never_completes() {
    let runtime = MockRuntime::new();
    let handle = runtime.create(&spec("c1")).await.unwrap();
    runtime.set_exec_behavior("c1", ExecBehavior::Hang).await;

    let hung = tokio::time::timeout(
        Duration::from_secs(3600),
        runtime.exec(&handle.id, &ExecCommand::new(["npm"])),
    )
    .await;
    assert!(hung.is_err());
}

#[tokio::test]
async fn test_list_filters_by_label() {
    let runtime = MockRuntime::new();
    runtime.create(&spec("c1")).await.unwrap();
    runtime
        .insert_container("stranger", ContainerState::Running, BTreeMap::new())
        .await;

    let managed = runtime
        .list(&ContainerFilter::label("managed", "true"))
        .await
        .unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].name, "c1");
}

#[tokio::test]
async fn test_initialize_if_absent() {
    let runtime = MockRuntime::new();
    let seed = VolumeSeed {
        probe: "cfg.json".to_string(),
        directories: vec!["state".to_string()],
        files: vec![SeedFile {
            path: "cfg.json".to_string(),
            contents: b"{}".to_vec(),
        }],
    };

    assert!(runtime.initialize_if_absent("v", &seed).await.is_err());
    runtime.ensure("v", &BTreeMap::new()).await.unwrap();
    assert_eq!(
        runtime.initialize_if_absent("v", &seed).await.unwrap(),
        SeedOutcome::Seeded
    );
    assert_eq!(runtime.volume_file("v", "cfg.json").await.unwrap(), b"{}");
    assert!(runtime.volume_file("v", "state/").await.is_some());

    runtime.seed_volume_file("v", "cfg.json", b"custom").await;
    assert_eq!(
        runtime.initialize_if_absent("v", &seed).await.unwrap(),
        SeedOutcome::AlreadyPresent
    );
    assert_eq!(runtime.volume_file("v", "cfg.json").await.unwrap(), b"custom");
}

#[tokio::test]
async fn test_fail_next_create_is_one_shot() {
    let runtime = MockRuntime::new();
    runtime.fail_next_create("daemon unavailable").await;
    assert!(runtime.create(&spec("c1")).await.is_err());
    assert!(runtime.create(&spec("c1")).await.is_ok());
    assert_eq!(runtime.create_count().await, 2);
    assert!(runtime
        .calls()
        .await
        .iter()
        .all(|c| matches!(c, RuntimeCall::Create(_))));
}
