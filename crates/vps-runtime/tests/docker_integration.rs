//! Real Docker round trips for the runtime adapter.
//! Run with: cargo test -p vps-runtime --test docker_integration -- --ignored

use std::time::Duration;
use vps_common::{InstanceConfig, ResourceLimits};
use vps_runtime::{require_docker, ContainerRuntime, ContainerSpec, DockerRuntime, TimeoutRuntime};

fn alpine_spec(name: &str) -> ContainerSpec {
    let config = InstanceConfig::new(0.5, 512, 10, "alpine:latest");
    ContainerSpec::for_instance(name, "integration", &config)
        .with_name(format!("{name}-{}", std::process::id()))
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_container_lifecycle_round_trip() {
    require_docker!();
    let runtime = TimeoutRuntime::new(
        DockerRuntime::connect_local(2).unwrap(),
        Duration::from_secs(60),
    );

    let handle = runtime.create(&alpine_spec("vps-it-lifecycle")).await.unwrap();
    assert!(runtime.inspect(&handle).await.unwrap().running);

    let stats = runtime.stats(&handle).await.unwrap();
    assert!(stats.memory_limit_bytes > 0);

    let df = runtime
        .exec(&handle, &["df".into(), "-P".into(), "/".into()])
        .await
        .unwrap();
    assert!(df.contains('%'));

    runtime.stop(&handle).await.unwrap();
    // Stopping twice is acknowledged, not an error
    runtime.stop(&handle).await.unwrap();
    assert!(!runtime.inspect(&handle).await.unwrap().running);

    runtime.start(&handle).await.unwrap();
    runtime
        .update_limits(
            &handle,
            &ResourceLimits {
                cpu_cores: 1.0,
                memory_mb: 1024,
                storage_gb: 10,
            },
        )
        .await
        .unwrap();

    runtime.remove(&handle).await.unwrap();
    let err = runtime.inspect(&handle).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_commit_produces_restorable_image() {
    require_docker!();
    let runtime = DockerRuntime::connect_local(2).unwrap();

    let handle = runtime.create(&alpine_spec("vps-it-commit")).await.unwrap();
    let image = runtime
        .commit(&handle, "vps-backup-it", "snapshot")
        .await
        .unwrap();
    assert_eq!(image, "vps-backup-it:snapshot");

    let restored = runtime
        .create(&alpine_spec("vps-it-restored").with_image(image))
        .await
        .unwrap();
    assert!(runtime.inspect(&restored).await.unwrap().running);

    runtime.remove(&restored).await.unwrap();
    runtime.remove(&handle).await.unwrap();
}
