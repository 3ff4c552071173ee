//! Real Firecracker + KVM: boot, snapshot over MMDS, restore and re-read.
//!
//! Needs root, /dev/kvm, a VMM binary and guest artifacts in the configured
//! artifact store. Run with `--features privileged-tests`.
#![cfg(feature = "privileged-tests")]

use fctest::artifacts::ArtifactCollection;
use fctest::firecracker::api::{faults, MmdsVersion};
use fctest::mmds;
use fctest::network::NetIfaceConfig;
use fctest::{
    FcMetricsMonitor, HarnessConfig, MicrovmBuilder, RestoreOptions, SnapshotKind,
    SnapshotSession, TestMatrix,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_mmds_survives_snapshot_restore() {
    fctest::logging::init_for_tests();
    let config = Arc::new(HarnessConfig::load(None).unwrap());
    let collection = ArtifactCollection::new(config.artifact_dir());
    let matrix = TestMatrix::new(
        vec![
            collection.kernels(None).await.unwrap(),
            collection.disks(Some("ubuntu")).await.unwrap(),
            collection.microvms(Some("2vcpu")).await.unwrap(),
        ],
        Arc::new(MicrovmBuilder::new(config.clone())),
    );

    let ran = matrix
        .run(|cell| async move {
            let builder = cell.params();
            let iface = NetIfaceConfig::default();
            let (mut vm, _metrics) = builder
                .build_from_artifacts(
                    cell.kernel()?,
                    cell.disk()?,
                    cell.microvm()?,
                    Some(iface.clone()),
                    false,
                )
                .await?;
            vm.configure_mmds(MmdsVersion::V2, &[iface.iface_id()]).await?;
            vm.start().await?;

            let record = vm.flush_metrics().await?;
            let problems =
                fctest::metrics::validate(&record, fctest::metrics::now_ms(), &vm.harness_config().host.arch);
            anyhow::ensure!(problems.is_empty(), "invalid metrics record: {:?}", problems);

            let mut monitor = FcMetricsMonitor::for_vm(
                &vm,
                Arc::new(fctest::monitor::TracingSink),
            )?;
            monitor.start()?;

            let data = json!({"latest": {"meta-data": {"ami-id": "ami-12345678"}}});
            vm.put_mmds(&data).await?;

            let ssh = vm.ssh()?;
            ssh.wait_ready(60, Duration::from_secs(1)).await?;
            ssh.execute_command(&mmds::route_cmd(mmds::DEFAULT_IPV4, &iface.dev_name))
                .await?;
            let token = mmds::generate_token(&ssh, mmds::DEFAULT_IPV4, 60).await?;
            let before = mmds::get(&ssh, mmds::DEFAULT_IPV4, "/latest/meta-data/ami-id", Some(&token)).await?;
            anyhow::ensure!(before.trim() == "ami-12345678", "unexpected ami-id {:?}", before);

            monitor.stop().await;
            let rootfs = cell.disk()?.download().await?;
            let key = cell
                .disk()?
                .ssh_key()
                .ok_or_else(|| anyhow::anyhow!("disk has no ssh key"))?;
            let snapshot = SnapshotSession::new(&mut vm)
                .create(&[rootfs], &key, SnapshotKind::Full)
                .await?;
            vm.kill().await?;

            let (restored, _metrics) = builder
                .build_from_snapshot(
                    &snapshot,
                    RestoreOptions {
                        net: Some(iface.clone()),
                        resume: true,
                        ..Default::default()
                    },
                )
                .await?;
            anyhow::ensure!(restored.get_mmds().await? == data, "MMDS content lost");

            let ssh = restored.ssh()?;
            ssh.wait_ready(30, Duration::from_secs(1)).await?;
            // A token minted on the original VM is not valid in the restored one.
            let stale = mmds::get(&ssh, mmds::DEFAULT_IPV4, "/latest/meta-data/ami-id", Some(&token)).await?;
            anyhow::ensure!(stale.contains(faults::MMDS_TOKEN_INVALID), "stale token accepted: {:?}", stale);
            let token = mmds::generate_token(&ssh, mmds::DEFAULT_IPV4, 60).await?;
            let after = mmds::get(&ssh, mmds::DEFAULT_IPV4, "/latest/meta-data/ami-id", Some(&token)).await?;
            anyhow::ensure!(after.trim() == "ami-12345678", "unexpected ami-id {:?}", after);
            Ok::<(), anyhow::Error>(())
        })
        .await
        .unwrap();
    assert!(ran > 0, "no artifacts found under {}", config.artifact_dir().display());
}
