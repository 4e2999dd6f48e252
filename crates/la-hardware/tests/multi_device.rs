//! Synchronized capture over emulated ensembles.

use la_core::{
    AnalyzerDriver, CaptureError, CaptureSession, ConnectError, ConnectionParams, DriverType,
    SharedDriver,
};
use la_drivers::emulated::pattern_sample;
use la_drivers::{EmulatedAnalyzer, EmulatedFault};
use la_hardware::{HardwareConfig, HardwareDriverManager, MultiAnalyzerDriver};
use std::sync::Arc;
use std::time::Duration;

fn member(channels: u32) -> Arc<EmulatedAnalyzer> {
    Arc::new(EmulatedAnalyzer::with_channels(channels).with_delay(Duration::from_millis(2)))
}

fn ensemble(members: &[Arc<EmulatedAnalyzer>]) -> MultiAnalyzerDriver {
    MultiAnalyzerDriver::new(
        members
            .iter()
            .map(|m| m.clone() as SharedDriver)
            .collect(),
    )
    .unwrap()
}

#[tokio::test]
async fn merges_members_into_global_channels() {
    let members = [member(8), member(16)];
    let multi = ensemble(&members);
    let result = multi.connect(&ConnectionParams::default()).await.unwrap();
    assert_eq!(result.capabilities.channel_count, 24);
    assert_eq!(multi.driver_type(), DriverType::Multi);
    assert!(!multi.is_network());

    let session = CaptureSession::new(1_000_000, 4, 12)
        .with_channels([1, 8, 20])
        .with_edge_trigger(1, false);
    let done = multi.start_capture(session).await.unwrap().wait().await.unwrap();
    assert!(done.success, "{:?}", done.error);

    let expected = |local: u16| -> Vec<u8> { (0..16).map(|i| pattern_sample(local, i)).collect() };
    let channels = &done.session.capture_channels;
    assert_eq!(channels[0].channel_number, 1);
    assert_eq!(channels[0].samples, Some(expected(1)));
    // Global 8 is the slave's local 0, global 20 its local 12.
    assert_eq!(channels[1].samples, Some(expected(0)));
    assert_eq!(channels[2].samples, Some(expected(12)));
    assert!(!multi.is_capturing());
    assert!(!members[1].is_capturing());

    multi.disconnect().await;
    assert!(members.iter().all(|m| !m.is_connected()));
}

#[tokio::test]
async fn slave_failure_fails_the_whole_capture() {
    let members = [member(8), member(8), member(8)];
    let multi = ensemble(&members);
    multi.connect(&ConnectionParams::default()).await.unwrap();
    members[2].inject(EmulatedFault::FailCapture);

    let session = CaptureSession::new(1_000_000, 4, 12).with_channels([0, 9, 17]);
    let done = multi.start_capture(session).await.unwrap().wait().await.unwrap();
    assert!(!done.success);
    assert!(matches!(done.error, Some(CaptureError::HardwareError(_))));
    assert!(!multi.is_capturing());
    // Aborted member tasks release their capture flag once dropped.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(members.iter().all(|m| !m.is_capturing()));

    // The ensemble is usable again once the fault clears.
    members[2].clear_faults();
    let session = CaptureSession::new(1_000_000, 4, 12).with_channels([0, 17]);
    let done = multi.start_capture(session).await.unwrap().wait().await.unwrap();
    assert!(done.success);
}

#[tokio::test]
async fn arm_failure_stops_armed_members() {
    let members = [member(8), member(8), member(8)];
    let multi = ensemble(&members);
    multi.connect(&ConnectionParams::default()).await.unwrap();
    members[0].inject(EmulatedFault::FailArm);

    let session = CaptureSession::new(1_000_000, 4, 12).with_channels([0, 8, 16]);
    let rejected = multi.start_capture(session).await.unwrap_err();
    assert!(matches!(rejected.error, CaptureError::HardwareError(_)));
    assert_eq!(rejected.session.channel_numbers(), vec![0, 8, 16]);
    assert!(!multi.is_capturing());

    // Slaves were armed before the master and must have been stopped.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(members.iter().all(|m| !m.is_capturing()));
}

#[tokio::test]
async fn trigger_must_be_on_the_master() {
    let members = [member(8), member(8)];
    let multi = ensemble(&members);
    multi.connect(&ConnectionParams::default()).await.unwrap();

    let session = CaptureSession::new(1_000_000, 4, 12)
        .with_channels([0, 9])
        .with_edge_trigger(9, false);
    let rejected = multi.start_capture(session).await.unwrap_err();
    assert!(matches!(rejected.error, CaptureError::BadParams(_)));
    assert!(!multi.is_capturing());
}

#[tokio::test]
async fn connect_rolls_back_on_member_failure() {
    let members = [member(8), member(8)];
    members[1].inject(EmulatedFault::RejectConnect);
    let multi = ensemble(&members);

    let err = multi.connect(&ConnectionParams::default()).await.unwrap_err();
    assert!(matches!(err, ConnectError::Connection(_)));
    assert!(!multi.is_connected());
    assert!(!members[0].is_connected());
}

#[tokio::test]
async fn stop_cancels_every_member() {
    let slow = |channels| {
        Arc::new(EmulatedAnalyzer::with_channels(channels).with_delay(Duration::from_secs(30)))
    };
    let members = [slow(8), slow(8)];
    let multi = ensemble(&members);
    multi.connect(&ConnectionParams::default()).await.unwrap();

    let session = CaptureSession::new(1_000_000, 4, 12).with_channels([0, 8]);
    let handle = multi.start_capture(session).await.unwrap();
    assert!(multi.stop_capture().await);
    let done = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!done.success);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(members.iter().all(|m| !m.is_capturing()));
}

#[tokio::test]
async fn registry_builds_ensembles_from_connection_strings() {
    let manager = HardwareDriverManager::from_config(&HardwareConfig::default());
    let multi = manager
        .create_multi_device_driver(&["emulated:8", "emulated:16", "emulated:8"])
        .unwrap();
    assert_eq!(multi.members().len(), 3);
    multi.connect(&ConnectionParams::default()).await.unwrap();
    assert_eq!(multi.channel_count(), 32);
    let offsets: Vec<u32> = multi.slots().iter().map(|s| s.offset).collect();
    assert_eq!(offsets, vec![0, 8, 24]);
    multi.disconnect().await;

    for count in [0usize, 1, 6] {
        let conns = vec!["emulated"; count];
        assert!(manager.create_multi_device_driver(&conns).is_err());
    }
}
