//! Registry behaviour with real (emulated) drivers behind it.

use la_core::{AnalyzerDriver, CaptureSession, ConnectionParams, DriverType, SharedDriver};
use la_drivers::{EmulatedAnalyzer, EmulatedFault};
use la_hardware::detection::{tags, StaticDetector};
use la_hardware::{
    DeviceDescriptor, DriverRegistration, HardwareConfig, HardwareDriverManager, RegistryError,
};
use std::sync::Arc;
use std::time::Duration;

fn test_driver_registration() -> DriverRegistration {
    DriverRegistration::new("test-driver", "Test driver", |conn| {
        let channels = conn
            .strip_prefix("test:")
            .and_then(|n| n.parse().ok())
            .unwrap_or(8);
        Ok(Arc::new(
            EmulatedAnalyzer::with_channels(channels).with_delay(Duration::from_millis(1)),
        ) as SharedDriver)
    })
    .with_description("in-process analyzer for tests")
    .supporting("test")
    .with_priority(50)
}

#[tokio::test]
async fn detect_connect_dispose_keeps_registrations() {
    let manager = HardwareDriverManager::new();
    manager.register_driver(test_driver_registration());
    manager.add_detector(Arc::new(StaticDetector::new(
        "fixture",
        vec![
            DeviceDescriptor::new("Bench A", "test:16", "test", 0.7),
            DeviceDescriptor::new("Bench B", "test:8", "test", 0.9),
        ],
    )));

    let devices = manager.detect_hardware(false).await;
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "Bench B");

    let driver = manager
        .connect_device(&devices[1], &ConnectionParams::default())
        .await
        .unwrap();
    assert_eq!(driver.channel_count(), 16);
    assert!(manager.is_device_connected());
    assert_eq!(manager.get_active_connections().len(), 1);

    // Connecting the same descriptor again returns the tracked instance.
    let again = manager
        .connect_device(&devices[1], &ConnectionParams::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&driver, &again));

    manager.dispose().await;
    assert!(manager.get_active_connections().is_empty());
    assert!(manager.get_current_device().is_none());
    assert!(!driver.is_connected());
    assert_eq!(manager.get_registered_drivers().len(), 1);

    // Re-detection after dispose needs no re-registration.
    let devices = manager.detect_hardware(true).await;
    assert_eq!(devices.len(), 2);
    assert!(manager
        .connect_device(&devices[0], &ConnectionParams::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn disconnect_device_updates_tracking() {
    let manager = HardwareDriverManager::from_config(&HardwareConfig::default());
    let descriptor = DeviceDescriptor::from_connection_string("emulated:8");
    assert_eq!(descriptor.driver_type, tags::EMULATED);

    let driver = manager
        .connect_device(&descriptor, &ConnectionParams::default())
        .await
        .unwrap();
    assert_eq!(driver.driver_type(), DriverType::Emulated);
    assert!(manager.disconnect_device(&descriptor.id).await);
    assert!(!manager.disconnect_device(&descriptor.id).await);
    assert!(!manager.is_device_connected());
    assert!(!driver.is_connected());
}

#[tokio::test]
async fn connect_failures_are_reported_and_not_tracked() {
    let manager = HardwareDriverManager::new();
    manager.register_driver(
        DriverRegistration::new("flaky", "Flaky", |_| {
            Ok(Arc::new(
                EmulatedAnalyzer::with_channels(8).with_fault(EmulatedFault::RejectConnect),
            ) as SharedDriver)
        })
        .supporting("test"),
    );

    let descriptor = DeviceDescriptor::new("Flaky", "test:8", "test", 1.0);
    let err = manager
        .connect_device(&descriptor, &ConnectionParams::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RegistryError::Connect { .. }));
    assert!(manager.get_active_connections().is_empty());
}

#[tokio::test]
async fn cached_detection_respects_ttl() {
    let manager = HardwareDriverManager::new().with_cache_ttl(Duration::from_secs(60));
    manager.add_detector(Arc::new(StaticDetector::new(
        "first",
        vec![DeviceDescriptor::new("A", "emulated", tags::EMULATED, 0.5)],
    )));
    assert_eq!(manager.detect_hardware(true).await.len(), 1);

    manager.add_detector(Arc::new(StaticDetector::new(
        "second",
        vec![DeviceDescriptor::new("B", "emulated:8", tags::EMULATED, 0.5)],
    )));
    assert_eq!(manager.detect_hardware(true).await.len(), 1);
    assert_eq!(manager.detect_hardware(false).await.len(), 2);

    manager.add_detector(Arc::new(StaticDetector::new(
        "third",
        vec![DeviceDescriptor::new("C", "emulated:4", tags::EMULATED, 0.5)],
    )));
    assert_eq!(manager.detect_hardware(true).await.len(), 2);
    manager.invalidate_cache();
    assert_eq!(manager.detect_hardware(true).await.len(), 3);
}

#[tokio::test]
async fn emulated_capture_through_the_registry() {
    let manager = HardwareDriverManager::from_config(&HardwareConfig::default());
    let driver = manager
        .create_driver_by_id("emulated", "emulated:8")
        .unwrap();
    driver.connect(&ConnectionParams::default()).await.unwrap();

    let session = CaptureSession::new(1_000_000, 4, 12)
        .with_channels([0, 1])
        .with_edge_trigger(0, false);
    let done = driver.start_capture(session).await.unwrap().wait().await.unwrap();
    assert!(done.success);
    assert_eq!(done.session.capture_channels[0].samples.as_ref().map(Vec::len), Some(16));
    driver.disconnect().await;
}
