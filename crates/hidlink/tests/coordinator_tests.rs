//! Integration tests for the device coordinator
//!
//! Drives the coordinator against the in-memory USB and BLE backends:
//! - Open/close lifecycle and idempotence
//! - Permission and timeout handling
//! - Input delivery, queueing and overflow
//! - Transport failure and hot-unplug
//! - Identity stability across rediscovery and restart

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, RecordingConsumer, mock_ble_identity, mock_metadata, mock_usb_identity,
};
use common::{HidEvent, IdentityStore};
use hidlink::test_utils::{MockBleBackend, MockGattConfig, MockPermission, MockUsbBackend};
use hidlink::usb::UsbTransportSettings;
use hidlink::{CoordinatorSettings, DeviceCoordinator};
use protocol::{DeviceId, DeviceState, HidError, TransportKind, UsbError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        usb: UsbTransportSettings {
            read_timeout: Duration::from_millis(20),
            write_timeout: Duration::from_millis(200),
        },
        ..CoordinatorSettings::default()
    }
}

fn usb_coordinator() -> (DeviceCoordinator, Arc<MockUsbBackend>, Arc<RecordingConsumer>) {
    let consumer = Arc::new(RecordingConsumer::new());
    let backend = MockUsbBackend::new();
    let coordinator = DeviceCoordinator::builder(consumer.clone())
        .usb_backend(backend.clone())
        .settings(fast_settings())
        .build();
    (coordinator, backend, consumer)
}

fn discover_usb(coordinator: &DeviceCoordinator, n: u32) -> DeviceId {
    coordinator
        .on_device_discovered(mock_usb_identity(n), mock_metadata("Test Pad", 0x045e, 0x028e))
        .unwrap()
}

/// Poll until the device reaches `state`
async fn wait_for_state(coordinator: &DeviceCoordinator, id: DeviceId, state: DeviceState) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if coordinator.state(id) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Poll until `n` input reports for `id` were delivered
async fn wait_for_inputs(consumer: &RecordingConsumer, id: DeviceId, n: usize) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if consumer.input_reports(id).len() >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_announces_device() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);

        let state = coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        assert_eq!(state, DeviceState::Open);
        assert_eq!(coordinator.state(id), Some(DeviceState::Open));
        assert_eq!(consumer.connected_count(id), 1);

        let connected = consumer
            .events()
            .into_iter()
            .find_map(|e| match e {
                HidEvent::Connected { device } => Some(device),
                _ => None,
            })
            .unwrap();
        assert_eq!(connected.kind, TransportKind::Usb);
        assert_eq!(connected.vendor_id, 0x045e);
        assert!(connected.capabilities.output_reports);

        let connection = backend.last_connection().unwrap();
        assert!(connection.is_claimed());

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_open_is_idempotent() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.set_open_delay(Duration::from_millis(50));
        let id = discover_usb(&coordinator, 1);

        let (first, second) = tokio::join!(
            coordinator.open(id, OPEN_TIMEOUT),
            coordinator.open(id, OPEN_TIMEOUT)
        );

        let first = first.unwrap();
        let second = second.unwrap();
        assert!(first.is_active() && second.is_active());
        assert!(first == DeviceState::Open || second == DeviceState::Open);

        assert_eq!(backend.open_count(), 1);
        assert_eq!(consumer.connected_count(id), 1);

        // Already open: no-op
        assert_eq!(coordinator.open(id, OPEN_TIMEOUT).await, Ok(DeviceState::Open));
        assert_eq!(backend.open_count(), 1);

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_terminal() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        coordinator.close(id).unwrap();
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(
            coordinator.read_report(id, Duration::ZERO),
            Err(HidError::NotOpen(id))
        );
        assert_eq!(
            coordinator.write_report(id, &[0, 1], false).await,
            Err(HidError::NotOpen(id))
        );
        assert_eq!(
            coordinator.get_feature_report(id, 1, 8).await,
            Err(HidError::NotOpen(id))
        );

        // Second close is a no-op
        coordinator.close(id).unwrap();
        assert_eq!(consumer.disconnected_count(id), 1);

        let connection = backend.last_connection().unwrap();
        assert!(connection.is_released());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_from_discovered() {
        let (coordinator, _backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);

        coordinator.close(id).unwrap();
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(
            coordinator.read_report(id, Duration::ZERO),
            Err(HidError::NotOpen(id))
        );
        // Never announced, so no terminal event
        assert_eq!(consumer.disconnected_count(id), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_after_close() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);

        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        coordinator.close(id).unwrap();
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        assert_eq!(backend.open_count(), 2);
        assert_eq!(consumer.connected_count(id), 2);
        assert_eq!(consumer.disconnected_count(id), 1);

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_mid_open_fails_pending_open() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.set_open_delay(Duration::from_millis(200));
        let id = discover_usb(&coordinator, 1);

        let opener = coordinator.clone();
        let pending = tokio::spawn(async move { opener.open(id, OPEN_TIMEOUT).await });

        assert!(wait_for_state(&coordinator, id, DeviceState::Opening).await);
        coordinator.close(id).unwrap();

        assert_eq!(pending.await.unwrap(), Err(HidError::NotOpen(id)));
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(consumer.connected_count(id), 0);
        assert_eq!(consumer.disconnected_count(id), 0);

        // The transport built after the close is torn down again
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(backend.last_connection().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (coordinator, _backend, _consumer) = usb_coordinator();
        assert_eq!(
            coordinator.open(DeviceId(42), OPEN_TIMEOUT).await,
            Err(HidError::UnknownDevice(DeviceId(42)))
        );
    }
}

// ============================================================================
// Permission and timeouts
// ============================================================================

mod permission {
    use super::*;

    #[tokio::test]
    async fn test_permission_denied() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.set_permission(MockPermission::Deny);
        let id = discover_usb(&coordinator, 1);

        assert_eq!(
            coordinator.open(id, OPEN_TIMEOUT).await,
            Err(HidError::PermissionDenied)
        );
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(backend.permission_requests(), 1);
        assert_eq!(backend.open_count(), 0);
        assert_eq!(consumer.connected_count(id), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_permission_granted_on_request() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        backend.set_permission(MockPermission::Grant);
        let id = discover_usb(&coordinator, 1);

        assert_eq!(coordinator.open(id, OPEN_TIMEOUT).await, Ok(DeviceState::Open));
        assert_eq!(backend.permission_requests(), 1);
        coordinator.close(id).unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_permission_times_out() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        backend.set_permission(MockPermission::Hang);
        let id = discover_usb(&coordinator, 1);

        let opener = coordinator.clone();
        let pending =
            tokio::spawn(async move { opener.open(id, Duration::from_millis(200)).await });

        assert!(wait_for_state(&coordinator, id, DeviceState::PendingPermission).await);
        assert_eq!(pending.await.unwrap(), Err(HidError::Timeout));
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_open_times_out_and_tears_down() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.set_open_delay(Duration::from_millis(300));
        let id = discover_usb(&coordinator, 1);

        assert_eq!(
            coordinator.open(id, Duration::from_millis(50)).await,
            Err(HidError::Timeout)
        );
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(backend.last_connection().unwrap().is_closed());
        assert_eq!(consumer.connected_count(id), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_failure_reported() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        backend.fail_open(UsbError::Access);
        let id = discover_usb(&coordinator, 1);

        assert_eq!(
            coordinator.open(id, OPEN_TIMEOUT).await,
            Err(HidError::PermissionDenied)
        );
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
    }
}

// ============================================================================
// Reports
// ============================================================================

mod reports {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_input_delivered_in_order() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let connection = backend.last_connection().unwrap();
        for i in 0..5u8 {
            connection.push_read(&[i, i + 1]);
        }

        assert!(wait_for_inputs(&consumer, id, 5).await);
        assert_eq!(
            consumer.input_reports(id),
            (0..5u8).map(|i| vec![i, i + 1]).collect::<Vec<_>>()
        );

        for i in 0..5u8 {
            let report = coordinator.read_report(id, Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(report.bytes, vec![i, i + 1]);
            assert_eq!(report.device_id, id);
            coordinator.recycle(report);
        }
        assert_eq!(coordinator.read_report(id, Duration::from_millis(10)), Ok(None));

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overflow_keeps_newest() {
        let consumer = Arc::new(RecordingConsumer::new());
        let backend = MockUsbBackend::new();
        let coordinator = DeviceCoordinator::builder(consumer.clone())
            .usb_backend(backend.clone())
            .settings(CoordinatorSettings {
                queue_capacity: 4,
                ..fast_settings()
            })
            .build();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let connection = backend.last_connection().unwrap();
        for i in 0..6u8 {
            connection.push_read(&[i]);
        }
        assert!(wait_for_inputs(&consumer, id, 6).await);

        let stats = coordinator.queue_stats(id).unwrap();
        assert_eq!(stats.received, 6);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.buffered, 4);

        let first = coordinator.read_report(id, Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.bytes, vec![2]);

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_wakes_blocked_reader() {
        let (coordinator, _backend, _consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let reader = coordinator.clone();
        let blocked =
            tokio::task::spawn_blocking(move || reader.read_report(id, Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.close(id).unwrap();

        assert_eq!(blocked.await.unwrap(), Err(HidError::NotOpen(id)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unbounded_read_waits_for_input() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        let connection = backend.last_connection().unwrap();

        let reader = coordinator.clone();
        let blocked = tokio::task::spawn_blocking(move || reader.read_report(id, Duration::MAX));

        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.push_read(&[0x11, 0x22]);

        let report = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.bytes, vec![0x11, 0x22]);

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_and_feature_reports() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        let connection = backend.last_connection().unwrap();

        assert_eq!(coordinator.write_report(id, &[0, 0x10, 0x20], false).await, Ok(3));
        assert_eq!(connection.writes(), vec![(0x02, vec![0x10, 0x20])]);

        connection.set_feature_response(&[0xAA, 0xBB]);
        assert_eq!(
            coordinator.get_feature_report(id, 0, 3).await,
            Ok(vec![0x00, 0xAA, 0xBB])
        );

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_requests_complete_with_token() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        backend
            .last_connection()
            .unwrap()
            .set_feature_response(&[0x03, 0x01]);

        let write = coordinator.submit_write(id, vec![0x01, 0x02], false).unwrap();
        let feature = coordinator.request_feature_report(id, 3, 2).unwrap();
        assert_ne!(write, feature);

        assert!(consumer.wait_for(DEFAULT_TEST_TIMEOUT, |e| matches!(
            e,
            HidEvent::WriteComplete { token, result: Ok(2), .. } if *token == write
        )));
        assert!(consumer.wait_for(DEFAULT_TEST_TIMEOUT, |e| matches!(
            e,
            HidEvent::FeatureReport { token, result: Ok(data), .. }
                if *token == feature && data == &vec![0x03, 0x01]
        )));

        coordinator.close(id).unwrap();
        assert_eq!(
            coordinator.submit_write(id, vec![0x01], false),
            Err(HidError::NotOpen(id))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_freeze_stops_and_thaw_resumes_input() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();
        let connection = backend.last_connection().unwrap();

        coordinator.freeze();
        assert!(coordinator.is_frozen());
        connection.push_read(&[0x42]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(consumer.input_reports(id).is_empty());
        assert_eq!(coordinator.state(id), Some(DeviceState::Open));
        assert!(connection.is_claimed());

        coordinator.thaw();
        assert!(wait_for_inputs(&consumer, id, 1).await);
        assert_eq!(consumer.input_reports(id), vec![vec![0x42]]);

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_thaw_racing_open_leaves_device_running() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.set_open_delay(Duration::from_millis(20));

        // Sweep the thaw across the window in which the open commits
        for (n, offset_ms) in (0..40u64).step_by(2).enumerate() {
            let id = discover_usb(&coordinator, n as u32 + 1);
            coordinator.freeze();

            let thawer = coordinator.clone();
            let thaw = tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(offset_ms));
                thawer.thaw();
            });
            let opened = coordinator.open(id, OPEN_TIMEOUT).await;
            thaw.await.unwrap();

            assert_eq!(opened, Ok(DeviceState::Open));
            assert!(!coordinator.is_frozen());

            let connection = backend.last_connection().unwrap();
            connection.push_read(&[n as u8]);
            assert!(
                wait_for_inputs(&consumer, id, 1).await,
                "device {} stayed frozen (thaw after {}ms)",
                id,
                offset_ms
            );
            coordinator.close(id).unwrap();
        }
    }
}

// ============================================================================
// Failures and hot-plug
// ============================================================================

mod failures {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_failure_disconnects_once() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let connection = backend.last_connection().unwrap();
        connection.push_read(&[1]);
        connection.push_read_error(UsbError::NoDevice);

        assert!(wait_for_state(&coordinator, id, DeviceState::Closed).await);
        assert!(consumer.wait_for(DEFAULT_TEST_TIMEOUT, |e| matches!(
            e,
            HidEvent::Disconnected { id: d } if *d == id
        )));

        coordinator.close(id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(consumer.disconnected_count(id), 1);

        // Disconnect is the last event for the device
        let last = consumer.events().into_iter().last().unwrap();
        assert_eq!(last, HidEvent::Disconnected { id });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_read_errors_are_retried() {
        let (coordinator, backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let connection = backend.last_connection().unwrap();
        connection.push_read_error(UsbError::Pipe);
        connection.push_read_error(UsbError::Overflow);
        connection.push_read(&[7]);

        assert!(wait_for_inputs(&consumer, id, 1).await);
        assert_eq!(coordinator.state(id), Some(DeviceState::Open));

        coordinator.close(id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removal_closes_and_keeps_identity() {
        let (coordinator, _backend, consumer) = usb_coordinator();
        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        coordinator.on_device_removed(&mock_usb_identity(1));
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(consumer.disconnected_count(id), 1);

        let again = discover_usb(&coordinator, 1);
        assert_eq!(again, id);
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (coordinator, _backend, consumer) = usb_coordinator();
        let a = discover_usb(&coordinator, 1);
        let b = discover_usb(&coordinator, 2);
        coordinator.open(a, OPEN_TIMEOUT).await.unwrap();

        coordinator.shutdown().unwrap();
        assert_eq!(coordinator.state(a), Some(DeviceState::Closed));
        assert_eq!(coordinator.state(b), Some(DeviceState::Closed));
        assert_eq!(consumer.disconnected_count(a), 1);
    }
}

// ============================================================================
// Identity
// ============================================================================

mod identity {
    use super::*;

    #[test]
    fn test_ids_stable_across_rediscovery() {
        let (coordinator, _backend, _consumer) = usb_coordinator();
        let a = discover_usb(&coordinator, 1);
        let b = coordinator
            .on_device_discovered(mock_ble_identity(1), mock_metadata("b", 0, 0))
            .unwrap();
        assert_ne!(a, b);

        for _ in 0..3 {
            assert_eq!(discover_usb(&coordinator, 1), a);
        }
        assert_eq!(coordinator.devices().len(), 2);
    }

    #[test]
    fn test_ids_stable_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identities.json");

        let (first_a, first_b) = {
            let consumer = Arc::new(RecordingConsumer::new());
            let coordinator = DeviceCoordinator::builder(consumer)
                .identity_store(IdentityStore::load(&path).unwrap())
                .build();
            let a = discover_usb(&coordinator, 1);
            let b = discover_usb(&coordinator, 2);
            coordinator.shutdown().unwrap();
            (a, b)
        };

        let consumer = Arc::new(RecordingConsumer::new());
        let coordinator = DeviceCoordinator::builder(consumer)
            .identity_store(IdentityStore::load(&path).unwrap())
            .build();

        // Rediscovered in the opposite order, same IDs
        assert_eq!(discover_usb(&coordinator, 2), first_b);
        assert_eq!(discover_usb(&coordinator, 1), first_a);
        // New identities continue after the persisted ones
        assert_eq!(discover_usb(&coordinator, 3), DeviceId(3));
    }

    #[test]
    fn test_exhausted_ids_reject_new_identities() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(
            &path,
            format!(r#"{{ "next_id": {}, "identities": {{}} }}"#, u32::MAX),
        )
        .unwrap();

        let consumer = Arc::new(RecordingConsumer::new());
        let coordinator = DeviceCoordinator::builder(consumer)
            .identity_store(IdentityStore::load(&path).unwrap())
            .build();

        assert_eq!(
            coordinator
                .on_device_discovered(mock_usb_identity(1), mock_metadata("pad", 1, 1)),
            Err(HidError::IdsExhausted)
        );
        assert!(coordinator.devices().is_empty());
    }
}

// ============================================================================
// BLE through the coordinator
// ============================================================================

mod ble {
    use super::*;
    use hidlink::ble::BleSettings;

    fn ble_coordinator(
        config: MockGattConfig,
    ) -> (DeviceCoordinator, Arc<MockBleBackend>, Arc<RecordingConsumer>) {
        let consumer = Arc::new(RecordingConsumer::new());
        let backend = MockBleBackend::with_config(config);
        let coordinator = DeviceCoordinator::builder(consumer.clone())
            .ble_backend(backend.clone())
            .settings(CoordinatorSettings {
                ble: BleSettings {
                    watchdog_interval: Duration::from_secs(60),
                    ..BleSettings::default()
                },
                ..fast_settings()
            })
            .build();
        (coordinator, backend, consumer)
    }

    #[tokio::test]
    async fn test_empty_first_discovery_connects_once() {
        let (coordinator, backend, consumer) = ble_coordinator(MockGattConfig {
            empty_discoveries: 1,
            ..MockGattConfig::default()
        });
        let id = coordinator
            .on_device_discovered(mock_ble_identity(1), mock_metadata("ble", 0, 0))
            .unwrap();

        assert_eq!(coordinator.open(id, OPEN_TIMEOUT).await, Ok(DeviceState::Open));

        let client = backend.last_client().unwrap();
        assert_eq!(client.connect_count(), 2);
        assert_eq!(client.disconnect_count(), 1);
        assert_eq!(consumer.connected_count(id), 1);

        coordinator.close(id).unwrap();
        assert_eq!(consumer.disconnected_count(id), 1);
    }

    #[tokio::test]
    async fn test_missing_service_fails_open() {
        let (coordinator, _backend, consumer) = ble_coordinator(MockGattConfig {
            empty_discoveries: 10,
            ..MockGattConfig::default()
        });
        let id = coordinator
            .on_device_discovered(mock_ble_identity(1), mock_metadata("ble", 0, 0))
            .unwrap();

        assert_eq!(coordinator.open(id, OPEN_TIMEOUT).await, Err(HidError::NoService));
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(consumer.connected_count(id), 0);
    }

    #[tokio::test]
    async fn test_notifications_and_link_loss() {
        let (coordinator, backend, consumer) = ble_coordinator(MockGattConfig::default());
        let id = coordinator
            .on_device_discovered(mock_ble_identity(1), mock_metadata("ble", 0, 0))
            .unwrap();
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        let client = backend.last_client().unwrap();
        client.notify(&[0x01, 0x02]);
        client.notify(&[0x03, 0x04]);

        let deadline = tokio::time::Instant::now() + DEFAULT_TEST_TIMEOUT;
        while consumer.input_reports(id).len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            consumer.input_reports(id),
            vec![vec![0x01, 0x02], vec![0x03, 0x04]]
        );

        client.drop_link();
        assert!(wait_for_state(&coordinator, id, DeviceState::Closed).await);
        assert_eq!(consumer.disconnected_count(id), 1);
    }

    #[tokio::test]
    async fn test_write_goes_through_report_characteristic() {
        let (coordinator, backend, _consumer) = ble_coordinator(MockGattConfig::default());
        let id = coordinator
            .on_device_discovered(mock_ble_identity(1), mock_metadata("ble", 0, 0))
            .unwrap();
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        assert_eq!(coordinator.write_report(id, &[0x05, 0xFF], true).await, Ok(2));
        let client = backend.last_client().unwrap();
        let (_, last) = client.writes().into_iter().last().unwrap();
        assert_eq!(last, vec![0xFF]);

        coordinator.close(id).unwrap();
    }
}

// ============================================================================
// USB discovery
// ============================================================================

mod discovery {
    use super::*;
    use hidlink::usb::UsbDiscovery;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_reports_arrivals_and_removals() {
        let (coordinator, backend, consumer) = usb_coordinator();
        backend.add_interface(mock_usb_identity(1), mock_metadata("pad", 0x045e, 0x028e));
        backend.add_interface(mock_usb_identity(2), mock_metadata("stick", 0x044f, 0xb10a));

        let mut discovery = UsbDiscovery::new(backend.clone(), &[]);
        assert_eq!(discovery.scan(&coordinator).unwrap(), 2);
        // Nothing changed
        assert_eq!(discovery.scan(&coordinator).unwrap(), 0);
        assert_eq!(coordinator.devices().len(), 2);

        let id = discover_usb(&coordinator, 1);
        coordinator.open(id, OPEN_TIMEOUT).await.unwrap();

        backend.remove_interface(&mock_usb_identity(1));
        assert_eq!(discovery.scan(&coordinator).unwrap(), 0);
        assert_eq!(coordinator.state(id), Some(DeviceState::Closed));
        assert_eq!(consumer.disconnected_count(id), 1);

        // Plugged back in: same ID, ready to open again
        backend.add_interface(mock_usb_identity(1), mock_metadata("pad", 0x045e, 0x028e));
        assert_eq!(discovery.scan(&coordinator).unwrap(), 1);
        assert_eq!(coordinator.open(id, OPEN_TIMEOUT).await, Ok(DeviceState::Open));
        coordinator.close(id).unwrap();
    }

    #[test]
    fn test_scan_applies_filters() {
        let (coordinator, backend, _consumer) = usb_coordinator();
        backend.add_interface(mock_usb_identity(1), mock_metadata("pad", 0x045e, 0x028e));
        backend.add_interface(mock_usb_identity(2), mock_metadata("stick", 0x044f, 0xb10a));

        let mut discovery = UsbDiscovery::new(backend.clone(), &["0x045e:*".to_string()]);
        assert_eq!(discovery.scan(&coordinator).unwrap(), 1);

        let devices = coordinator.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id, 0x045e);
    }
}
