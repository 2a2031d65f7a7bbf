//! Integration tests for the primitive peripheral operations
//!
//! Every test runs on paused time against the mock transport, so watchdog
//! expiries and transport latencies are deterministic.

mod test_utils;

use std::time::Duration;

use gattkit_core::mock::{MockBehavior, MockCall, MockOp};
use gattkit_core::uuids::services;
use gattkit_core::{AdapterState, BleError, TransportError, WriteType};
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready, task};

use test_utils::*;

// ----------------------------------------------------------------------------
// Preconditions
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_powered_off_short_circuits_without_transport_calls() {
    let mock = mock_with(sensor_tree());
    mock.set_adapter_state(AdapterState::PoweredOff);
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    assert_eq!(
        peripheral.connect(Some(Duration::from_secs(1))).await.err(),
        Some(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.discover_services(None, Some(Duration::from_secs(1))).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.read_value(battery_level(), Some(Duration::from_secs(1))).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.write_value(battery_level(), vec![1], Some(Duration::from_secs(1))).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.set_notify(battery_level(), true, None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.write_value_without_response(battery_level(), vec![1]).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(peripheral.read_rssi(None).await, Err(BleError::CentralNotReady));
    assert_eq!(
        peripheral.discover_included_services(services::BATTERY, None, None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.discover_characteristics(services::BATTERY, None, None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.discover_descriptors(battery_level(), None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.read_descriptor(battery_cccd(), None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.write_descriptor(battery_cccd(), vec![0x01, 0x00], None).await,
        Err(BleError::CentralNotReady)
    );
    assert_eq!(
        peripheral.disconnect(Some(Duration::from_secs(1))).await,
        Err(BleError::CentralNotReady)
    );

    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_peripheral_reports_not_connected() {
    let mock = mock_with(sensor_tree());
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    assert_eq!(
        peripheral.discover_services(None, Some(Duration::from_secs(1))).await,
        Err(BleError::NotConnected)
    );
    assert_eq!(
        peripheral.read_descriptor(battery_cccd(), None).await,
        Err(BleError::NotConnected)
    );
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_precondition_failure_is_never_synchronous() {
    let mock = mock_with(sensor_tree());
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    let mut read = task::spawn(peripheral.read_value(battery_level(), None));
    assert_pending!(read.poll());

    settle().await;
    let result = assert_ready!(read.poll());
    assert_eq!(result, Err(BleError::NotConnected));
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, disconnection) = connected(&mock).await;
    assert!(peripheral.is_connected());

    peripheral.disconnect(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(disconnection.await, None);
    assert!(!peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_already_disconnected_is_immediate() {
    let mock = mock_with(sensor_tree());
    let central = central(&mock);

    central.peripheral(device()).disconnect(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(mock.count_calls(is_cancel), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_cancels_and_fails_once() {
    let mock = mock_with(sensor_tree());
    mock.script(&device(), MockOp::Connect, MockBehavior::Ignore);
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    let started = Instant::now();
    let result = peripheral.connect(Some(Duration::from_secs(3))).await;
    assert_eq!(result.err(), Some(BleError::Timeout));
    assert_elapsed(started, Duration::from_secs(3));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(mock.count_calls(is_cancel), 1);

    // The slot is free again for a fresh attempt
    mock.script(&device(), MockOp::Connect, MockBehavior::Respond { after: Duration::from_millis(10) });
    assert!(peripheral.connect(Some(Duration::from_secs(3))).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_immediate_retry_after_connect_timeout() {
    let mock = mock_with(sensor_tree());
    mock.script(&device(), MockOp::Connect, MockBehavior::Ignore);
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    let first = peripheral.connect(Some(Duration::from_secs(3))).await;
    assert_eq!(first.err(), Some(BleError::Timeout));

    // The Disconnected answering the reissued cancel belongs to the first attempt
    mock.script(&device(), MockOp::Connect, MockBehavior::Respond { after: Duration::from_millis(50) });
    let mut disconnection = peripheral.connect(Some(Duration::from_secs(3))).await.unwrap();
    assert!(peripheral.is_connected());
    assert_eq!(disconnection.try_ended(), None);

    let calls: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MockCall::Connect(_) | MockCall::CancelConnection(_)))
        .collect();
    assert_eq!(
        calls,
        vec![
            MockCall::Connect(device()),
            MockCall::CancelConnection(device()),
            MockCall::Connect(device()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_abandoned_link_teardown() {
    let mock = mock_with(sensor_tree());
    mock.script(&device(), MockOp::Connect, MockBehavior::Ignore);
    mock.script(&device(), MockOp::CancelConnection, MockBehavior::Respond { after: Duration::from_secs(2) });
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    assert_eq!(peripheral.connect(Some(Duration::from_secs(1))).await.err(), Some(BleError::Timeout));

    mock.script(&device(), MockOp::Connect, MockBehavior::Respond { after: Duration::from_millis(10) });
    let started = Instant::now();
    let retry = peripheral.connect(Some(Duration::from_secs(5)));
    settle().await;
    assert_eq!(mock.count_calls(|call| matches!(call, MockCall::Connect(_))), 1);

    assert!(retry.await.is_ok());
    assert_elapsed(started, Duration::from_millis(2010));
    assert!(peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_held_back_connect_is_bounded_by_its_timeout() {
    let mock = mock_with(sensor_tree());
    mock.script(&device(), MockOp::Connect, MockBehavior::Ignore);
    mock.script(&device(), MockOp::CancelConnection, MockBehavior::Ignore);
    let central = central(&mock);
    let peripheral = central.peripheral(device());

    assert_eq!(peripheral.connect(Some(Duration::from_secs(1))).await.err(), Some(BleError::Timeout));

    // The teardown never arrives, so the held-back attempt times out unsent
    mock.script(&device(), MockOp::Connect, MockBehavior::Respond { after: Duration::from_millis(10) });
    assert_eq!(peripheral.connect(Some(Duration::from_secs(1))).await.err(), Some(BleError::Timeout));
    assert_eq!(mock.count_calls(|call| matches!(call, MockCall::Connect(_))), 1);
    assert_eq!(mock.count_calls(is_cancel), 1);

    // After that the device is connectable again
    assert!(peripheral.connect(Some(Duration::from_secs(1))).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_unknown_peripheral_fails() {
    let mock = mock_with(sensor_tree());
    let central = central(&mock);

    let result = central.peripheral("11:22:33:44:55:66").connect(None).await;
    assert!(matches!(result, Err(BleError::ConnectionFailed(Some(_)))));
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_rejected() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let result = peripheral.connect(Some(Duration::from_secs(1))).await;
    assert!(matches!(result, Err(BleError::InvalidParam { ref param, .. }) if param == "device"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_timeout_reissues_cancel() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::CancelConnection, MockBehavior::Ignore);

    let result = peripheral.disconnect(Some(Duration::from_secs(2))).await;
    assert_eq!(result, Err(BleError::Timeout));
    assert_eq!(disconnection.await, Some(BleError::Timeout));

    settle().await;
    assert_eq!(mock.count_calls(is_cancel), 2);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_pending_operations() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::ReadCharacteristic(battery_level()), MockBehavior::Ignore);

    let read = peripheral.read_value(battery_level(), Some(Duration::from_secs(10)));
    settle().await;
    let cause = TransportError::with_code(8, "supervision timeout");
    mock.drop_link(&device(), Some(cause.clone()));

    assert_eq!(read.await, Err(BleError::Disconnected(Some(cause.clone()))));
    assert_eq!(disconnection.await, Some(BleError::Disconnected(Some(cause))));
    assert_eq!(
        peripheral.read_value(battery_level(), None).await,
        Err(BleError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_power_loss_fails_pending_operations() {
    let mock = mock_with(sensor_tree());
    let (central, peripheral, disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::ReadRssi, MockBehavior::Ignore);

    let rssi = peripheral.read_rssi(None);
    settle().await;
    mock.set_adapter_state(AdapterState::PoweredOff);

    assert_eq!(rssi.await, Err(BleError::CentralNotReady));
    assert_eq!(disconnection.await, Some(BleError::CentralNotReady));
    assert_eq!(*central.state_changes().borrow(), AdapterState::PoweredOff);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_everything() {
    let mock = mock_with(sensor_tree());
    let (central, peripheral, disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::DiscoverServices, MockBehavior::Ignore);

    let discovery = peripheral.discover_services(None, None);
    settle().await;
    central.shutdown();

    assert_eq!(discovery.await, Err(BleError::CentralNotReady));
    assert_eq!(disconnection.await, Some(BleError::CentralNotReady));
    assert_eq!(
        peripheral.read_value(battery_level(), None).await,
        Err(BleError::CentralNotReady)
    );
}

// ----------------------------------------------------------------------------
// Watchdogs
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_operation_times_out_and_late_answer_is_dropped() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.set_value(&device(), battery_level(), vec![42]);
    mock.script(
        &device(),
        MockOp::ReadCharacteristic(battery_level()),
        MockBehavior::Respond { after: Duration::from_secs(5) },
    );

    let started = Instant::now();
    let result = peripheral.read_value(battery_level(), Some(Duration::from_secs(2))).await;
    assert_eq!(result, Err(BleError::Timeout));
    assert_elapsed(started, Duration::from_secs(2));

    // The late answer arrives with nothing registered and is ignored
    tokio::time::sleep(Duration::from_secs(5)).await;

    mock.script(
        &device(),
        MockOp::ReadCharacteristic(battery_level()),
        MockBehavior::Respond { after: Duration::from_millis(10) },
    );
    let value = peripheral.read_value(battery_level(), Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(value.value, Some(vec![42]));
}

#[tokio::test(start_paused = true)]
async fn test_answer_and_timeout_together_deliver_once() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(
        &device(),
        MockOp::WriteCharacteristic(battery_level()),
        MockBehavior::Respond { after: Duration::from_secs(1) },
    );

    let result = peripheral
        .write_value(battery_level(), vec![1], Some(Duration::from_secs(1)))
        .await;
    assert!(matches!(result, Ok(_) | Err(BleError::Timeout)));

    // Whatever lost the race must not disturb the next write
    mock.script(
        &device(),
        MockOp::WriteCharacteristic(battery_level()),
        MockBehavior::Respond { after: Duration::from_millis(10) },
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(peripheral
        .write_value(battery_level(), vec![2], Some(Duration::from_secs(1)))
        .await
        .is_ok());
    assert_eq!(mock.value(&device(), &battery_level()), Some(vec![2]));
}

#[tokio::test(start_paused = true)]
async fn test_no_timeout_means_unbounded_wait() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::ReadDescriptor(battery_cccd()), MockBehavior::Ignore);

    let read = peripheral.read_descriptor(battery_cccd(), None);
    let waited = tokio::time::timeout(Duration::from_secs(3600), read).await;
    assert!(waited.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_pending_operation_is_rejected() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.set_value(&device(), battery_level(), vec![77]);

    let first = peripheral.read_value(battery_level(), Some(Duration::from_secs(1)));
    let second = peripheral.read_value(battery_level(), Some(Duration::from_secs(1)));

    let second = second.await;
    assert!(matches!(second, Err(BleError::InvalidParam { ref param, .. }) if param == "operation"));
    assert_eq!(first.await.unwrap().value, Some(vec![77]));
    assert_eq!(
        mock.count_calls(|call| matches!(call, MockCall::ReadCharacteristic(..))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_is_wrapped() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    let cause = TransportError::with_code(2, "read not permitted");
    mock.script(
        &device(),
        MockOp::ReadCharacteristic(battery_level()),
        MockBehavior::Fail {
            after: Duration::from_millis(10),
            error: cause.clone(),
        },
    );

    let err = peripheral.read_value(battery_level(), None).await.unwrap_err();
    assert_eq!(err, BleError::OperationFailed(cause.clone()));
    assert_eq!(err.transport_error(), Some(&cause));
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_discovery_levels_populate_cache() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let services = peripheral.discover_services(None, None).await.unwrap();
    assert_eq!(services.len(), 2);
    let characteristics = peripheral.discover_characteristics(SERVICE_A, None, None).await.unwrap();
    assert_eq!(characteristics.len(), 3);
    let descriptors = peripheral
        .discover_descriptors(char_id(SERVICE_A, CHAR_A1), None)
        .await
        .unwrap();
    assert_eq!(descriptors.len(), 1);

    let cached = peripheral.services().await.unwrap();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[0].characteristics.len(), 3);
    assert_eq!(cached[0].characteristics[0].descriptors.len(), 1);
    assert!(cached[1].characteristics.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_replaces_cache() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    peripheral.discover_services(None, None).await.unwrap();
    peripheral.discover_characteristics(SERVICE_A, None, None).await.unwrap();
    peripheral.discover_services(Some(vec![SERVICE_B]), None).await.unwrap();

    let cached = peripheral.services().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].uuid, SERVICE_B);
}

#[tokio::test(start_paused = true)]
async fn test_cache_is_cleared_on_disconnect() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, disconnection) = connected(&mock).await;

    peripheral.discover_services(None, None).await.unwrap();
    mock.drop_link(&device(), None);
    assert_eq!(disconnection.await, None);
    assert!(peripheral.services().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_composite_discover_passes_remaining_budget() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::DiscoverServices, MockBehavior::Respond { after: Duration::from_secs(4) });
    mock.script(
        &device(),
        MockOp::DiscoverCharacteristics(SERVICE_A),
        MockBehavior::Respond { after: Duration::from_secs(7) },
    );

    // 7s would fit the full budget but not the 6s left after service discovery
    let started = Instant::now();
    let result = peripheral.discover(None, SERVICE_A, Some(Duration::from_secs(10))).await;
    assert_eq!(result, Err(BleError::Timeout));
    assert_elapsed(started, Duration::from_secs(10));
    assert_eq!(
        mock.count_calls(|call| matches!(call, MockCall::DiscoverServices(_, Some(filter)) if filter == &vec![SERVICE_A])),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_composite_discover_within_budget() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::DiscoverServices, MockBehavior::Respond { after: Duration::from_secs(4) });
    mock.script(
        &device(),
        MockOp::DiscoverCharacteristics(SERVICE_A),
        MockBehavior::Respond { after: Duration::from_secs(5) },
    );

    let characteristics = peripheral
        .discover(Some(vec![CHAR_A2]), SERVICE_A, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(characteristics.len(), 1);
    assert_eq!(characteristics[0].uuid, CHAR_A2);
}

#[tokio::test(start_paused = true)]
async fn test_composite_discover_slow_services_times_out() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::DiscoverServices, MockBehavior::Respond { after: Duration::from_secs(11) });

    let result = peripheral.discover(None, SERVICE_A, Some(Duration::from_secs(10))).await;
    assert_eq!(result, Err(BleError::Timeout));
    assert_eq!(mock.count_calls(is_characteristic_discovery), 0);
}

#[tokio::test(start_paused = true)]
async fn test_composite_discover_missing_service() {
    let mock = mock_with(two_service_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let result = peripheral.discover(None, SERVICE_B, None).await;
    assert!(result.is_ok());

    let missing = gattkit_core::uuids::from_u16(0xFFC0);
    let result = peripheral.discover(None, missing, None).await;
    assert!(matches!(result, Err(BleError::InvalidParam { ref param, .. }) if param == "service"));
}

// ----------------------------------------------------------------------------
// Values and Notifications
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_value_update_reaches_read_and_listener() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let (enabled, mut notifications) = peripheral.subscribe(battery_level(), Some(Duration::from_secs(1)));
    assert!(enabled.await.unwrap().is_notifying);

    mock.script(&device(), MockOp::ReadCharacteristic(battery_level()), MockBehavior::Ignore);
    let read = peripheral.read_value(battery_level(), Some(Duration::from_secs(5)));
    settle().await;
    mock.notify(&device(), battery_level(), vec![64]);

    assert_eq!(read.await.unwrap().value, Some(vec![64]));
    assert_eq!(notifications.recv().await, Some(Ok(vec![64])));
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_closes_notification_stream() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let (enabled, mut notifications) = peripheral.subscribe(heart_rate_measurement(), None);
    enabled.await.unwrap();
    mock.notify(&device(), heart_rate_measurement(), vec![0x00, 72]);
    mock.notify(&device(), heart_rate_measurement(), vec![0x00, 75]);
    settle().await;

    let disabled = peripheral.unsubscribe(heart_rate_measurement(), None).await.unwrap();
    assert!(!disabled.is_notifying);

    assert_eq!(notifications.recv().await, Some(Ok(vec![0x00, 72])));
    assert_eq!(notifications.recv().await, Some(Ok(vec![0x00, 75])));
    assert_eq!(notifications.recv().await, None);
    assert!(mock.calls().contains(&MockCall::SetNotify(device(), heart_rate_measurement(), false)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscribe_drops_listener() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(
        &device(),
        MockOp::SetNotify(heart_rate_measurement()),
        MockBehavior::Fail {
            after: Duration::from_millis(10),
            error: TransportError::new("insufficient authentication"),
        },
    );

    let (enabled, mut notifications) = peripheral.subscribe(heart_rate_measurement(), None);
    assert!(matches!(enabled.await, Err(BleError::OperationFailed(_))));
    assert_eq!(notifications.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_write_without_response_completes_immediately() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.script(&device(), MockOp::WriteCharacteristic(battery_level()), MockBehavior::Ignore);

    let started = Instant::now();
    peripheral
        .write_value_without_response(battery_level(), vec![9, 9])
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(5));
    assert_eq!(mock.value(&device(), &battery_level()), Some(vec![9, 9]));
    assert!(mock.calls().contains(&MockCall::WriteCharacteristic(
        device(),
        battery_level(),
        vec![9, 9],
        WriteType::WithoutResponse
    )));
}

#[tokio::test(start_paused = true)]
async fn test_descriptor_read_and_write() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.set_descriptor_value(&device(), battery_cccd(), vec![0x00, 0x00]);

    let descriptor = peripheral.read_descriptor(battery_cccd(), None).await.unwrap();
    assert_eq!(descriptor.value, Some(vec![0x00, 0x00]));

    peripheral
        .write_descriptor(battery_cccd(), vec![0x01, 0x00], Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let descriptor = peripheral.read_descriptor(battery_cccd(), None).await.unwrap();
    assert_eq!(descriptor.value, Some(vec![0x01, 0x00]));
}

// ----------------------------------------------------------------------------
// Signal Strength
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_rssi_sentinel_means_unavailable() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    mock.set_rssi(&device(), -42);
    assert_eq!(peripheral.read_rssi(None).await, Ok(Some(-42)));

    mock.set_rssi(&device(), gattkit_core::RSSI_UNAVAILABLE);
    assert_eq!(peripheral.read_rssi(None).await, Ok(None));
}

#[tokio::test(start_paused = true)]
async fn test_rssi_polling_until_stopped() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;
    mock.set_rssi(&device(), -55);

    let mut readings = peripheral.start_rssi_polling(Some(Duration::from_secs(1)));
    for _ in 0..3 {
        assert_eq!(readings.recv().await, Some(Ok(Some(-55))));
    }

    peripheral.stop_rssi_polling();
    assert_eq!(readings.recv().await, None);
    assert_eq!(
        mock.count_calls(|call| matches!(call, MockCall::ReadRssi(_))),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_rssi_polling_rejects_zero_interval() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let mut readings = peripheral.start_rssi_polling(Some(Duration::ZERO));
    assert!(matches!(
        readings.recv().await,
        Some(Err(BleError::InvalidParam { ref param, .. })) if param == "interval"
    ));
    assert_eq!(readings.recv().await, None);
    assert_eq!(mock.count_calls(|call| matches!(call, MockCall::ReadRssi(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_polling_ends_with_link() {
    let mock = mock_with(sensor_tree());
    let (_central, peripheral, _disconnection) = connected(&mock).await;

    let mut readings = peripheral.start_rssi_polling(Some(Duration::from_millis(500)));
    assert!(matches!(readings.recv().await, Some(Ok(Some(_)))));

    mock.drop_link(&device(), None);
    assert_eq!(readings.recv().await, None);
}
