//! End-to-end engine tests: write translation, cloud publication,
//! acknowledgement correlation, and expiry routing across the full stack.

use rustgovee::iot::{IotConfig, IotCoordinator, IotEvent};
use rustgovee::mode::{ModeDelegate, ModeRole, ModeState};
use rustgovee::state::{AnyState, DeviceState, ParseStrategy, StateLogic};
use rustgovee::{BrightnessState, Device, PowerState, StateCatalog};
use serde_json::json;
use tokio::time::Duration;

fn catalog() -> StateCatalog {
    StateCatalog::from_value(json!({
        "states": [
            {
                "state_name": "power",
                "op_type": "0xAA",
                "status_opcode": "0x01",
                "command_opcode": "0x33",
            },
            {
                "state_name": "brightness",
                "op_type": "0xAA",
                "status_opcode": "0x04",
                "command_opcode": "0x33",
                "range": {"min": 0, "max": 100},
            },
            {
                "state_name": "humidifier_mode",
                "op_type": "0xAA",
                "status_opcode": "0x05",
                "command_opcode": "0x33",
                "commands": {
                    "manual": "01",
                    "custom": "02",
                    "auto": "03",
                },
            },
        ]
    }))
    .unwrap()
}

fn device() -> Device {
    let catalog = catalog();
    let mut device = Device::new("device-42");
    device
        .add_state(Box::new(PowerState::from_catalog(&catalog).unwrap()))
        .add_state(Box::new(BrightnessState::from_catalog(&catalog).unwrap()));
    device
}

#[tokio::test(start_paused = true)]
async fn write_publish_acknowledge_round_trip() {
    let mut device = device();
    let (coordinator, mut outbound) = IotCoordinator::new(IotConfig::new("accounts/123"));
    let mut events = coordinator.subscribe();

    // Write: one command id, one queued command.
    let ids = device.set_state("power", &json!(true));
    assert_eq!(ids.len(), 1);
    let queued = device.drain_commands();
    assert_eq!(queued.len(), 1);

    // Publish: envelope reaches the transport, command is pending.
    let command_id = coordinator
        .publish(device.id(), "devices/device-42/command", queued[0].clone())
        .await
        .unwrap();
    assert_eq!(command_id, ids[0]);

    let envelope = outbound.recv().await.unwrap();
    assert_eq!(envelope.envelope["msg"]["commandId"], json!(command_id));
    assert_eq!(
        envelope.envelope["msg"]["data"]["ble_base64"],
        json!(queued[0].ble_base64)
    );

    // The device reports back over the cloud channel, nested two levels.
    coordinator
        .handle_inbound(json!({
            "device": "device-42",
            "msg": {
                "cmd": "status",
                "commandId": command_id,
                "data": {
                    "op": {"command": [[0xAA, 0x01, 0x01]]},
                },
            },
        }))
        .await
        .unwrap();

    let acknowledged = events.recv().await.unwrap();
    let payload = match acknowledged {
        IotEvent::Acknowledged { command, payload } => {
            assert_eq!(command.command_id, command_id);
            payload
        }
        other => panic!("unexpected event: {:?}", other),
    };

    // The flattened payload parses straight into the state layer.
    let changed = device.parse(&payload);
    assert_eq!(changed, vec!["power"]);
    assert_eq!(device.value("power"), Some(json!(true)));

    let cleared = device.drain_clear_events();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].command_id, command_id);
    assert_eq!(cleared[0].value, json!(true));

    coordinator.stop();
}

#[tokio::test(start_paused = true)]
async fn expiry_clears_state_pending_exactly_once() {
    let mut device = device();
    let config = IotConfig::new("accounts/123").with_ttl(Duration::from_secs(1));
    let (coordinator, _outbound) = IotCoordinator::new(config);
    let mut events = coordinator.subscribe();

    let ids = device.set_state("brightness", &json!(60));
    let queued = device.drain_commands();
    coordinator
        .publish(device.id(), "devices/device-42/command", queued[0].clone())
        .await
        .unwrap();

    // The re-armed timer expires the command; the expiry is routed back to
    // the owning state, which emits its single clear event.
    let expired = match events.recv().await.unwrap() {
        IotEvent::Expired(command) => command,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(expired.command_id, ids[0]);
    assert_eq!(expired.device_id, "device-42");

    assert!(device.expire_command(expired.command_id));
    let cleared = device.drain_clear_events();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].command_id, ids[0]);

    // A late report for the expired command finds nothing to clear.
    device.parse(&json!({"op": {"command": [[0xAA, 0x04, 60]]}}));
    assert!(device.drain_clear_events().is_empty());
    assert_eq!(device.value("brightness"), Some(json!(60)));

    coordinator.stop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LightMode {
    Manual,
    Custom,
    Auto,
}

impl ModeRole for LightMode {
    fn as_str(&self) -> &'static str {
        match self {
            LightMode::Manual => "manual",
            LightMode::Custom => "custom",
            LightMode::Auto => "auto",
        }
    }
}

struct NoopLogic;

impl StateLogic for NoopLogic {
    type Value = u8;
}

fn mode_delegate(role: LightMode, identifier: u8) -> ModeDelegate<LightMode> {
    ModeDelegate::new(
        role,
        vec![identifier],
        Box::new(DeviceState::new(
            format!("{}_mode", role.as_str()),
            ParseStrategy::None,
            NoopLogic,
        )),
    )
}

#[tokio::test(start_paused = true)]
async fn mode_change_round_trips_through_the_cloud_channel() {
    let catalog = catalog();
    let mut mode = ModeState::new(
        "mode",
        0xAA,
        vec![
            mode_delegate(LightMode::Manual, 0x01),
            mode_delegate(LightMode::Custom, 0x02),
            mode_delegate(LightMode::Auto, 0x03),
        ],
    )
    .with_identifier([0x05])
    .with_catalog(catalog.entry("humidifier_mode").unwrap())
    .unwrap();

    let (coordinator, mut outbound) = IotCoordinator::new(IotConfig::new("accounts/123"));
    let mut events = coordinator.subscribe();

    let ids = mode.set_state("Custom-Mode");
    assert_eq!(ids.len(), 1);
    let queued = AnyState::drain_commands(&mut mode);
    assert_eq!(queued[0].payload_hex, "0502");

    coordinator
        .publish("device-42", "devices/device-42/command", queued[0].clone())
        .await
        .unwrap();
    outbound.recv().await.unwrap();

    coordinator
        .handle_inbound(json!({
            "device": "device-42",
            "msg": {
                "commandId": ids[0],
                "data": {"op": {"command": [[0xAA, 0x05, 0x02]]}},
            },
        }))
        .await
        .unwrap();

    let payload = match events.recv().await.unwrap() {
        IotEvent::Acknowledged { payload, .. } => payload,
        other => panic!("unexpected event: {:?}", other),
    };

    AnyState::parse(&mut mode, &payload);
    assert_eq!(mode.active_mode(), Some(LightMode::Custom));
    assert_eq!(mode.active_identifier(), Some(&[0x02][..]));

    let cleared = AnyState::drain_clear_events(&mut mode);
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].command_id, ids[0]);
    assert_eq!(cleared[0].value, json!("custom"));

    coordinator.stop();
}
