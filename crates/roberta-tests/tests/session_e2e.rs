//! End-to-end tests for a healthy session
//!
//! A connector registers with the mock server, receives commands and drives
//! the mock robot. Run with: cargo test -p roberta-tests --test session_e2e

use std::time::Duration;

use pretty_assertions::assert_eq;
use roberta_connector::Connector;
use roberta_core::{ChannelError, ExecutionMode, State};
use roberta_device::mock::MockCall;
use roberta_device::MockDeviceChannel;
use roberta_tests::{
    auto_connect_settings, ev3, fast_settings, nao, state_stream, wait_for, MockServer,
    RunningConnector, TIMEOUT,
};
use serde_json::json;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_program_reaches_robot() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("download");
    server.set_program("NEPOprog.jar", vec![0xCA, 0xFE, 0xBA, 0xBE]);

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    let running = RunningConnector::start(channel, &server, auto_connect_settings());

    assert!(running.log.wait_for_count(State::WaitForCmd, 2).await);
    assert_eq!(
        mock.uploads(),
        vec![("NEPOprog.jar".to_string(), vec![0xCA, 0xFE, 0xBA, 0xBE])]
    );
    assert_eq!(
        &running.log.states()[..6],
        &[
            State::WaitForConnectButtonPress,
            State::ConnectButtonIsPressed,
            State::WaitForServer,
            State::WaitForCmd,
            State::WaitUpload,
            State::WaitForCmd,
        ]
    );

    // Every request carries the registered token
    let token = running.handle.token().expect("registered token");
    let pushes = server.pushes();
    assert_eq!(
        pushes[0],
        json!({
            "brickname": "EV3",
            "cmd": "register",
            "firmwarename": "ev3lejosv1",
            "robot": "ev3",
            "token": token.as_str(),
        })
    );
    assert_eq!(pushes[1]["cmd"], "push");
    assert!(pushes.iter().all(|p| p["token"] == token.as_str()));
    assert_eq!(server.downloads()[0]["token"], token.as_str());
    assert_eq!(server.pushes_with_cmd("register"), 1);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_connect_waits_for_operator() {
    let server = MockServer::start().await;
    let channel = MockDeviceChannel::new(ev3());
    let running = RunningConnector::start(channel, &server, fast_settings());

    assert!(running.log.wait_for_state(State::WaitForConnectButtonPress).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.handle.state(), State::WaitForConnectButtonPress);
    assert!(server.pushes().is_empty());
    assert!(running.handle.token().is_none());

    running.handle.connect();
    assert!(running.log.wait_for_state(State::WaitForCmd).await);
    assert_eq!(server.pushes_with_cmd("register"), 1);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_until_finished_program_waits_for_execution() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("download");
    server.set_program("prog.py", b"print('hi')".to_vec());

    let channel = MockDeviceChannel::new(ev3()).with_execution_mode(ExecutionMode::UntilFinished);
    let mock = channel.handle();
    mock.set_running_polls(2);
    let running = RunningConnector::start(channel, &server, auto_connect_settings());

    assert!(running.log.wait_for_count(State::WaitForCmd, 2).await);
    assert!(running.log.contains_sequence(&[
        State::WaitUpload,
        State::WaitExecution,
        State::WaitForCmd
    ]));
    assert_eq!(mock.count(MockCall::IsRunning), 3);
    assert!(!running.log.contains(State::Discover));

    assert!(running.close().await);
}

#[tokio::test]
async fn test_configuration_command_keeps_session() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("configuration");
    server.answer("download");
    server.set_program("prog.hex", vec![1, 2, 3]);

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    let running = RunningConnector::start(channel, &server, auto_connect_settings());

    assert!(running.log.wait_for_state(State::WaitUpload).await);
    assert!(running.log.wait_for_count(State::WaitForCmd, 2).await);
    assert_eq!(mock.uploads().len(), 1);
    assert!(!running.log.contains(State::Discover));
    assert_eq!(server.pushes_with_cmd("register"), 1);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_state_stream_follows_session() {
    let server = MockServer::start().await;
    let connector = Connector::new(
        Box::new(MockDeviceChannel::new(ev3())),
        server.session(),
        fast_settings(),
    );
    let handle = connector.handle();
    let mut states = Box::pin(state_stream(&handle));
    let task = tokio::spawn(connector.run());

    handle.connect();
    let mut seen = Vec::new();
    for _ in 0..4 {
        let state = tokio::time::timeout(TIMEOUT, states.next())
            .await
            .expect("state within timeout")
            .expect("stream open");
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            State::WaitForConnectButtonPress,
            State::ConnectButtonIsPressed,
            State::WaitForServer,
            State::WaitForCmd,
        ]
    );

    handle.close();
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(
        tokio::time::timeout(TIMEOUT, states.next()).await.unwrap(),
        Some(State::Discover)
    );
}

// =============================================================================
// Updates
// =============================================================================

#[tokio::test]
async fn test_firmware_update_success() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("update");
    server.add_firmware("EV3Runtime.jar", b"runtime".to_vec());
    server.add_firmware("json.jar", b"json".to_vec());

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    mock.set_firmware_files(vec!["EV3Runtime.jar".into(), "json.jar".into()]);
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(
        running
            .log
            .wait_for_sequence(&[State::UpdateSuccess, State::Discover])
            .await
    );
    let installed = mock.installed_firmware();
    let names: Vec<&str> = installed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["EV3Runtime.jar", "json.jar"]);
    assert_eq!(installed[0].bytes, b"runtime".to_vec());

    // The robot restarts its runtime, so the session starts over
    assert!(running.log.wait_for_count(State::WaitForConnectButtonPress, 2).await);
    assert!(running.handle.token().is_none());

    assert!(running.close().await);
}

#[tokio::test]
async fn test_firmware_update_rejected_by_robot() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("update");
    server.add_firmware("EV3Runtime.jar", b"runtime".to_vec());

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    mock.set_firmware_files(vec!["EV3Runtime.jar".into()]);
    mock.set_update_result(Err(ChannelError::Update("flash full".into())));
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(
        running
            .log
            .wait_for_sequence(&[State::UpdateFail, State::Discover])
            .await
    );
    let event = running.log.event(State::UpdateFail).unwrap();
    assert_eq!(event.diagnostics, vec!["Update failed: flash full".to_string()]);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_firmware_update_missing_file() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("update");

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    mock.set_firmware_files(vec!["EV3Runtime.jar".into()]);
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(
        running
            .log
            .wait_for_sequence(&[State::ErrorUpdate, State::Discover])
            .await
    );
    assert_eq!(mock.count(MockCall::UpdateFirmware), 0);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_update_without_runtime_files_fails() {
    let server = MockServer::start().await;
    server.answer("repeat");
    server.answer("update");

    let channel = MockDeviceChannel::new(ev3());
    let mock = channel.handle();
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(
        running
            .log
            .wait_for_sequence(&[State::UpdateFail, State::Discover])
            .await
    );
    assert_eq!(mock.count(MockCall::UpdateFirmware), 0);

    assert!(running.close().await);
}

// =============================================================================
// HAL
// =============================================================================

#[tokio::test]
async fn test_stale_hal_installed_before_registration() {
    let server = MockServer::start().await;
    server.set_hal("c0ffee", b"zip".to_vec());

    let channel = MockDeviceChannel::new(nao());
    let mock = channel.handle();
    mock.set_hal(Some("v2-8".into()), Some("stale".into()));
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(running.log.wait_for_state(State::WaitForCmd).await);
    assert_eq!(mock.hal_installs(), vec![(b"zip".to_vec(), "c0ffee".to_string())]);
    assert_eq!(server.hal_downloads(), 1);

    let calls = mock.calls();
    let install = calls.iter().position(|c| *c == MockCall::InstallHal).unwrap();
    let info = calls.iter().position(|c| *c == MockCall::DeviceInfo).unwrap();
    assert!(install < info);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_current_hal_left_alone() {
    let server = MockServer::start().await;
    server.set_hal("c0ffee", b"zip".to_vec());

    let channel = MockDeviceChannel::new(nao());
    let mock = channel.handle();
    mock.set_hal(Some("v2-8".into()), Some("c0ffee".into()));
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(running.log.wait_for_state(State::WaitForCmd).await);
    assert_eq!(mock.count(MockCall::InstalledHalChecksum), 1);
    assert!(mock.hal_installs().is_empty());
    assert_eq!(server.hal_downloads(), 0);

    assert!(running.close().await);
}

#[tokio::test]
async fn test_hal_unavailable_is_update_error() {
    let server = MockServer::start().await;

    let channel = MockDeviceChannel::new(nao());
    let mock = channel.handle();
    mock.set_hal(Some("v2-8".into()), None);
    let running = RunningConnector::start(channel, &server, fast_settings());
    running.handle.connect();

    assert!(
        running
            .log
            .wait_for_sequence(&[State::ErrorUpdate, State::Discover])
            .await
    );
    assert!(server.pushes().is_empty());
    assert!(running.handle.token().is_none());

    let m = mock.clone();
    assert!(
        wait_for(
            || {
                let m = m.clone();
                async move { m.count(MockCall::Probe) >= 2 }
            },
            TIMEOUT
        )
        .await
    );

    assert!(running.close().await);
}
