//! Command dispatch scenarios

mod common;

use std::time::Duration;

use serde_json::json;

use slidebolt::GatewayError;
use slidebolt::command::COMMAND_RESULT_EVENT;
use slidebolt::slidebolt_types::{CommandState, DEFAULT_COMMAND_TYPE, EntityPatch, JournalFilter};

use common::{eventually, register, spawn_responder, started_gateway};

const PLUGIN: &str = "plugin-test-clean";

async fn seed_entity(gateway: &slidebolt::Gateway) {
    register(gateway, PLUGIN);
    gateway
        .store()
        .upsert_entity(PLUGIN, "dev-cmd", EntityPatch::new("ent-cmd").with_domain("switch"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dispatch_reaches_succeeded() {
    let (gateway, _dir) = started_gateway().await;
    seed_entity(&gateway).await;
    let _responder = spawn_responder(&gateway, PLUGIN);

    let status = gateway
        .router()
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!({"type": "turn_on"}))
        .await
        .unwrap();
    assert_eq!(status.state, CommandState::Pending);
    assert_eq!(status.command_type, "turn_on");

    let router = gateway.router().clone();
    let id = status.command_id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let router = router.clone();
            async move {
                router
                    .get_status(id)
                    .is_ok_and(|s| s.state == CommandState::Succeeded)
            }
        })
        .await
    );

    let settled = gateway.router().get_status(id).unwrap();
    assert!(settled.completed_at.is_some());
    assert!(settled.error.is_none());

    // The result lands in the entity's journal
    let events = gateway
        .journal()
        .query(&JournalFilter::for_entity(PLUGIN, "dev-cmd", "ent-cmd"), None)
        .await
        .unwrap();
    let result = events
        .iter()
        .find(|e| e.name == COMMAND_RESULT_EVENT)
        .expect("command result event");
    assert_eq!(result.payload["command_id"], json!(id));
    assert_eq!(result.payload["state"], json!("succeeded"));
}

#[tokio::test]
async fn test_silent_plugin_times_out() {
    let (gateway, _dir) = started_gateway().await;
    seed_entity(&gateway).await;
    // Connected but never answers
    let _inbox = gateway.bus().connect(PLUGIN, 8);

    let status = gateway
        .router()
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!({"type": "turn_off"}))
        .await
        .unwrap();

    let router = gateway.router().clone();
    let id = status.command_id;
    assert!(
        eventually(Duration::from_secs(3), || {
            let router = router.clone();
            async move {
                router
                    .get_status(id)
                    .is_ok_and(|s| s.state == CommandState::Failed)
            }
        })
        .await
    );
    let failed = gateway.router().get_status(id).unwrap();
    assert!(failed.error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_dispatch_rejections() {
    let (gateway, _dir) = started_gateway().await;
    seed_entity(&gateway).await;
    let router = gateway.router();

    let err = router
        .dispatch("plugin-nobody", "dev-cmd", "ent-cmd", json!({"type": "turn_on"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownPlugin(_)));

    let err = router
        .dispatch(PLUGIN, "dev-cmd", "ent-missing", json!({"type": "turn_on"}))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);

    let err = router
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!(["turn_on"]))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = router
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!({"type": ""}))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    assert!(router.is_empty());
}

#[tokio::test]
async fn test_typeless_object_is_a_command() {
    let (gateway, _dir) = started_gateway().await;
    seed_entity(&gateway).await;
    let responder = spawn_responder(&gateway, PLUGIN);

    // Configuration posts carry no "type"
    let status = gateway
        .router()
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!({"frigate_url": "http://nvr:5000"}))
        .await
        .unwrap();
    assert_eq!(status.state, CommandState::Pending);
    assert_eq!(status.command_type, DEFAULT_COMMAND_TYPE);

    let router = gateway.router().clone();
    let id = status.command_id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let router = router.clone();
            async move {
                router
                    .get_status(id)
                    .is_ok_and(|s| s.state == CommandState::Succeeded)
            }
        })
        .await
    );

    responder.abort();
}

#[tokio::test]
async fn test_undeliverable_command_fails() {
    let (gateway, _dir) = started_gateway().await;
    seed_entity(&gateway).await;

    // Registered and healthy, but no channel
    let status = gateway
        .router()
        .dispatch(PLUGIN, "dev-cmd", "ent-cmd", json!({"type": "toggle"}))
        .await
        .unwrap();

    let router = gateway.router().clone();
    let id = status.command_id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let router = router.clone();
            async move {
                router
                    .get_status(id)
                    .is_ok_and(|s| s.state == CommandState::Failed)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_command_to_automation_entity_without_script() {
    let (gateway, _dir) = started_gateway().await;
    let host = gateway.bridge().host_plugin().to_string();
    gateway
        .store()
        .upsert_entity(&host, "dev-auto", EntityPatch::new("ent-auto").with_domain("automation"))
        .await
        .unwrap();

    let status = gateway
        .router()
        .dispatch(&host, "dev-auto", "ent-auto", json!({"type": "run"}))
        .await
        .unwrap();

    let router = gateway.router().clone();
    let id = status.command_id;
    assert!(
        eventually(Duration::from_secs(2), || {
            let router = router.clone();
            async move {
                router
                    .get_status(id)
                    .is_ok_and(|s| s.state == CommandState::Succeeded)
            }
        })
        .await
    );
}
