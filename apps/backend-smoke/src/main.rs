mod logging;

use std::{env, process::ExitCode, sync::Arc, time::Duration};

use backend_core::{
    CredentialBundle, LoadOptions, RoomMembership, RoomSummary, SubscribeOptions, SyncEvent,
};
use backend_platform::SecretStore;
use backend_sync::{
    MatrixHttpTransport, SyncClient, SyncConfig, Transport,
    transport::mock::{MockTransport, reaction_event, text_event},
};
use tracing::{error, info, warn};

const OFFLINE_USER: &str = "@smoke:localhost";
const OFFLINE_ROOM: &str = "!smoke:localhost";
const FIRST_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let (client, rooms) = match env_value("PIKACHAT_HOMESERVER") {
        Some(homeserver) => match live_client(&homeserver, config) {
            Ok(setup) => setup,
            Err(message) => {
                error!(%homeserver, "{message}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            info!("PIKACHAT_HOMESERVER not set; running against the offline mock");
            offline_client(config)
        }
    };

    if rooms.is_empty() {
        warn!("no rooms to sync; set PIKACHAT_ROOMS to a comma-separated list");
        return ExitCode::SUCCESS;
    }

    let mut events = client.events();
    for room_id in &rooms {
        let messages = client.load_messages(room_id, LoadOptions::default()).await;
        info!(room_id = %room_id, count = messages.len(), "initial load");
        if let Some(last) = messages.last() {
            info!(
                room_id = %room_id,
                sender = %last.sender_id,
                body = %last.body,
                "latest message"
            );
        }
        client.subscribe(room_id, SubscribeOptions { prioritize: false });
    }

    let outcome = tokio::time::timeout(FIRST_CYCLE_TIMEOUT, async {
        loop {
            match events.recv().await {
                // The status carrying a lag hint is published after a cycle.
                Ok(SyncEvent::SyncStatus(status)) if status.lag_hint_ms.is_some() => {
                    return status.running;
                }
                Ok(SyncEvent::SyncStatus(status)) if !status.running => return false,
                Ok(SyncEvent::TimelineUpdated { room_id, messages }) => {
                    info!(room_id = %room_id, count = messages.len(), "timeline updated");
                }
                Ok(SyncEvent::SyncError { room_id, error }) => {
                    warn!(
                        room_id = ?room_id,
                        code = %error.code,
                        message = %error.message,
                        "sync error"
                    );
                }
                Ok(SyncEvent::CredentialExpired { error_code, .. }) => {
                    error!(code = %error_code, "credentials expired; re-authenticate");
                    return false;
                }
                Ok(SyncEvent::RoomInvite { room_id, inviter }) => {
                    info!(room_id = %room_id, inviter = ?inviter, "invited");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "event stream interrupted");
                    return false;
                }
            }
        }
    })
    .await;

    client.shutdown();
    match outcome {
        Ok(true) => {
            info!("first sync cycle completed");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(_) => {
            error!(timeout_s = FIRST_CYCLE_TIMEOUT.as_secs(), "no sync cycle completed");
            ExitCode::FAILURE
        }
    }
}

fn live_client(homeserver: &str, config: SyncConfig) -> Result<(SyncClient, Vec<String>), String> {
    let user_id = env_value("PIKACHAT_USER");
    let mut transport = MatrixHttpTransport::new(homeserver).map_err(|err| err.to_string())?;
    if let Some(user_id) = &user_id {
        transport = transport.with_user_id(user_id.clone());
    }
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let mut builder = SyncClient::builder(transport)
        .config(config)
        .secret_store(secret_store(), homeserver);
    if let Some(user_id) = &user_id {
        builder = builder
            .sqlite_cache(homeserver, user_id)
            .map_err(|err| err.to_string())?;
    }
    let client = builder.build();

    match env_value("PIKACHAT_ACCESS_TOKEN") {
        Some(access_token) => client.set_credentials(CredentialBundle {
            access_token,
            refresh_token: env_value("PIKACHAT_REFRESH_TOKEN"),
            user_id: user_id.unwrap_or_default(),
            device_id: env_value("PIKACHAT_DEVICE_ID").unwrap_or_default(),
            expires_at_ms: None,
        }),
        None => {
            let restored = client.restore_credentials().map_err(|err| err.to_string())?;
            if !restored {
                return Err("no PIKACHAT_ACCESS_TOKEN and no stored credentials".to_owned());
            }
        }
    }

    Ok((client, rooms_from_env()))
}

fn offline_client(config: SyncConfig) -> (SyncClient, Vec<String>) {
    let history = vec![
        text_event("$welcome", "@bot:localhost", 1_000, "Welcome to the smoke room"),
        text_event("$reply", OFFLINE_USER, 2_000, "Hello from the smoke test"),
        reaction_event("$ack", "@bot:localhost", 2_500, "$reply", "👍"),
    ];
    let summary = RoomSummary {
        name: Some("Smoke".to_owned()),
        ..RoomSummary::new(OFFLINE_ROOM, RoomMembership::Joined)
    };
    let transport = Arc::new(MockTransport::new(OFFLINE_USER).with_room(summary, history));
    transport.push_live_events(
        OFFLINE_ROOM,
        vec![text_event("$live", "@bot:localhost", 3_000, "Live event delivered")],
    );

    let client = SyncClient::builder(transport).config(config).build();
    client.set_credentials(CredentialBundle {
        access_token: "offline".to_owned(),
        refresh_token: None,
        user_id: OFFLINE_USER.to_owned(),
        device_id: "SMOKE".to_owned(),
        expires_at_ms: None,
    });
    (client, vec![OFFLINE_ROOM.to_owned()])
}

#[cfg(feature = "os-keyring")]
fn secret_store() -> Arc<dyn SecretStore> {
    Arc::new(backend_platform::OsKeyringSecretStore)
}

#[cfg(not(feature = "os-keyring"))]
fn secret_store() -> Arc<dyn SecretStore> {
    Arc::new(backend_platform::InMemorySecretStore::default())
}

fn rooms_from_env() -> Vec<String> {
    env_value("PIKACHAT_ROOMS")
        .map(|value| parse_rooms(&value))
        .unwrap_or_default()
}

fn parse_rooms(value: &str) -> Vec<String> {
    let mut rooms: Vec<String> = Vec::new();
    for room in value.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        if !rooms.iter().any(|r| r == room) {
            rooms.push(room.to_owned());
        }
    }
    rooms
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
