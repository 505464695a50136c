use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::errors::{ManagerError, Result};
use crate::models::{ServerEvent, ServerProfile};
use crate::services::event_bus::EventBus;
use crate::services::profile_store::ProfileService;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, webhook: &str, message: &str) -> Result<()>;
}

/// Posts `{"content": ...}` to a Discord webhook URL.
#[derive(Clone)]
pub struct DiscordWebhook {
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhook {
    async fn notify(&self, webhook: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(webhook)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ManagerError::Http(format!(
                "webhook responded with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn state_message(profile: &ServerProfile, is_running: bool) -> String {
    let name = if profile.name.trim().is_empty() {
        profile.id.as_str()
    } else {
        profile.name.as_str()
    };
    if is_running {
        format!("🟢 Server **{name}** is now online.")
    } else {
        format!("🔴 Server **{name}** is now offline.")
    }
}

/// Bus subscriber that announces state changes on each profile's webhook.
#[derive(Clone)]
pub struct NotificationService {
    profiles: ProfileService,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationService {
    pub fn new(profiles: ProfileService, sink: Arc<dyn NotificationSink>) -> Self {
        Self { profiles, sink }
    }

    pub fn spawn(self, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(&event).await;
            }
        })
    }

    pub async fn handle(&self, event: &ServerEvent) {
        let ServerEvent::ServerStateChange(payload) = event else {
            return;
        };
        let profile = match self.profiles.get(&payload.profile_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("notification lookup for {} failed: {}", payload.profile_id, err);
                return;
            }
        };
        let Some(webhook) = profile.discord_webhook() else {
            return;
        };
        let message = state_message(&profile, payload.is_running);
        if let Err(err) = self.sink.notify(webhook, &message).await {
            tracing::warn!("webhook for {} failed: {}", profile.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::services::profile_store::MemoryProfileStore;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, webhook: &str, message: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((webhook.to_string(), message.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn only_profiles_with_a_webhook_are_announced() {
        let with_hook = ServerProfile {
            id: "srv-1".to_string(),
            name: "Main".to_string(),
            discord_webhook: Some("https://discord.example/hook".to_string()),
            ..Default::default()
        };
        let without_hook = ServerProfile {
            id: "srv-2".to_string(),
            discord_webhook: Some(" ".to_string()),
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let service = NotificationService::new(
            ProfileService::new(Arc::new(MemoryProfileStore::new(vec![with_hook, without_hook]))),
            sink.clone(),
        );

        service.handle(&ServerEvent::state("srv-1", true)).await;
        service.handle(&ServerEvent::state("srv-2", true)).await;
        service
            .handle(&ServerEvent::log("srv-1", crate::models::ConsoleLevel::Info, "x"))
            .await;

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://discord.example/hook");
        assert!(sent[0].1.contains("**Main** is now online"));
    }

    #[tokio::test]
    async fn closing_the_bus_delivers_the_final_offline_message() {
        let profile = ServerProfile {
            id: "srv-1".to_string(),
            name: "Main".to_string(),
            discord_webhook: Some("https://discord.example/hook".to_string()),
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let events = EventBus::new();
        let task = NotificationService::new(
            ProfileService::new(Arc::new(MemoryProfileStore::new(vec![profile]))),
            sink.clone(),
        )
        .spawn(&events);

        events.state("srv-1", false);
        events.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("notifier finishes once the bus closes")
            .expect("notifier task");

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("offline"));
    }
}
