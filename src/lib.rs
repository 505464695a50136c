pub mod commands;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod settings;
pub mod utils;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::services::{
    AuthClient, BackupService, ControllerOptions, DiscordWebhook, EventBus, FirewallService,
    HttpAuthClient, HttpUpdateFetcher, JsonProfileStore, NotificationService, ProfileService,
    ProfileStore, ServerController, ToolService, UpdateFetcher,
};
use crate::settings::ManagerSettings;

/// Everything the command layer needs, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub settings: ManagerSettings,
    pub http: reqwest::Client,
    pub events: EventBus,
    pub profiles: ProfileService,
    pub controller: ServerController,
    pub backups: BackupService,
    pub tools: ToolService,
    pub firewall: FirewallService,
}

impl AppState {
    pub fn initialize(settings: ManagerSettings) -> Self {
        let http = settings.http_client();
        let store: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::new(settings.profiles_path()));
        let auth: Arc<dyn AuthClient> =
            Arc::new(HttpAuthClient::new(http.clone(), settings.file.auth.clone()));
        let updates: Arc<dyn UpdateFetcher> = Arc::new(HttpUpdateFetcher::new(http.clone()));
        Self::from_parts(settings, http, store, auth, updates)
    }

    pub fn from_parts(
        settings: ManagerSettings,
        http: reqwest::Client,
        store: Arc<dyn ProfileStore>,
        auth: Arc<dyn AuthClient>,
        updates: Arc<dyn UpdateFetcher>,
    ) -> Self {
        let events = EventBus::new();
        let profiles = ProfileService::new(store);
        let controller = ServerController::new(
            profiles.clone(),
            events.clone(),
            auth,
            updates,
            ControllerOptions::from_settings(&settings),
        );
        let backups = BackupService::new(settings.backups_dir());
        let tools = ToolService::new(&settings, http.clone(), events.clone(), profiles.clone());

        Self {
            settings,
            http,
            events,
            profiles,
            controller,
            backups,
            tools,
            firewall: FirewallService,
        }
    }

    /// Starts announcing state changes on profile webhooks.
    pub fn spawn_notifications(&self) -> JoinHandle<()> {
        NotificationService::new(
            self.profiles.clone(),
            Arc::new(DiscordWebhook::new(self.http.clone())),
        )
        .spawn(&self.events)
    }
}
