pub mod auth_service;
pub mod backup_service;
pub mod event_bus;
pub mod firewall_service;
pub mod log_classifier;
pub mod notification_service;
pub mod profile_store;
pub mod server_controller;
pub mod session_registry;
pub mod tool_service;
pub mod update_service;

pub use auth_service::{AuthClient, HttpAuthClient, RefreshedSession};
pub use backup_service::{BackupEntry, BackupReport, BackupService};
pub use event_bus::EventBus;
pub use firewall_service::{FirewallResult, FirewallService};
pub use log_classifier::{DeviceAuthClassifier, LineClassifier};
pub use notification_service::{DiscordWebhook, NotificationService, NotificationSink};
pub use profile_store::{JsonProfileStore, MemoryProfileStore, ProfileService, ProfileStore};
pub use server_controller::{
    ControllerOptions, ServerController, ShutdownReport, StartOutcome,
};
pub use session_registry::{Claim, ExitReport, ServerSession, SessionRegistry};
pub use tool_service::{InstallResult, JavaStatus, ToolService};
pub use update_service::{HttpUpdateFetcher, UpdateFetcher, UpdateOutcome};
