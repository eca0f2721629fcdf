use crate::config::AppConfig;
use crate::notify::NotificationQueue;
use crate::payments::gateway::GatewayRegistry;
use crate::payments::webhook::WebhookQueue;
use crate::shared::utils::DbPool;
use std::sync::Arc;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub gateways: Arc<GatewayRegistry>,
    pub webhooks: WebhookQueue,
    pub notifications: NotificationQueue,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            gateways: Arc::clone(&self.gateways),
            webhooks: self.webhooks.clone(),
            notifications: self.notifications.clone(),
        }
    }
}
