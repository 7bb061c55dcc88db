// ABOUTME: Hosted store backend - REST for rows, realtime websocket for notifications
// ABOUTME: Implements the RemoteStore contract against a Supabase project

pub mod protocol;
pub mod realtime;
pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use seafarm_store::{
    BroadcastMessage, PresenceEvent, Query, RemoteStore, Row, StoreNotice, StoreResult,
    SubscribeRequest, Subscription,
};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub use realtime::{RealtimeClient, RealtimeConfig};
pub use rest::RestClient;

/// Connection settings for one project.
#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub project_url: Url,
    pub anon_key: String,
    pub schema: String,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
}

pub struct SupabaseStore {
    rest: RestClient,
    realtime: RealtimeClient,
}

impl SupabaseStore {
    /// Builds the clients. No network traffic happens until the first call.
    pub fn new(settings: &SupabaseSettings) -> Result<Self> {
        let rest = RestClient::new(
            &settings.project_url,
            settings.anon_key.clone(),
            settings.schema.clone(),
            settings.request_timeout,
        )?;
        let socket_url = protocol::socket_url(&settings.project_url, &settings.anon_key)?;
        let realtime = RealtimeClient::new(RealtimeConfig {
            socket_url,
            access_token: settings.anon_key.clone(),
            schema: settings.schema.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            join_timeout: settings.join_timeout,
        });
        Ok(Self { rest, realtime })
    }

    pub async fn disconnect(&self) {
        self.realtime.disconnect().await;
    }
}

#[async_trait]
impl RemoteStore for SupabaseStore {
    async fn select(&self, table: &str, query: &Query) -> StoreResult<Vec<Row>> {
        self.rest.select(table, query).await
    }

    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        self.rest.insert(table, row).await
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<Row> {
        self.rest.update(table, id, patch).await
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        self.rest.delete(table, id).await
    }

    async fn subscribe(&self, request: SubscribeRequest) -> StoreResult<Subscription<StoreNotice>> {
        self.realtime.subscribe(request).await
    }

    async fn join_presence(
        &self,
        channel: &str,
        key: &str,
    ) -> StoreResult<Subscription<PresenceEvent>> {
        self.realtime.join_presence(channel, key).await
    }

    async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> StoreResult<()> {
        self.realtime.track_presence(channel, key, payload).await
    }

    async fn send_broadcast(&self, channel: &str, message: BroadcastMessage) -> StoreResult<()> {
        self.realtime.send_broadcast(channel, message).await
    }

    async fn subscribe_broadcast(
        &self,
        channel: &str,
    ) -> StoreResult<Subscription<BroadcastMessage>> {
        self.realtime.subscribe_broadcast(channel).await
    }
}
