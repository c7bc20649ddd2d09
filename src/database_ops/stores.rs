//! Storefront clients (Nintendo eShop, PlayStation Store, Xbox Store).
//!
//! These storefronts have no stable public API we can call, so the clients
//! only occupy their registry slots: they report disabled unless a base URL is
//! configured and always return no records.

use async_trait::async_trait;
use tracing::debug;

use crate::config::ProviderSettings;
use crate::database_ops::provider_client::{FetchRequest, NormalizedRecord, ProviderClient};
use crate::error::ProviderError;

pub const STORE_KEYS: [&str; 3] = ["eshop", "psstore", "xbox"];

pub struct StoreStubClient {
    key: String,
    settings: ProviderSettings,
}

impl StoreStubClient {
    pub fn new(key: &str, settings: ProviderSettings) -> Self {
        Self {
            key: key.to_string(),
            settings,
        }
    }
}

#[async_trait]
impl ProviderClient for StoreStubClient {
    fn key(&self) -> &str {
        &self.key
    }

    fn enabled(&self) -> bool {
        self.settings.is_configured()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<NormalizedRecord>, ProviderError> {
        debug!(provider = %self.key, kind = ?request.kind, "storefront stub: no records");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::provider_client::FetchKind;

    #[tokio::test]
    async fn stubs_are_inert() {
        let client = StoreStubClient::new("eshop", ProviderSettings::defaults_for("eshop"));
        assert!(!client.enabled());
        let out = client.fetch(&FetchRequest::new(FetchKind::Prices)).await.unwrap();
        assert!(out.is_empty());
    }
}
