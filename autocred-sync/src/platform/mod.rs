//! External messaging platform integration
//!
//! [`PlatformClient`] is the production HTTP client; the [`PlatformApi`]
//! trait is the seam the reconciliation engine and backlog processor depend
//! on, so tests substitute an in-memory double.

pub mod client;
pub mod rate_limit;
pub mod types;

pub use client::{PlatformClient, PlatformError};
pub use rate_limit::RateLimiter;
pub use types::{detect_channel, Channel, LookupIdentifiers, Subscriber, Tag};

use std::future::Future;

/// The platform surface the sync engine needs
pub trait PlatformApi: Send + Sync {
    fn find_subscriber(
        &self,
        ids: &LookupIdentifiers,
    ) -> impl Future<Output = Result<Option<Subscriber>, PlatformError>> + Send;

    fn add_tag(
        &self,
        subscriber_id: &str,
        tag_name: &str,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn remove_tag(
        &self,
        subscriber_id: &str,
        tag_name: &str,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn set_custom_field(
        &self,
        subscriber_id: &str,
        field_name: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;
}

impl PlatformApi for PlatformClient {
    async fn find_subscriber(
        &self,
        ids: &LookupIdentifiers,
    ) -> Result<Option<Subscriber>, PlatformError> {
        PlatformClient::find_subscriber(self, ids).await
    }

    async fn add_tag(&self, subscriber_id: &str, tag_name: &str) -> Result<(), PlatformError> {
        PlatformClient::add_tag(self, subscriber_id, tag_name).await
    }

    async fn remove_tag(&self, subscriber_id: &str, tag_name: &str) -> Result<(), PlatformError> {
        PlatformClient::remove_tag(self, subscriber_id, tag_name).await
    }

    async fn set_custom_field(
        &self,
        subscriber_id: &str,
        field_name: &str,
        value: &str,
    ) -> Result<(), PlatformError> {
        PlatformClient::set_custom_field(self, subscriber_id, field_name, value).await
    }
}
