//! Item catalog client
//!
//! The catalog is an external collaborator that knows who owns an item and
//! how it values. Both answers are advisory: negotiation never waits on
//! them succeeding.

use crate::db::{ItemRef, ParticipantId};
use crate::engine::{ItemRegistry, ValuationService};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned status {0}")]
    Status(u16),
}

/// Item record as served by the catalog
#[derive(Debug, Clone, Deserialize)]
struct CatalogItem {
    owner_id: Option<String>,
    comparability_score: Option<f64>,
}

/// Catalog reached over HTTP at `{base_url}/items/{item}`
pub struct HttpCatalog {
    client: Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CatalogError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, item: &ItemRef) -> Result<Option<CatalogItem>, CatalogError> {
        let url = format!("{}/items/{}", self.base_url, item);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(CatalogError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl ItemRegistry for HttpCatalog {
    async fn owner_of(&self, item: &ItemRef) -> Result<Option<ParticipantId>, CatalogError> {
        let owner = self.fetch(item).await?.and_then(|found| found.owner_id);
        // An owner id we could not accept as a participant is treated as unknown
        Ok(owner.and_then(|id| match ParticipantId::parse(id) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(item = %item, error = %e, "Catalog returned unusable owner id");
                None
            }
        }))
    }
}

#[async_trait]
impl ValuationService for HttpCatalog {
    async fn comparability_score(&self, item: &ItemRef) -> Result<Option<f64>, CatalogError> {
        Ok(self
            .fetch(item)
            .await?
            .and_then(|found| found.comparability_score))
    }
}

/// Stand-in when no catalog is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCatalog;

#[async_trait]
impl ItemRegistry for NoCatalog {
    async fn owner_of(&self, _item: &ItemRef) -> Result<Option<ParticipantId>, CatalogError> {
        Ok(None)
    }
}

#[async_trait]
impl ValuationService for NoCatalog {
    async fn comparability_score(&self, _item: &ItemRef) -> Result<Option<f64>, CatalogError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve_catalog() -> String {
        let app = Router::new().route(
            "/items/:item",
            get(|Path(item): Path<String>| async move {
                match item.as_str() {
                    "bike" => Ok(Json(json!({"owner_id": "alice", "comparability_score": 42.5}))),
                    "broken" => Err(AxumStatus::INTERNAL_SERVER_ERROR),
                    _ => Err(AxumStatus::NOT_FOUND),
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_catalog_reads_owner_and_score() {
        let base = serve_catalog().await;
        let catalog = HttpCatalog::new(base, Duration::from_secs(5)).unwrap();
        let bike = ItemRef::parse("bike").unwrap();

        assert_eq!(
            catalog.owner_of(&bike).await.unwrap(),
            Some(ParticipantId::parse("alice").unwrap())
        );
        assert_eq!(catalog.comparability_score(&bike).await.unwrap(), Some(42.5));
    }

    #[tokio::test]
    async fn http_catalog_maps_missing_and_failures() {
        let base = serve_catalog().await;
        let catalog = HttpCatalog::new(base, Duration::from_secs(5)).unwrap();

        let missing = ItemRef::parse("unicycle").unwrap();
        assert_eq!(catalog.owner_of(&missing).await.unwrap(), None);

        let broken = ItemRef::parse("broken").unwrap();
        assert!(matches!(
            catalog.owner_of(&broken).await,
            Err(CatalogError::Status(500))
        ));
    }

    #[tokio::test]
    async fn no_catalog_knows_nothing() {
        let item = ItemRef::parse("bike").unwrap();
        assert_eq!(NoCatalog.owner_of(&item).await.unwrap(), None);
        assert_eq!(NoCatalog.comparability_score(&item).await.unwrap(), None);
    }
}
