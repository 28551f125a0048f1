// Known feeds: id, display name and the URL their GTFS archive is downloaded from

use crate::error::{AtlasError, Result};
use crate::store::{Document, DocumentStore, Query, TableRef, validate_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const REGISTRY_DATASET: &str = "shared";
pub const FEEDS_TABLE: &str = "feeds";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl Feed {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("id", &self.id), ("name", &self.name), ("url", &self.url)] {
            if value.trim().is_empty() {
                return Err(AtlasError::InvalidFeed(format!("{} must not be empty", field)));
            }
        }
        validate_name(&self.id)?;
        // the registry's own dataset
        if self.id == REGISTRY_DATASET {
            return Err(AtlasError::InvalidFeed(format!(
                "'{}' is reserved and cannot be used as a feed id",
                REGISTRY_DATASET
            )));
        }
        validate_url(&self.url)
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(AtlasError::Storage("Feed did not serialize to an object".to_string())),
        }
    }

    fn from_document(doc: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(AtlasError::InvalidFeed(format!(
            "url must be http(s), got '{}'",
            url
        )))
    }
}

pub struct FeedRegistry {
    store: Arc<dyn DocumentStore>,
    table: TableRef,
}

impl FeedRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Result<Self> {
        Ok(FeedRegistry {
            store,
            table: TableRef::new(REGISTRY_DATASET, FEEDS_TABLE)?,
        })
    }

    pub async fn list(&self) -> Result<Vec<Feed>> {
        self.store
            .find(&self.table, &Query::all().sort_by("id"))
            .await?
            .into_iter()
            .map(Feed::from_document)
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<Feed> {
        self.store
            .find_one(&self.table, &Query::all().eq("id", id))
            .await?
            .map(Feed::from_document)
            .transpose()?
            .ok_or_else(|| AtlasError::FeedNotFound(id.to_string()))
    }

    pub async fn insert(&self, feed: Feed) -> Result<Feed> {
        feed.validate()?;
        let inserted = self
            .store
            .insert_if_absent(
                &self.table,
                &Query::all().eq("id", feed.id.as_str()),
                feed.to_document()?,
            )
            .await?;
        if !inserted {
            return Err(AtlasError::FeedExists(feed.id));
        }
        info!(feed = %feed.id, url = %feed.url, "feed registered");
        Ok(feed)
    }

    pub async fn update_url(&self, id: &str, url: &str) -> Result<Feed> {
        validate_url(url)?;
        let mut feed = self.get(id).await?;
        feed.url = url.to_string();

        let mut fields = Document::new();
        fields.insert("url".to_string(), Value::from(url));
        self.store
            .update_one(&self.table, &Query::all().eq("id", id), fields, false)
            .await?;
        info!(feed = %id, url, "feed url updated");
        Ok(feed)
    }
}
