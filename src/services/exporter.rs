use crate::error::Result;
use crate::models::{Listen, PortableListen};
use crate::services::listen_store::ListenStore;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

/// A user's full listen history, ready to be sent as one attachment.
#[derive(Debug)]
pub struct ExportDocument {
    pub filename: String,
    pub listens: Vec<PortableListen>,
}

impl ExportDocument {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.listens)
            .map_err(|e| anyhow::anyhow!("Failed to serialize export: {}", e).into())
    }
}

pub fn export_filename(user_name: &str, date: NaiveDate) -> String {
    format!("{}_lb-{}.json", user_name, date.format("%Y-%m-%d"))
}

pub struct ListenExporter {
    store: Arc<dyn ListenStore>,
    fetch_count: i64,
}

impl ListenExporter {
    pub fn new(store: Arc<dyn ListenStore>, fetch_count: i64) -> Self {
        Self { store, fetch_count }
    }

    /// Walk the store newest-first in pages of `fetch_count`, each page
    /// starting strictly below the oldest timestamp of the previous one.
    ///
    /// Listens sharing the timestamp that ends a page are not all
    /// guaranteed to be returned: the ones past the page limit fall below
    /// the next cursor's strict bound. Histories with distinct timestamps
    /// are returned exactly once each.
    pub async fn fetch_all(&self, user_name: &str, to_ts: i64) -> Result<Vec<Listen>> {
        let mut to_ts = to_ts;
        let mut listens = Vec::new();

        loop {
            let batch = self
                .store
                .fetch_listens(user_name, to_ts, self.fetch_count)
                .await?;

            let Some(oldest) = batch.last() else {
                break;
            };
            to_ts = oldest.listened_at;

            tracing::debug!(
                "Fetched {} listens for {} (next cursor {})",
                batch.len(),
                user_name,
                to_ts
            );
            listens.extend(batch);
        }

        Ok(listens)
    }

    /// Build the whole export document in memory before anything is sent.
    pub async fn export(&self, user_name: &str, now: DateTime<Utc>) -> Result<ExportDocument> {
        let listens = self.fetch_all(user_name, now.timestamp()).await?;

        tracing::info!("Exporting {} listens for {}", listens.len(), user_name);

        Ok(ExportDocument {
            filename: export_filename(user_name, now.date_naive()),
            listens: listens.iter().map(PortableListen::from).collect(),
        })
    }
}
