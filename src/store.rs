use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use serde::Deserialize;

use crate::channels::{Channel, FillerShow, LineupItem, Program};

/// On-disk catalog shape: channels carry their lineups inline, programs and
/// filler shows are referenced by id.
#[derive(Debug, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub channels: Vec<CatalogChannel>,
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default)]
    pub filler_shows: Vec<FillerShow>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogChannel {
    #[serde(flatten)]
    pub channel: Channel,
    #[serde(default)]
    pub lineup: Vec<LineupItem>,
}

struct Inner {
    by_id: HashMap<Uuid, Channel>,
    by_number: HashMap<u32, Uuid>,
    lineups: HashMap<Uuid, Vec<LineupItem>>,
    programs: HashMap<Uuid, Program>,
    filler_shows: HashMap<Uuid, FillerShow>,
}

/// Read-only view of the catalog. The streaming core never writes through
/// this; it is shared across all in-flight requests.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    pub fn empty() -> Self {
        Store {
            inner: Arc::new(RwLock::new(Inner {
                by_id: HashMap::new(),
                by_number: HashMap::new(),
                lineups: HashMap::new(),
                programs: HashMap::new(),
                filler_shows: HashMap::new(),
            })),
        }
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        let mut by_id = HashMap::new();
        let mut by_number = HashMap::new();
        let mut lineups = HashMap::new();
        for entry in catalog.channels {
            by_number.insert(entry.channel.number, entry.channel.id);
            lineups.insert(entry.channel.id, entry.lineup);
            by_id.insert(entry.channel.id, entry.channel);
        }
        let programs = catalog.programs.into_iter().map(|p| (p.id, p)).collect();
        let filler_shows = catalog
            .filler_shows
            .into_iter()
            .map(|f| (f.id, f))
            .collect();
        Store {
            inner: Arc::new(RwLock::new(Inner {
                by_id,
                by_number,
                lineups,
                programs,
                filler_shows,
            })),
        }
    }

    pub async fn load_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let catalog: Catalog = serde_json::from_slice(&bytes)?;
        Ok(Store::from_catalog(catalog))
    }

    pub async fn channel_by_id(&self, id: Uuid) -> Option<Channel> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn channel_by_number(&self, number: u32) -> Option<Channel> {
        let inner = self.inner.read().await;
        let id = inner.by_number.get(&number)?;
        inner.by_id.get(id).cloned()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        let inner = self.inner.read().await;
        let mut out: Vec<Channel> = inner.by_id.values().cloned().collect();
        out.sort_by_key(|c| c.number);
        out
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn lineup(&self, channel_id: Uuid) -> Vec<LineupItem> {
        self.inner
            .read()
            .await
            .lineups
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn channel_and_lineup(&self, id: Uuid) -> Option<(Channel, Vec<LineupItem>)> {
        let inner = self.inner.read().await;
        let channel = inner.by_id.get(&id)?.clone();
        let lineup = inner.lineups.get(&id).cloned().unwrap_or_default();
        Some((channel, lineup))
    }

    pub async fn program(&self, id: Uuid) -> Option<Program> {
        self.inner.read().await.programs.get(&id).cloned()
    }

    pub async fn filler_show(&self, id: Uuid) -> Option<FillerShow> {
        self.inner.read().await.filler_shows.get(&id).cloned()
    }
}
