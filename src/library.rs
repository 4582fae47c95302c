//! Favorites and the personal stone collection.

use crate::{
    config::storage_keys,
    error::StorageError,
    models::{ShelfEntry, Stone, StoneDraft},
    store::{get_json, now, set_json, KeyValueStore, Lookup},
};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_CLEANSING_METHODS: [&str; 4] = [
    "Moonlight (safe for most stones)",
    "Smudging (sage)",
    "Sound cleansing (singing bowl)",
    "Other crystals (selenite, clear quartz)",
];

/// Ordered list of stones persisted under one storage key.
pub struct StoneShelf {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
    write_guard: Mutex<()>,
}

impl StoneShelf {
    pub fn favorites(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, storage_keys::FAVORITES)
    }

    pub fn collection(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, storage_keys::COLLECTION)
    }

    fn with_key(store: Arc<dyn KeyValueStore>, key: &'static str) -> Self {
        Self {
            store,
            key,
            write_guard: Mutex::new(()),
        }
    }

    /// Stored entries, oldest first. Unreadable lists read as empty.
    pub async fn list(&self) -> Vec<ShelfEntry> {
        match get_json::<Vec<ShelfEntry>>(self.store.as_ref(), self.key).await {
            Lookup::Found(entries) => entries,
            Lookup::Absent => Vec::new(),
            Lookup::Corrupt(reason) | Lookup::Unreadable(reason) => {
                log::warn!("[library] Ignoring {}: {}", self.key, reason);
                Vec::new()
            }
        }
    }

    pub async fn contains(&self, stone_id: &str) -> bool {
        self.list()
            .await
            .iter()
            .any(|entry| entry.stone.id == stone_id)
    }

    pub async fn count(&self) -> usize {
        self.list().await.len()
    }

    /// Appends `stone` unless an entry with the same id exists.
    pub async fn add(&self, stone: Stone) -> Result<bool, StorageError> {
        self.insert(stone, false).await
    }

    pub async fn add_custom(&self, draft: StoneDraft) -> Result<Stone, StorageError> {
        let stone = create_custom_stone(draft);
        self.insert(stone.clone(), true).await?;
        Ok(stone)
    }

    /// Returns whether an entry was removed.
    pub async fn remove(&self, stone_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_guard.lock().await;
        let mut entries = self.list().await;
        let before = entries.len();
        entries.retain(|entry| entry.stone.id != stone_id);
        if entries.len() == before {
            return Ok(false);
        }
        set_json(self.store.as_ref(), self.key, &entries).await?;
        Ok(true)
    }

    async fn insert(&self, stone: Stone, is_custom: bool) -> Result<bool, StorageError> {
        let _guard = self.write_guard.lock().await;
        let mut entries = self.list().await;
        if entries.iter().any(|entry| entry.stone.id == stone.id) {
            return Ok(false);
        }
        log::info!("[library] Adding {} to {}", stone.id, self.key);
        entries.push(ShelfEntry {
            stone,
            date_added: now(),
            is_custom,
        });
        set_json(self.store.as_ref(), self.key, &entries).await?;
        Ok(true)
    }
}

/// Builds a user-defined stone, filling unset fields with placeholders.
pub fn create_custom_stone(draft: StoneDraft) -> Stone {
    let or_unknown = |value: Option<Vec<String>>| {
        value
            .filter(|items| !items.is_empty())
            .unwrap_or_else(|| vec!["Unknown".to_string()])
    };
    Stone {
        id: format!("custom_{}", Uuid::new_v4().simple()),
        name: draft
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown Stone".to_string()),
        scientific_name: draft
            .scientific_name
            .unwrap_or_else(|| "Unknown".to_string()),
        category: draft.category.unwrap_or_else(|| "Other".to_string()),
        color: or_unknown(draft.color),
        hardness: draft.hardness.filter(|value| *value > 0.0).unwrap_or(5.0),
        origin: or_unknown(draft.origin),
        properties: draft
            .properties
            .unwrap_or_else(|| vec!["Custom Stone".to_string()]),
        healing_properties: draft
            .healing_properties
            .unwrap_or_else(|| vec!["Added by user".to_string()]),
        uses: draft
            .uses
            .unwrap_or_else(|| vec!["Personal Collection".to_string()]),
        image_url: draft.image_url,
        description: draft
            .description
            .unwrap_or_else(|| "This stone was added to the collection by the user.".to_string()),
        cleansing_methods: Some(draft.cleansing_methods.unwrap_or_else(|| {
            DEFAULT_CLEANSING_METHODS
                .iter()
                .map(|method| method.to_string())
                .collect()
        })),
    }
}
