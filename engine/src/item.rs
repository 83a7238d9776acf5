//! Content items and typed partial updates.

use crate::{ItemId, Timestamp};
use serde::{Deserialize, Serialize};

/// A synchronized content item.
///
/// `updated_at` and `last_viewed_at` are volatile: they change without the
/// content changing and never take part in fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    /// Unique identifier
    pub id: ItemId,
    /// Display title
    pub title: String,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Structured body (JSON)
    #[serde(default)]
    pub content: serde_json::Value,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the item is visible to learners
    #[serde(default)]
    pub published: bool,
    /// Ordering within its parent
    #[serde(default)]
    pub position: i64,
    /// Last server-side modification (milliseconds since epoch)
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Last time the item was opened locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<Timestamp>,
}

impl ContentItem {
    /// Create an item with a title and empty content.
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            content: serde_json::Value::Null,
            tags: Vec::new(),
            published: false,
            position: 0,
            updated_at: 0,
            last_viewed_at: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the structured body.
    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the position.
    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }
}

/// A partial update to a [`ContentItem`].
///
/// Only the synchronizable fields can be patched; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl ItemPatch {
    /// An empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn content(mut self, content: serde_json::Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    pub fn position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    /// A patch that replaces every synchronizable field with the item's values.
    pub fn from_item(item: &ContentItem) -> Self {
        Self {
            title: Some(item.title.clone()),
            description: Some(item.description.clone()),
            content: Some(item.content.clone()),
            tags: Some(item.tags.clone()),
            published: Some(item.published),
            position: Some(item.position),
        }
    }

    /// Check if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.content.is_none()
            && self.tags.is_none()
            && self.published.is_none()
            && self.position.is_none()
    }

    /// Fold a later patch into this one. Fields set in `later` win.
    pub fn merge(&mut self, later: ItemPatch) {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.tags.is_some() {
            self.tags = later.tags;
        }
        if later.published.is_some() {
            self.published = later.published;
        }
        if later.position.is_some() {
            self.position = later.position;
        }
    }

    /// Apply the patch to an item in place.
    pub fn apply_to(&self, item: &mut ContentItem) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(description) = &self.description {
            item.description = description.clone();
        }
        if let Some(content) = &self.content {
            item.content = content.clone();
        }
        if let Some(tags) = &self.tags {
            item.tags = tags.clone();
        }
        if let Some(published) = self.published {
            item.published = published;
        }
        if let Some(position) = self.position {
            item.position = position;
        }
    }

    /// Return a patched copy of the item.
    pub fn applied(&self, item: &ContentItem) -> ContentItem {
        let mut item = item.clone();
        self.apply_to(&mut item);
        item
    }

    /// Names of the fields this patch touches.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.content.is_some() {
            fields.push("content");
        }
        if self.tags.is_some() {
            fields.push("tags");
        }
        if self.published.is_some() {
            fields.push("published");
        }
        if self.position.is_some() {
            fields.push("position");
        }
        fields
    }
}
