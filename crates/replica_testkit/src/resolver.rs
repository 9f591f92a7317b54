//! A label resolver backed by lookup tables.

use replica_core::LabelResolver;
use std::collections::HashMap;

/// Resolves object types and file labels from exact app metadata strings.
///
/// ```rust
/// use replica_core::LabelResolver;
/// use replica_testkit::MapLabelResolver;
///
/// let resolver = MapLabelResolver::new()
///     .with_object_type("kind=foo", "Foo")
///     .with_file_label("Foo", "kind=foo", "file1");
/// assert_eq!(resolver.object_type("kind=foo").as_deref(), Some("Foo"));
/// assert_eq!(resolver.file_label("Foo", "kind=foo").as_deref(), Some("file1"));
/// assert!(resolver.file_label("Bar", "kind=foo").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapLabelResolver {
    object_types: HashMap<String, String>,
    file_labels: HashMap<(String, String), String>,
}

impl MapLabelResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps metadata to an object type.
    #[must_use]
    pub fn with_object_type(mut self, app_meta_data: impl Into<String>, object_type: impl Into<String>) -> Self {
        self.object_types.insert(app_meta_data.into(), object_type.into());
        self
    }

    /// Maps metadata under an object type to a file label.
    #[must_use]
    pub fn with_file_label(
        mut self,
        object_type: impl Into<String>,
        app_meta_data: impl Into<String>,
        file_label: impl Into<String>,
    ) -> Self {
        self.file_labels
            .insert((object_type.into(), app_meta_data.into()), file_label.into());
        self
    }
}

impl LabelResolver for MapLabelResolver {
    fn object_type(&self, app_meta_data: &str) -> Option<String> {
        self.object_types.get(app_meta_data).cloned()
    }

    fn file_label(&self, object_type: &str, app_meta_data: &str) -> Option<String> {
        self.file_labels
            .get(&(object_type.to_string(), app_meta_data.to_string()))
            .cloned()
    }
}
