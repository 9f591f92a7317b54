//! Declared object registry.
//!
//! The app registers each object type before queuing anything for it. A
//! declaration lists the file labels an object of that type may carry,
//! their allowed MIME types and, for files that may be updated after their
//! first upload, the name of the server-side change resolver.

use crate::error::{ReplicaError, ReplicaResult};
use crate::schema::{DeclaredFileRow, DeclaredObjectRow, ReplicaTables, Tx};
use crate::types::MimeType;
use replica_store::RowId;
use std::collections::HashSet;

/// Declaration of one file label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredFile {
    /// Label, unique within the object type.
    pub file_label: String,
    /// Allowed MIME types.
    pub mime_types: Vec<MimeType>,
    /// Resolver for later versions; files without one can only be uploaded once.
    pub change_resolver_name: Option<String>,
    /// Default app metadata.
    pub app_meta_data: Option<String>,
}

impl DeclaredFile {
    /// Declares a label with its MIME types.
    pub fn new(file_label: impl Into<String>, mime_types: impl IntoIterator<Item = MimeType>) -> Self {
        Self {
            file_label: file_label.into(),
            mime_types: normalize(mime_types),
            change_resolver_name: None,
            app_meta_data: None,
        }
    }

    /// Sets the change resolver.
    #[must_use]
    pub fn with_change_resolver(mut self, name: impl Into<String>) -> Self {
        self.change_resolver_name = Some(name.into());
        self
    }

    /// Sets the default app metadata.
    #[must_use]
    pub fn with_app_meta_data(mut self, app_meta_data: impl Into<String>) -> Self {
        self.app_meta_data = Some(app_meta_data.into());
        self
    }

    fn from_row(row: &DeclaredFileRow) -> Self {
        Self {
            file_label: row.file_label.clone(),
            mime_types: row.mime_types.clone(),
            change_resolver_name: row.change_resolver_name.clone(),
            app_meta_data: row.app_meta_data.clone(),
        }
    }

    /// Resolves the MIME type of a file being queued under this label.
    ///
    /// # Errors
    ///
    /// Fails if `requested` is not declared, or if it is absent and the label
    /// declares more than one type.
    pub fn resolve_mime_type(&self, requested: Option<&MimeType>) -> ReplicaResult<MimeType> {
        match requested {
            Some(mime) => {
                let mime = mime.normalized();
                if self.mime_types.contains(&mime) {
                    Ok(mime)
                } else {
                    Err(ReplicaError::MimeTypeNotDeclared {
                        file_label: self.file_label.clone(),
                        mime_type: mime.to_string(),
                    })
                }
            }
            None => match self.mime_types.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(ReplicaError::MimeTypeRequired(self.file_label.clone())),
            },
        }
    }
}

/// Declaration of an object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredObject {
    /// Object type name.
    pub object_type: String,
    /// Declared files.
    pub files: Vec<DeclaredFile>,
}

impl DeclaredObject {
    /// Declares an object type.
    pub fn new(object_type: impl Into<String>, files: Vec<DeclaredFile>) -> Self {
        Self {
            object_type: object_type.into(),
            files,
        }
    }

    /// Finds a file declaration by label.
    #[must_use]
    pub fn file(&self, file_label: &str) -> Option<&DeclaredFile> {
        self.files.iter().find(|f| f.file_label == file_label)
    }
}

/// What a registration changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// The object type was new.
    pub created_object: bool,
    /// Labels added by this registration.
    pub added_files: Vec<String>,
}

impl RegisterOutcome {
    /// Returns true if the registration changed nothing.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        !self.created_object && self.added_files.is_empty()
    }
}

fn normalize(mime_types: impl IntoIterator<Item = MimeType>) -> Vec<MimeType> {
    let mut types: Vec<MimeType> = mime_types.into_iter().map(|m| m.normalized()).collect();
    types.sort();
    types.dedup();
    types
}

/// Registers an object type, adding labels not yet known.
///
/// Existing labels must be declared identically; re-registering an identical
/// declaration changes nothing.
///
/// # Errors
///
/// Fails with a validation error, before writing, if the declaration has no
/// files, repeats a label, or redefines an existing label.
pub fn register(txn: &mut Tx<'_>, object: &DeclaredObject) -> ReplicaResult<RegisterOutcome> {
    if object.files.is_empty() {
        return Err(ReplicaError::NoDeclaredFiles(object.object_type.clone()));
    }
    let mut labels = HashSet::new();
    for file in &object.files {
        if !labels.insert(file.file_label.as_str()) {
            return Err(ReplicaError::DuplicateFileLabel {
                object_type: object.object_type.clone(),
                file_label: file.file_label.clone(),
            });
        }
    }

    let existing = declared_object(txn.tables(), &object.object_type);
    let mut outcome = RegisterOutcome::default();
    let mut new_files = Vec::new();
    for file in &object.files {
        let incoming = DeclaredFile {
            mime_types: normalize(file.mime_types.iter().cloned()),
            ..file.clone()
        };
        match existing.as_ref().and_then(|o| o.file(&file.file_label)) {
            Some(known) => {
                if known.mime_types != incoming.mime_types
                    || known.change_resolver_name != incoming.change_resolver_name
                {
                    return Err(ReplicaError::MatchingFileLabelButOtherDifferences {
                        object_type: object.object_type.clone(),
                        file_label: file.file_label.clone(),
                    });
                }
            }
            None => new_files.push(incoming),
        }
    }

    let object_id = match txn
        .tables()
        .declared_objects
        .by_key("object_type", &object.object_type)
    {
        Some((id, _)) => id,
        None => {
            outcome.created_object = true;
            txn.insert(DeclaredObjectRow {
                object_type: object.object_type.clone(),
            })?
        }
    };
    for file in new_files {
        insert_file(txn, object_id, file.clone())?;
        outcome.added_files.push(file.file_label);
    }

    if !outcome.is_unchanged() {
        tracing::info!(
            object_type = %object.object_type,
            created = outcome.created_object,
            added = ?outcome.added_files,
            "object type registered"
        );
    }
    Ok(outcome)
}

fn insert_file(txn: &mut Tx<'_>, object_id: RowId, file: DeclaredFile) -> ReplicaResult<RowId> {
    Ok(txn.insert(DeclaredFileRow {
        object_id,
        file_label: file.file_label,
        mime_types: file.mime_types,
        change_resolver_name: file.change_resolver_name,
        app_meta_data: file.app_meta_data,
    })?)
}

/// Adds a label reported by the server under a known object type.
///
/// Returns false if the object type is unknown or the label already exists.
pub(crate) fn declare_from_index(
    txn: &mut Tx<'_>,
    object_type: &str,
    file_label: &str,
    mime_type: &MimeType,
) -> ReplicaResult<bool> {
    let Some((object_id, _)) = txn.tables().declared_objects.by_key("object_type", object_type) else {
        return Ok(false);
    };
    if declared_file(txn.tables(), object_type, file_label).is_some() {
        return Ok(false);
    }
    insert_file(txn, object_id, DeclaredFile::new(file_label, [mime_type.clone()]))?;
    tracing::info!(object_type, file_label, "file label declared from server index");
    Ok(true)
}

/// Looks up a registered object type.
#[must_use]
pub fn declared_object(tables: &ReplicaTables, object_type: &str) -> Option<DeclaredObject> {
    let (object_id, row) = tables.declared_objects.by_key("object_type", object_type)?;
    let files = tables
        .declared_files
        .filter(move |f| f.object_id == object_id)
        .map(|(_, f)| DeclaredFile::from_row(f))
        .collect();
    Some(DeclaredObject {
        object_type: row.object_type.clone(),
        files,
    })
}

/// Looks up one declared label.
#[must_use]
pub fn declared_file(tables: &ReplicaTables, object_type: &str, file_label: &str) -> Option<DeclaredFile> {
    let (object_id, _) = tables.declared_objects.by_key("object_type", object_type)?;
    tables
        .declared_files
        .by_key("object_label", format!("{}/{file_label}", object_id.as_u64()))
        .map(|(_, f)| DeclaredFile::from_row(f))
}

/// Every registered object type.
#[must_use]
pub fn declared_objects(tables: &ReplicaTables) -> Vec<DeclaredObject> {
    tables
        .declared_objects
        .iter()
        .filter_map(|(_, row)| declared_object(tables, &row.object_type))
        .collect()
}
