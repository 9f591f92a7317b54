//! Shared value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

macro_rules! uuid_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_key!(
    /// Identifies one file.
    FileUuid
);
uuid_key!(
    /// Identifies a file group: one object instance made of one or more files
    /// that are uploaded, downloaded and deleted together.
    FileGroupUuid
);
uuid_key!(
    /// Identifies the sharing group that scopes a file group.
    SharingGroupUuid
);
uuid_key!(
    /// Identifies one upload batch.
    BatchUuid
);

/// A file version number. The first version of a file is 0.
pub type FileVersion = u32;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns this timestamp moved forward by `duration`, saturating.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A MIME type, stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeType(String);

impl MimeType {
    /// Creates a MIME type, normalizing case and surrounding whitespace.
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_lowercase())
    }

    /// Returns the MIME type as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the stored text is already normalized.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        *self == Self::new(&self.0)
    }

    /// Returns the normalized form of this value.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self::new(&self.0)
    }
}

impl From<&str> for MimeType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cloud storage provider holding a file group's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudStorageType {
    /// Dropbox.
    Dropbox,
    /// Google Drive.
    Google,
    /// A Solid pod.
    Solid,
}

impl fmt::Display for CloudStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dropbox => "dropbox",
            Self::Google => "google",
            Self::Solid => "solid",
        })
    }
}

/// Why the server reports a file as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoneReason {
    /// The owning user was removed.
    UserRemoved,
    /// The file was removed or renamed in cloud storage.
    FileRemovedOrRenamed,
    /// Cloud storage credentials expired or were revoked.
    AuthTokenExpiredOrRevoked,
}
