//! Handles: (name, origin) pairs addressing a repository or job
//!
//! A handle is pure identity. It never holds a snapshot or a connection and
//! always resolves back to a code location through its origin.

use crate::origin::{CodeLocationOrigin, RemoteJobOrigin, RemoteRepositoryOrigin};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Addresses one repository inside one code location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryHandle {
    pub repository_name: String,

    pub code_location_origin: CodeLocationOrigin,

    /// Presentation only; ignored by equality and hashing
    #[serde(default)]
    pub display_metadata: BTreeMap<String, String>,
}

impl RepositoryHandle {
    pub fn new<N: Into<String>>(repository_name: N, code_location_origin: CodeLocationOrigin) -> Self {
        Self {
            repository_name: repository_name.into(),
            code_location_origin,
            display_metadata: BTreeMap::new(),
        }
    }

    /// Rebuild a handle from a persisted origin
    pub fn from_remote_origin(origin: &RemoteRepositoryOrigin) -> Self {
        Self::new(origin.repository_name.clone(), origin.code_location_origin.clone())
    }

    pub fn with_display_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.display_metadata = metadata;
        self
    }

    pub fn location_name(&self) -> &str {
        self.code_location_origin.location_name()
    }

    pub fn for_job<N: Into<String>>(&self, job_name: N) -> JobHandle {
        JobHandle {
            job_name: job_name.into(),
            repository_handle: self.clone(),
        }
    }

    pub fn to_remote_origin(&self) -> RemoteRepositoryOrigin {
        RemoteRepositoryOrigin::new(self.code_location_origin.clone(), self.repository_name.clone())
    }
}

impl PartialEq for RepositoryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.repository_name == other.repository_name
            && self.code_location_origin == other.code_location_origin
    }
}

impl Eq for RepositoryHandle {}

impl Hash for RepositoryHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repository_name.hash(state);
        self.code_location_origin.hash(state);
    }
}

/// Addresses one job inside one repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_name: String,
    pub repository_handle: RepositoryHandle,
}

impl JobHandle {
    pub fn from_remote_origin(origin: &RemoteJobOrigin) -> Self {
        RepositoryHandle::from_remote_origin(&origin.repository_origin).for_job(origin.job_name.clone())
    }

    pub fn location_name(&self) -> &str {
        self.repository_handle.location_name()
    }

    pub fn repository_name(&self) -> &str {
        &self.repository_handle.repository_name
    }

    pub fn to_remote_origin(&self) -> RemoteJobOrigin {
        self.repository_handle.to_remote_origin().get_job_origin(self.job_name.clone())
    }

    /// Names-only selector, independent of connection parameters
    pub fn to_selector(&self) -> JobSelector {
        JobSelector {
            location_name: self.location_name().to_string(),
            repository_name: self.repository_name().to_string(),
            job_name: self.job_name.clone(),
        }
    }
}

/// Job addressed by names alone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobSelector {
    pub location_name: String,
    pub repository_name: String,
    pub job_name: String,
}
