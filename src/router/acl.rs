//! Access control applied by the router.
//!
//! Requests arrive either through the local mount, which the owner of the node uses
//! and which is trusted, or through the remote mount on behalf of a principal. Route
//! masks and property descriptors combine the [`Permission`] bits:
//! - `AUTH`: a remote caller must name a principal
//! - `AUTHOR`: a remote principal must be listed in the document's `author` property
//! - `LOCAL`: only the local mount may reach the route or property

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::metadata::{Permission, PropertyDescriptor};

/// Which mount a request came through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// The node's own user.
    Local,
    /// Anyone else.
    #[default]
    Remote,
}

/// Caller of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    pub principal: Option<String>,
    pub access_level: AccessLevel,
}

impl Caller {
    pub fn local() -> Self {
        Self {
            principal: None,
            access_level: AccessLevel::Local,
        }
    }

    pub fn remote(principal: Option<String>) -> Self {
        Self {
            principal,
            access_level: AccessLevel::Remote,
        }
    }

    pub fn is_local(&self) -> bool {
        self.access_level == AccessLevel::Local
    }

    /// Checks the route mask before any document is touched.
    pub fn check_route(&self, mask: Permission) -> Result<()> {
        if mask.contains(Permission::LOCAL) && !self.is_local() {
            return Err(Error::PermissionDenied("local access only".to_string()));
        }
        if self.is_local() {
            return Ok(());
        }
        if (mask.contains(Permission::AUTH) || mask.contains(Permission::AUTHOR))
            && self.principal.is_none()
        {
            return Err(Error::Unauthorized("principal required".to_string()));
        }
        Ok(())
    }

    /// Checks the `AUTHOR` bit against the document's author list. Documents without
    /// authors are open to any authenticated caller.
    pub fn check_author(&self, mask: Permission, authors: &[String]) -> Result<()> {
        if !mask.contains(Permission::AUTHOR) || self.is_local() || authors.is_empty() {
            return Ok(());
        }
        match &self.principal {
            Some(principal) if authors.iter().any(|author| author == principal) => Ok(()),
            Some(principal) => {
                debug!(principal = %principal, "Caller is not an author");
                Err(Error::PermissionDenied(format!("{} is not an author", principal)))
            }
            None => Err(Error::Unauthorized("principal required".to_string())),
        }
    }

    /// Checks a single property against the access bit the route needs.
    pub fn check_property(&self, prop: &PropertyDescriptor, access: Permission) -> Result<()> {
        if !self.can_see(prop) {
            return Err(Error::PermissionDenied(format!("{} is local", prop.name)));
        }
        if !prop.permissions.contains(access) {
            return Err(Error::PermissionDenied(format!(
                "{} does not allow this access",
                prop.name
            )));
        }
        Ok(())
    }

    /// Whether `prop` is visible to this caller at all.
    pub fn can_see(&self, prop: &PropertyDescriptor) -> bool {
        self.is_local() || !prop.permissions.contains(Permission::LOCAL)
    }
}
