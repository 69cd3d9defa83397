//! Tenant ID and the names derived from it.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Maximum tenant ID length.
///
/// Platform object names are capped at 63 characters; the longest derived
/// name is `<prefix>-<tenant>-data`, so the ID leaves room for a short prefix.
pub const MAX_TENANT_ID_LEN: usize = 48;

/// Default prefix for tenant-owned platform objects.
pub const DEFAULT_NAME_PREFIX: &str = "worker";

/// Suffix appended to a tenant's service name to form its volume name.
const VOLUME_SUFFIX: &str = "data";

/// Maximum platform object name length.
const MAX_OBJECT_NAME_LEN: usize = 63;

/// Longest prefix for which `<prefix>-<tenant>-data` still fits.
pub const MAX_NAME_PREFIX_LEN: usize =
    MAX_OBJECT_NAME_LEN - MAX_TENANT_ID_LEN - VOLUME_SUFFIX.len() - 2;

/// Characters allowed inside a name. Names start and end alphanumeric.
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

/// Opaque, stable identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Parses and validates a tenant ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let Some(first) = s.chars().next() else {
            return Err(IdError::Empty);
        };

        if s.len() > MAX_TENANT_ID_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: MAX_TENANT_ID_LEN,
            });
        }

        if !first.is_ascii_alphanumeric() {
            return Err(IdError::InvalidStart(first));
        }

        if let Some((position, ch)) = s.char_indices().find(|(_, c)| !is_name_char(*c)) {
            return Err(IdError::InvalidCharacter { ch, position });
        }

        if let Some(last) = s.chars().last().filter(|c| !c.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidEnd(last));
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for TenantId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Derives platform object names for tenants.
///
/// All names share one prefix so that several fleets can coexist on the
/// same platform without colliding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    prefix: String,
}

impl ResourceNames {
    /// Creates a namer with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Creates a namer, rejecting prefixes that would yield invalid names.
    pub fn try_new(prefix: impl Into<String>) -> Result<Self, IdError> {
        let prefix = prefix.into();
        let invalid = |reason: &str| IdError::InvalidPrefix {
            prefix: prefix.clone(),
            reason: reason.to_string(),
        };

        if prefix.len() > MAX_NAME_PREFIX_LEN {
            return Err(invalid(&format!("longer than {MAX_NAME_PREFIX_LEN} characters")));
        }
        let starts_ok = prefix.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = prefix.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(invalid("must start and end with an ASCII letter or digit"));
        }
        if !prefix.chars().all(is_name_char) {
            return Err(invalid("only ASCII letters, digits, '-' and '_' are allowed"));
        }

        Ok(Self { prefix })
    }

    /// The prefix shared by all derived names.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of the tenant's service.
    #[must_use]
    pub fn service(&self, tenant: &TenantId) -> String {
        format!("{}-{}", self.prefix, tenant)
    }

    /// Name of the tenant's persistent volume.
    #[must_use]
    pub fn volume(&self, tenant: &TenantId) -> String {
        format!("{}-{}-{}", self.prefix, tenant, VOLUME_SUFFIX)
    }

    /// Hostname the tenant's worker is reachable under on the shared network.
    #[must_use]
    pub fn hostname(&self, tenant: &TenantId) -> String {
        format!("{}-{}", self.prefix, tenant)
    }
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_PREFIX)
    }
}
