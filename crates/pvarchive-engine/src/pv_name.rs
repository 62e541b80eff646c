//! Canonical PV identity.
//!
//! Every piece of per-PV state is keyed by a [`PvName`]. Names coming from
//! archive requests are normalized once, on entry, and never re-derived.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

const SCHEMES: [&str; 2] = ["pva://", "ca://"];
const DEFAULT_FIELD: &str = ".VAL";

/// A normalized process-variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PvName(String);

impl PvName {
    /// Normalize a raw name: trim, drop the protocol scheme, drop a trailing `.VAL`.
    pub fn normalize(raw: &str) -> Result<Self> {
        let mut name = raw.trim();
        for scheme in SCHEMES {
            if let Some(rest) = name.strip_prefix(scheme) {
                name = rest;
                break;
            }
        }
        if let Some(rest) = name.strip_suffix(DEFAULT_FIELD) {
            name = rest;
        }
        if name.is_empty() || name.starts_with('.') {
            return Err(ArchiveError::InvalidPvName {
                name: raw.to_string(),
            });
        }
        Ok(Self(name.to_string()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Field suffix, e.g. `HIHI` for `REC:A.HIHI`.
    pub fn field_name(&self) -> Option<&str> {
        self.0
            .rsplit_once('.')
            .map(|(_, field)| field)
            .filter(|field| !field.is_empty())
    }

    /// The record part of the name with any field suffix removed.
    pub fn without_field(&self) -> PvName {
        match self.0.rsplit_once('.') {
            Some((record, _)) => PvName(record.to_string()),
            None => self.clone(),
        }
    }
}

impl fmt::Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PvName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_whitespace() {
        let name = PvName::normalize("  ROOM:TEMP  ").unwrap();
        assert_eq!(name.as_str(), "ROOM:TEMP");
    }

    #[test]
    fn test_normalize_strips_val_field() {
        let name = PvName::normalize("ROOM:TEMP.VAL").unwrap();
        assert_eq!(name.as_str(), "ROOM:TEMP");
        assert_eq!(name.field_name(), None);
    }

    #[test]
    fn test_normalize_strips_scheme() {
        assert_eq!(PvName::normalize("pva://ROOM:TEMP").unwrap().as_str(), "ROOM:TEMP");
        assert_eq!(PvName::normalize("ca://ROOM:TEMP.VAL").unwrap().as_str(), "ROOM:TEMP");
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(PvName::normalize("").is_err());
        assert!(PvName::normalize("   ").is_err());
        assert!(PvName::normalize(".VAL").is_err());
        assert!(PvName::normalize("pva://").is_err());
    }

    #[test]
    fn test_field_name_and_record() {
        let name = PvName::normalize("ROOM:TEMP.HIHI").unwrap();
        assert_eq!(name.field_name(), Some("HIHI"));
        assert_eq!(name.without_field().as_str(), "ROOM:TEMP");
    }

    #[test]
    fn test_without_field_on_plain_name_is_identity() {
        let name = PvName::normalize("ROOM:TEMP").unwrap();
        assert_eq!(name.without_field(), name);
    }

    #[test]
    fn test_equal_after_normalization() {
        let a = PvName::normalize("ROOM:TEMP").unwrap();
        let b = PvName::normalize(" pva://ROOM:TEMP.VAL").unwrap();
        assert_eq!(a, b);
    }
}
