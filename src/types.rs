//! Identifier and version primitives shared across the store.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{Result, StoreError};

/// Maximum number of entries returned by a single `list` / `changes` page.
pub const MAX_PAGE_LENGTH: usize = 5000;

/// Implements an opaque 128-bit identifier type.
///
/// The canonical textual form is 32 lowercase hex digits. Identifiers are
/// produced by the process-wide generator (`generate`) and are unique with
/// overwhelming probability; the store never inspects their contents.
macro_rules! impl_id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Draws a fresh identifier from the process-wide generator.
            pub fn generate() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", u128::from_be_bytes(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self> {
                parse_id_hex(s)
                    .map(Self)
                    .ok_or_else(|| StoreError::Parse {
                        what: stringify!($name),
                        input: s.to_owned(),
                    })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                s.parse().map_err(|_| D::Error::custom("malformed identifier"))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(&self.0[..]))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let bytes = value.as_blob()?;
                let bytes: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| FromSqlError::InvalidBlobSize {
                        expected_size: 16,
                        blob_size: value.as_blob().map(<[u8]>::len).unwrap_or(0),
                    })?;
                Ok(Self(bytes))
            }
        }
    };
}

impl_id_type! {
    /// Identity of a stored value, stable across all of its versions.
    ValueId
}
impl_id_type! {
    /// Identity of a changeset (an atomic batch of changes).
    ChangesetId
}
impl_id_type! {
    /// Identity of a view (a named pointer into the changeset DAG).
    ViewId
}

/// Parses exactly 32 hex digits into 16 big-endian bytes.
fn parse_id_hex(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let n = u128::from_str_radix(s, 16).ok()?;
    Some(n.to_be_bytes())
}

/// A concrete version of a value: the changeset that produced it plus the
/// 1-based revision of the change within that changeset.
///
/// The canonical string form is `"<changeset>-<revision>"`; since the
/// changeset's hex form contains no `-`, parsing is unambiguous.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub changeset: ChangesetId,
    pub revision: i64,
}

impl Version {
    pub fn new(changeset: ChangesetId, revision: i64) -> Self {
        Version {
            changeset,
            revision,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.changeset, self.revision)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self)
    }
}

impl FromStr for Version {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let parse_err = || StoreError::Parse {
            what: "Version",
            input: s.to_owned(),
        };
        let (changeset, revision) = s.split_once('-').ok_or_else(parse_err)?;
        let changeset: ChangesetId = changeset.parse().map_err(|_| parse_err())?;
        // a leading `+`, sign or empty string must not slip through
        if !revision.bytes().all(|b| b.is_ascii_digit()) || revision.is_empty() {
            return Err(parse_err());
        }
        let revision: i64 = revision.parse().map_err(|_| parse_err())?;
        if revision < 1 {
            return Err(parse_err());
        }
        Ok(Version {
            changeset,
            revision,
        })
    }
}

/// One staged or committed change, decoded to the caller's payload types.
///
/// `data == None` encodes the deletion tombstone. `parents` holds the
/// value-level parent changesets this change supersedes; `patches` is empty
/// unless the change was staged through `update` or `merge` with patches
/// enabled.
#[derive(Clone, Debug)]
pub struct Change<D, M, P> {
    pub value_id: ValueId,
    pub changeset_id: ChangesetId,
    pub revision: i64,
    pub parents: Vec<ChangesetId>,
    pub data: Option<D>,
    pub metadata: M,
    pub patches: Vec<P>,
}

impl<D, M, P> Change<D, M, P> {
    pub fn version(&self) -> Version {
        Version::new(self.changeset_id, self.revision)
    }

    /// True iff this change deletes the value.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// A commit notification: one changeset became committed to one view.
///
/// Published records carry no store reference; consumers re-attach one with
/// [`CommittedChangeset::with_store`] before reading the changes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommittedChangeset {
    pub changeset: ChangesetId,
    pub view: ViewId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_display_round_trip() {
        let id = ValueId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<ValueId>().unwrap(), id);
    }

    #[test]
    fn id_rejects_malformed() {
        assert!("".parse::<ValueId>().is_err());
        assert!("zz".parse::<ValueId>().is_err());
        // 31 digits
        assert!("0123456789abcdef0123456789abcde".parse::<ValueId>().is_err());
        // hyphenated uuid form is not canonical
        assert!("01234567-89ab-cdef-0123-456789abcdef"
            .parse::<ValueId>()
            .is_err());
    }

    #[test]
    fn version_rejects_malformed() {
        let cs = ChangesetId::generate();
        assert!(format!("{cs}").parse::<Version>().is_err());
        assert!(format!("{cs}-0").parse::<Version>().is_err());
        assert!(format!("{cs}--1").parse::<Version>().is_err());
        assert!(format!("{cs}-+1").parse::<Version>().is_err());
        assert!(format!("{cs}-1x").parse::<Version>().is_err());
        assert!("deadbeef-7".parse::<Version>().is_err());
    }

    #[test]
    fn id_json_round_trip() {
        let ids = vec![ChangesetId::generate(), ChangesetId::generate()];
        let json = serde_json::to_string(&ids).unwrap();
        let back: Vec<ChangesetId> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ids);
    }

    proptest! {
        #[test]
        fn version_parse_round_trip(bytes: [u8; 16], revision in 1i64..) {
            let version = Version::new(ChangesetId::from_bytes(bytes), revision);
            let parsed: Version = version.to_string().parse().unwrap();
            prop_assert_eq!(parsed, version);
        }
    }
}
