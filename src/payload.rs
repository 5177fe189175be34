//! Conversions between caller payload types and database columns.
//!
//! `Data`, `Metadata` and `Patch` are opaque to the store; the only
//! requirement is bidirectional conversion with the column type the
//! deployment configured for them. The provided impls cover the three
//! natural payload shapes: raw bytes, plain text and JSON documents.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::{ToSqlOutput, Value};

use crate::errors::{Result, StoreError};

/// Column type a payload is bound to. `Bytea` maps to a `BLOB` column,
/// `Jsonb` and `Text` to `TEXT` columns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColumnType {
    Bytea,
    Jsonb,
    Text,
}

impl ColumnType {
    /// SQL declared type for columns of this kind.
    pub(crate) fn decl(self) -> &'static str {
        match self {
            ColumnType::Bytea => "BLOB",
            ColumnType::Jsonb | ColumnType::Text => "TEXT",
        }
    }
}

/// An encoded column value, as stored in (or read from) the database.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ColumnValue {
    Bytes(Vec<u8>),
    Text(String),
}

impl ColumnValue {
    pub(crate) fn into_sql(self) -> ToSqlOutput<'static> {
        match self {
            ColumnValue::Bytes(b) => ToSqlOutput::Owned(Value::Blob(b)),
            ColumnValue::Text(t) => ToSqlOutput::Owned(Value::Text(t)),
        }
    }

    pub(crate) fn from_sql(column: ColumnType, value: rusqlite::types::Value) -> Result<Self> {
        match (column, value) {
            (ColumnType::Bytea, Value::Blob(b)) => Ok(ColumnValue::Bytes(b)),
            (ColumnType::Jsonb | ColumnType::Text, Value::Text(t)) => Ok(ColumnValue::Text(t)),
            (column, _) => Err(StoreError::Codec {
                column,
                detail: "stored value has an unexpected storage class",
            }),
        }
    }
}

/// Bidirectional conversion between a payload type and a configured column.
///
/// `encode` may fail when the payload cannot be represented in the chosen
/// column (e.g. arbitrary bytes in a `Text` column); such a deployment
/// misconfiguration surfaces as a `Codec` error on first use.
pub trait Payload: Sized + Send + Sync + 'static {
    fn encode(&self, column: ColumnType) -> Result<ColumnValue>;

    fn decode(column: ColumnType, value: ColumnValue) -> Result<Self>;
}

impl Payload for Vec<u8> {
    fn encode(&self, column: ColumnType) -> Result<ColumnValue> {
        match column {
            ColumnType::Bytea => Ok(ColumnValue::Bytes(self.clone())),
            ColumnType::Jsonb | ColumnType::Text => Err(StoreError::Codec {
                column,
                detail: "raw bytes require a bytea column",
            }),
        }
    }

    fn decode(column: ColumnType, value: ColumnValue) -> Result<Self> {
        match (column, value) {
            (ColumnType::Bytea, ColumnValue::Bytes(b)) => Ok(b),
            (column, _) => Err(StoreError::Codec {
                column,
                detail: "raw bytes require a bytea column",
            }),
        }
    }
}

impl Payload for String {
    fn encode(&self, column: ColumnType) -> Result<ColumnValue> {
        match column {
            ColumnType::Text => Ok(ColumnValue::Text(self.clone())),
            // a JSON column stores the string as a JSON string literal
            ColumnType::Jsonb => Ok(ColumnValue::Text(
                serde_json::to_string(self).expect("strings always serialize"),
            )),
            ColumnType::Bytea => Ok(ColumnValue::Bytes(self.clone().into_bytes())),
        }
    }

    fn decode(column: ColumnType, value: ColumnValue) -> Result<Self> {
        let utf8_err = StoreError::Codec {
            column,
            detail: "stored value is not valid UTF-8",
        };
        match (column, value) {
            (ColumnType::Text, ColumnValue::Text(t)) => Ok(t),
            (ColumnType::Jsonb, ColumnValue::Text(t)) => {
                serde_json::from_str(&t).map_err(|_| StoreError::Codec {
                    column,
                    detail: "stored value is not a JSON string",
                })
            }
            (ColumnType::Bytea, ColumnValue::Bytes(b)) => {
                String::from_utf8(b).map_err(|_| utf8_err)
            }
            (column, _) => Err(StoreError::Codec {
                column,
                detail: "stored value has an unexpected storage class",
            }),
        }
    }
}

impl Payload for serde_json::Value {
    fn encode(&self, column: ColumnType) -> Result<ColumnValue> {
        let text = serde_json::to_string(self).expect("json values always serialize");
        match column {
            ColumnType::Jsonb | ColumnType::Text => Ok(ColumnValue::Text(text)),
            ColumnType::Bytea => Ok(ColumnValue::Bytes(text.into_bytes())),
        }
    }

    fn decode(column: ColumnType, value: ColumnValue) -> Result<Self> {
        let text = match (column, value) {
            (ColumnType::Jsonb | ColumnType::Text, ColumnValue::Text(t)) => t,
            (ColumnType::Bytea, ColumnValue::Bytes(b)) => {
                String::from_utf8(b).map_err(|_| StoreError::Codec {
                    column,
                    detail: "stored value is not valid UTF-8",
                })?
            }
            (column, _) => {
                return Err(StoreError::Codec {
                    column,
                    detail: "stored value has an unexpected storage class",
                })
            }
        };
        serde_json::from_str(&text).map_err(|_| StoreError::Codec {
            column,
            detail: "stored value is not valid JSON",
        })
    }
}

/// Marker trait for the `Patch` type parameter.
///
/// `ENABLED` is `false` exactly for the [`NoPatch`] sentinel, in which case
/// the store omits the patches column from its schema entirely.
pub trait PatchPayload: Payload {
    const ENABLED: bool;
}

impl PatchPayload for Vec<u8> {
    const ENABLED: bool = true;
}

impl PatchPayload for String {
    const ENABLED: bool = true;
}

impl PatchPayload for serde_json::Value {
    const ENABLED: bool = true;
}

/// The sentinel patch type: uninhabited, so `update` and patch-carrying
/// `merge` calls are statically impossible, and `replace` is the staging
/// form for new versions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NoPatch {}

impl Payload for NoPatch {
    fn encode(&self, _column: ColumnType) -> Result<ColumnValue> {
        match *self {}
    }

    fn decode(column: ColumnType, _value: ColumnValue) -> Result<Self> {
        Err(StoreError::Codec {
            column,
            detail: "patches are disabled for this store",
        })
    }
}

impl PatchPayload for NoPatch {
    const ENABLED: bool = false;
}

/// Encodes a patch list into the single JSON-array patches column.
///
/// Entries are stored per the configured patch column type: `bytea`
/// patches as base64 strings, `text` patches as strings, `jsonb` patches
/// inline.
pub(crate) fn encode_patches<P: Payload>(patches: &[P], column: ColumnType) -> Result<String> {
    let mut entries = Vec::with_capacity(patches.len());
    for patch in patches {
        let entry = match patch.encode(column)? {
            ColumnValue::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            ColumnValue::Text(t) => match column {
                ColumnType::Jsonb => {
                    serde_json::from_str(&t).map_err(|_| StoreError::Codec {
                        column,
                        detail: "patch is not valid JSON",
                    })?
                }
                _ => serde_json::Value::String(t),
            },
        };
        entries.push(entry);
    }
    Ok(serde_json::Value::Array(entries).to_string())
}

pub(crate) fn decode_patches<P: Payload>(text: &str, column: ColumnType) -> Result<Vec<P>> {
    let malformed = || StoreError::Codec {
        column,
        detail: "patches column is not a well-formed array",
    };
    let entries: Vec<serde_json::Value> = serde_json::from_str(text).map_err(|_| malformed())?;
    let mut patches = Vec::with_capacity(entries.len());
    for entry in entries {
        let value = match (column, entry) {
            (ColumnType::Bytea, serde_json::Value::String(s)) => {
                ColumnValue::Bytes(BASE64.decode(s).map_err(|_| malformed())?)
            }
            (ColumnType::Text, serde_json::Value::String(s)) => ColumnValue::Text(s),
            (ColumnType::Jsonb, entry) => ColumnValue::Text(entry.to_string()),
            _ => return Err(malformed()),
        };
        patches.push(P::decode(column, value)?);
    }
    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_fits_every_column() {
        for column in [ColumnType::Bytea, ColumnType::Jsonb, ColumnType::Text] {
            let s = "hello \"world\"".to_owned();
            let encoded = s.encode(column).unwrap();
            assert_eq!(String::decode(column, encoded).unwrap(), s);
        }
    }

    #[test]
    fn bytes_require_bytea() {
        let b = vec![0u8, 159, 146, 150];
        assert!(b.encode(ColumnType::Text).is_err());
        let encoded = b.encode(ColumnType::Bytea).unwrap();
        assert_eq!(Vec::<u8>::decode(ColumnType::Bytea, encoded).unwrap(), b);
    }

    #[test]
    fn json_round_trips_through_bytea() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": null});
        for column in [ColumnType::Bytea, ColumnType::Jsonb, ColumnType::Text] {
            let encoded = v.encode(column).unwrap();
            assert_eq!(serde_json::Value::decode(column, encoded).unwrap(), v);
        }
    }

    #[test]
    fn patch_lists_round_trip() {
        let patches: Vec<Vec<u8>> = vec![b"one".to_vec(), vec![0, 255, 1]];
        let text = encode_patches(&patches, ColumnType::Bytea).unwrap();
        assert_eq!(
            decode_patches::<Vec<u8>>(&text, ColumnType::Bytea).unwrap(),
            patches
        );

        let patches: Vec<serde_json::Value> =
            vec![serde_json::json!({"op": "add"}), serde_json::json!(7)];
        let text = encode_patches(&patches, ColumnType::Jsonb).unwrap();
        assert_eq!(
            decode_patches::<serde_json::Value>(&text, ColumnType::Jsonb).unwrap(),
            patches
        );
    }

    #[test]
    fn empty_patch_list_is_the_empty_sentinel() {
        let text = encode_patches::<String>(&[], ColumnType::Text).unwrap();
        assert_eq!(text, "[]");
        assert!(decode_patches::<String>(&text, ColumnType::Text)
            .unwrap()
            .is_empty());
    }
}
