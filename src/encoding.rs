//! # Wire Encoding and Cursor Codec
//!
//! Every external identifier (transaction id, block hash, data-item id, wallet
//! address, data root) crosses the API boundary as URL-safe base64 without
//! padding and is persisted as raw bytes. This module owns that boundary, plus
//! the two digests the stores key on and the opaque pagination cursors.
//!
//! ## Cursor Format
//!
//! A transaction/data-item cursor is the URL-safe base64 of a JSON tuple:
//!
//! ```text
//! [height, blockTransactionIndex, dataItemId, indexedAt, id]
//! ```
//!
//! `height` and `blockTransactionIndex` are null for rows not yet linked to a
//! block; `dataItemId` is the single byte `0x00` for bare transactions and the
//! item's real id for bundled items, so the tuple sorts transactions before
//! their items at the same block position. A block cursor is the same encoding
//! of the one-element tuple `[height]`.
//!
//! Cursors are opaque: callers round-trip them unmodified, and the encoding may
//! change between releases.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha1::{Digest as _, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};

// =============================================================================
// URL-Safe Base64
// =============================================================================

/// Encodes raw bytes as URL-safe base64 without padding.
pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes a URL-safe base64 string without padding into raw bytes.
pub fn b64_decode(value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| Error::Encoding(format!("{value:?}: {e}")))
}

/// Decodes an optional id, treating `None` and the empty string as absent.
pub fn b64_decode_optional(value: Option<&str>) -> Result<Option<Vec<u8>>> {
    match value {
        None | Some("") => Ok(None),
        Some(v) => b64_decode(v).map(Some),
    }
}

// =============================================================================
// Digests
// =============================================================================

/// 20-byte SHA-1 of the raw bytes of a tag name or tag value.
///
/// Tag occurrences join on these hashes; the literal bytes are stored once in
/// the `tag_names` / `tag_values` dimension tables.
pub fn tag_hash(raw: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(raw);
    hasher.finalize().into()
}

/// 32-byte wallet address: SHA-256 of the owner's public modulus.
pub fn owner_address(public_modulus: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(public_modulus);
    hasher.finalize().into()
}

// =============================================================================
// Item Cursor
// =============================================================================

/// The single projected `data_item_id` byte for bare transactions.
///
/// One zero byte sorts before every real (longer) data-item id, which is what
/// places a transaction ahead of the items bundled inside it.
pub const TX_DATA_ITEM_ID: &[u8] = &[0u8];

/// A decoded position in the transaction/data-item sort order.
///
/// The tuple mirrors the planner's total ordering
/// `(height, block_transaction_index, data_item_id, indexed_at, id)`.
/// Rows whose block is not yet known carry `height = None` and are ordered on
/// the `(indexed_at, id)` plane instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemCursor {
    pub height: Option<u64>,
    pub block_transaction_index: Option<u64>,
    /// `TX_DATA_ITEM_ID` for transactions, the real id for data items.
    pub data_item_id: Vec<u8>,
    pub indexed_at: Option<i64>,
    pub id: Vec<u8>,
}

/// Wire shape of the cursor tuple. Ids travel base64-encoded inside the JSON.
type ItemCursorTuple = (
    Option<u64>,
    Option<u64>,
    Option<String>,
    Option<i64>,
    Option<String>,
);

impl ItemCursor {
    /// Encodes this cursor as an opaque URL-safe base64 string.
    pub fn encode(&self) -> String {
        let tuple: ItemCursorTuple = (
            self.height,
            self.block_transaction_index,
            Some(b64_encode(&self.data_item_id)),
            self.indexed_at,
            Some(b64_encode(&self.id)),
        );
        let json = serde_json::to_string(&tuple).expect("cursor tuple serializes");
        b64_encode(json.as_bytes())
    }

    /// Decodes an opaque cursor string.
    ///
    /// # Errors
    ///
    /// `Error::InvalidCursor` for anything that is not the base64 of a
    /// well-formed cursor tuple.
    pub fn decode(cursor: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|e| Error::InvalidCursor(format!("base64: {e}")))?;
        let tuple: ItemCursorTuple = serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidCursor(format!("tuple: {e}")))?;
        let (height, block_transaction_index, data_item_id, indexed_at, id) = tuple;

        let data_item_id = match data_item_id {
            None => TX_DATA_ITEM_ID.to_vec(),
            Some(s) => b64_decode(&s).map_err(|e| Error::InvalidCursor(e.to_string()))?,
        };
        let id = match id {
            None => Vec::new(),
            Some(s) => b64_decode(&s).map_err(|e| Error::InvalidCursor(e.to_string()))?,
        };

        Ok(Self {
            height,
            block_transaction_index,
            data_item_id,
            indexed_at,
            id,
        })
    }
}

// =============================================================================
// Block Cursor
// =============================================================================

/// A decoded position in the block sort order: just the height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    pub height: u64,
}

impl BlockCursor {
    /// Encodes this cursor as an opaque URL-safe base64 string.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(&(self.height,)).expect("cursor tuple serializes");
        b64_encode(json.as_bytes())
    }

    /// Decodes an opaque block cursor string.
    pub fn decode(cursor: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|e| Error::InvalidCursor(format!("base64: {e}")))?;
        let (height,): (u64,) = serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidCursor(format!("tuple: {e}")))?;
        Ok(Self { height })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_b64_round_trip() {
        let bytes = [0u8, 1, 2, 250, 251, 252, 253, 254, 255];
        let encoded = b64_encode(&bytes);
        assert!(!encoded.contains('='), "no padding on the wire");
        assert_eq!(b64_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_b64_rejects_standard_alphabet() {
        // '+' and '/' belong to the standard alphabet, not the URL-safe one.
        assert!(b64_decode("a+b/").is_err());
    }

    #[test]
    fn test_b64_decode_optional() {
        assert_eq!(b64_decode_optional(None).unwrap(), None);
        assert_eq!(b64_decode_optional(Some("")).unwrap(), None);
        assert_eq!(
            b64_decode_optional(Some("AAEC")).unwrap(),
            Some(vec![0, 1, 2])
        );
    }

    #[test]
    fn test_tag_hash_is_sha1_of_raw_bytes() {
        // SHA-1("App-Name"), independently computed.
        let hash = tag_hash(b"App-Name");
        assert_eq!(hash.len(), 20);
        assert_eq!(hash, tag_hash(b"App-Name"));
        assert_ne!(hash, tag_hash(b"app-name"));
    }

    #[test]
    fn test_owner_address_is_sha256() {
        let addr = owner_address(b"public modulus bytes");
        assert_eq!(addr.len(), 32);
        assert_ne!(addr, owner_address(b"other modulus"));
    }

    #[test]
    fn test_item_cursor_round_trip() {
        let cursor = ItemCursor {
            height: Some(120),
            block_transaction_index: Some(3),
            data_item_id: vec![9; 32],
            indexed_at: Some(1_700_000_000),
            id: vec![7; 32],
        };
        let decoded = ItemCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_item_cursor_null_height_plane() {
        // A row not yet linked to a block: ordered by (indexed_at, id) only.
        let cursor = ItemCursor {
            height: None,
            block_transaction_index: None,
            data_item_id: TX_DATA_ITEM_ID.to_vec(),
            indexed_at: Some(1_700_000_123),
            id: vec![1; 32],
        };
        let decoded = ItemCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.height, None);
        assert_eq!(decoded.indexed_at, Some(1_700_000_123));
        assert_eq!(decoded.data_item_id, TX_DATA_ITEM_ID);
    }

    #[test]
    fn test_invalid_cursor_rejected() {
        assert!(matches!(
            ItemCursor::decode("not-valid-base64!!!"),
            Err(Error::InvalidCursor(_))
        ));
        // Valid base64, but not a cursor tuple.
        assert!(matches!(
            ItemCursor::decode(&b64_encode(b"{\"nope\":1}")),
            Err(Error::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_block_cursor_round_trip() {
        let cursor = BlockCursor { height: 42 };
        assert_eq!(BlockCursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(matches!(
            BlockCursor::decode("!!!"),
            Err(Error::InvalidCursor(_))
        ));
    }
}
