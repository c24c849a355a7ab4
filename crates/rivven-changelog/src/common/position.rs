//! Log positions
//!
//! A log position is an opaque, fixed-width binary token identifying a point
//! in a database change log. Positions are totally ordered by unsigned
//! byte-wise comparison of their native representation, with a designated
//! null position ordered below every real one.
//!
//! The two backends disagree on byte layout and on what the "next" position
//! is, so each implements [`LogPosition`] on its own type:
//!
//! | Backend    | Type                              | Width    | Increment                  |
//! |------------|-----------------------------------|----------|----------------------------|
//! | SQL Server | [`Lsn`](crate::sqlserver::Lsn)    | 10 bytes | `sys.fn_cdc_increment_lsn` |
//! | Oracle     | [`Scn`](crate::oracle::Scn)       | 8 bytes  | SCN + 1                    |

use crate::common::Result;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// An ordered, fixed-width position in a backend change log.
///
/// The derived `Ord` of implementors must agree with unsigned byte-wise
/// comparison of [`to_bytes`](LogPosition::to_bytes), treating `None` (null)
/// as smaller than every real position.
pub trait LogPosition:
    Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static
{
    /// Ordering key of changes that share one position
    type Sequence: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static;

    /// Byte width of the native representation
    const WIDTH: usize;

    /// Backend name used in events and checkpoints
    const BACKEND: &'static str;

    /// The null / unset position
    fn null() -> Self;

    /// Whether this is the null position
    fn is_null(&self) -> bool;

    /// Decode from the backend's native bytes; `None` is the null position.
    fn from_bytes(bytes: Option<&[u8]>) -> Result<Self>;

    /// Encode to the backend's native bytes; the null position has none.
    fn to_bytes(&self) -> Option<Vec<u8>>;

    /// Text form of an intra-position sequence, free of `:`
    fn encode_sequence(sequence: &Self::Sequence) -> String;

    /// Parse the text produced by [`encode_sequence`](LogPosition::encode_sequence)
    fn decode_sequence(text: &str) -> Result<Self::Sequence>;

    /// Hex text form for persisted offsets ("NULL" for the null position)
    fn to_hex(&self) -> String {
        match self.to_bytes() {
            Some(bytes) => hex::encode_upper(bytes),
            None => "NULL".to_string(),
        }
    }

    /// Parse the hex text form produced by [`to_hex`](LogPosition::to_hex)
    fn from_hex(text: &str) -> Result<Self> {
        if text.eq_ignore_ascii_case("null") || text.is_empty() {
            return Ok(Self::null());
        }
        let bytes = hex::decode(text).map_err(|e| {
            crate::common::CdcError::invalid_position(format!(
                "Invalid {} hex '{}': {}",
                Self::BACKEND,
                text,
                e
            ))
        })?;
        Self::from_bytes(Some(&bytes))
    }

    /// Whether `self` lies in the closed interval `[lo, hi]`
    fn in_range(&self, lo: &Self, hi: &Self) -> bool {
        self >= lo && self <= hi
    }
}

/// Check a native byte slice against the expected position width.
pub(crate) fn fixed_width<const N: usize>(backend: &str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        crate::common::CdcError::invalid_position(format!(
            "{} position must be {} bytes, got {}",
            backend,
            N,
            bytes.len()
        ))
    })
}
