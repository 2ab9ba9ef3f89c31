use bytes::Bytes;
use lazy_static::lazy_static;

pub const EMPTY_BLOB_SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

/// sha1 of the first (full) block of [BLOB_4097].
pub const BLOB_4097_BLOCK_0_SHA1: &str = "92ca8f2b4163e64a1b53e0fde263ad56cbdb75fc";
/// sha1 of the single trailing byte of [BLOB_4097].
pub const BLOB_4097_BLOCK_1_SHA1: &str = "511993d3c99719e38a6779073019dacd7178ddb9";

/// sha1 of [MANIFEST_CONTENTS].
pub const MANIFEST_SHA1: &str = "fd04cf7fb33545605644625909d3ea76b1749061";

lazy_static! {
    // one full block and a single byte spilling into the next one.
    pub static ref BLOB_4097: Bytes = (0..4097u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();

    /// Protects `/blob` (holding [BLOB_4097]) and `/empty`.
    pub static ref MANIFEST_CONTENTS: Bytes = format!(
        "2\n/blob {BLOB_4097_BLOCK_0_SHA1} {BLOB_4097_BLOCK_1_SHA1}\n/empty {EMPTY_BLOB_SHA1}\n"
    )
    .into_bytes()
    .into();
}
