use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = corkboard_common::id::prefixed_ulid("brd");
/// assert!(id.starts_with("brd_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CONNECTION: &str = "conn";
    pub const SESSION: &str = "ses";
}
