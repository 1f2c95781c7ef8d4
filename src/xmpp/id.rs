//! Request identifiers for correlated stanzas.

/// Mint a fresh 64-bit identifier from the operating system's CSPRNG,
/// rendered as decimal text for the `id` attribute.
///
/// # Panics
///
/// Panics if the OS random source cannot be read. That only happens on a
/// broken host and there is nothing sensible to fall back to.
pub fn next_id() -> String {
    let mut buf = [0u8; 8];
    if let Err(e) = getrandom::fill(&mut buf) {
        panic!("OS random source unavailable: {}", e);
    }
    u64::from_le_bytes(buf).to_string()
}
