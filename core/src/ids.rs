/// Service and characteristic identifier normalisation
///
/// Radios report UUIDs in whatever form the OS prefers (16-bit short form,
/// upper-case, braces). Every lookup in the core compares the normalised form.
use uuid::Uuid;

/// Bluetooth Base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit or 32-bit assigned number against the base UUID.
pub fn expand_short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Normalise an identifier to lowercase-hyphenated form.
///
/// Short forms (`180D`, `0x2A37`, `0000FEAA`) are expanded; unparsable input
/// is kept, trimmed and lowercased, so opaque vendor identifiers still match
/// themselves.
pub fn normalize_uuid(raw: &str) -> String {
    let trimmed = raw.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if matches!(short.len(), 4 | 8) {
        if let Ok(value) = u32::from_str_radix(short, 16) {
            return expand_short_uuid(value).hyphenated().to_string();
        }
    }

    match Uuid::parse_str(trimmed) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => trimmed.to_lowercase(),
    }
}
