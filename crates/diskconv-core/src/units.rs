//! Human-readable byte sizes.

use crate::error::{Error, Result};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Format bytes as a human-readable string using binary units.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a size such as `4096`, `512K`, `20MiB` or `100G`.
///
/// Suffixes are case-insensitive and always binary; `K`, `KB` and `KiB`
/// all mean 1024 bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(Error::format(format!("invalid size '{}'", input)));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::format(format!("invalid size '{}'", input)))?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        other => {
            return Err(Error::format(format!(
                "invalid size suffix '{}' in '{}'",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::format(format!("size '{}' overflows", input)))
}
