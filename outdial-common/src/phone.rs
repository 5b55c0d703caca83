//! Phone-key normalization.
//!
//! Every cross-store join uses the normalized decimal-digit form of a phone
//! number. All persisted records hold this form; raw provider strings never
//! leak past an ingress or settings boundary.

/// Normalize a phone number to its join-key form.
///
/// Strips every non-digit, then drops a leading country-code `1` from
/// eleven-digit numbers. Anything else passes through digits-only.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_owned()
    } else {
        digits
    }
}

/// Whether a normalized key looks like a dialable NANP number.
pub fn is_dialable(key: &str) -> bool {
    key.len() == 10 && !key.starts_with('0') && !key.starts_with('1')
}
