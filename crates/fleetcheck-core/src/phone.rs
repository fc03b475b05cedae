/// Country code prepended to bare 10-digit subscriber numbers.
const COUNTRY_CODE: char = '7';
/// Domestic trunk prefix that callers commonly write in place of the
/// country code; corrected during normalization.
const TRUNK_PREFIX: char = '8';

/// Normalizes a raw phone number into the canonical `+7XXXXXXXXXX` form.
///
/// All non-digit characters are stripped first. Eleven digits led by the
/// country code pass through; eleven digits led by the trunk prefix have it
/// corrected to the country code; bare ten-digit numbers gain the country
/// code. Anything else is invalid and the row carrying it is dropped by the
/// work queue.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        11 if digits.starts_with(COUNTRY_CODE) => Some(format!("+{digits}")),
        11 if digits.starts_with(TRUNK_PREFIX) => {
            Some(format!("+{COUNTRY_CODE}{}", &digits[1..]))
        }
        10 => Some(format!("+{COUNTRY_CODE}{digits}")),
        _ => None,
    }
}
