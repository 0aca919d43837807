//! Part number extraction and normalization.

/// Characters treated as separators inside part numbers.
pub const SEPARATORS: &[char] = &['-', '/', ',', '*', '&', '~', '.', '%'];

/// Header names (lowercased, trimmed) that hold a part number directly.
const PART_NUMBER_HEADERS: &[&str] = &[
    "part number",
    "part_number",
    "partnumber",
    "part no",
    "part no.",
    "partno",
    "part #",
    "pn",
    "part",
];

const DESCRIPTION_HEADERS: &[&str] = &["item_description", "item description", "description"];

/// How aggressively a part number is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NormalizeLevel {
    /// Trim and collapse inner whitespace.
    Whitespace = 1,
    /// Remove separator characters.
    Separators = 2,
    /// Keep alphanumerics only.
    Alphanumeric = 3,
}

pub fn normalize(text: &str, level: NormalizeLevel) -> String {
    let trimmed = text.trim();
    match level {
        NormalizeLevel::Whitespace => trimmed.split_whitespace().collect::<Vec<_>>().join(" "),
        NormalizeLevel::Separators => trimmed.chars().filter(|c| !SEPARATORS.contains(c)).collect(),
        NormalizeLevel::Alphanumeric => trimmed.chars().filter(|c| c.is_alphanumeric()).collect(),
    }
}

/// Exact-match key: alphanumerics only, upper-cased.
///
/// `"ab-12/3"`, `"AB 123"` and `"ab.123"` all map to `"AB123"`.
pub fn match_key(text: &str) -> String {
    normalize(text, NormalizeLevel::Alphanumeric).to_uppercase()
}

pub fn is_part_number_header(header: &str) -> bool {
    let header = header.trim().to_lowercase();
    PART_NUMBER_HEADERS.contains(&header.as_str())
}

pub fn is_description_header(header: &str) -> bool {
    let header = header.trim().to_lowercase();
    DESCRIPTION_HEADERS.contains(&header.as_str())
}

/// Pick a part number out of free-form description text.
///
/// Prefers the first token mixing letters and digits (at least three
/// characters); otherwise the first token of at least three characters.
pub fn derive_from_description(description: &str) -> Option<String> {
    let tokens: Vec<&str> = description
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| " ,;:\t\n\r()[]{}".contains(c)))
        .filter(|t| t.chars().count() >= 3)
        .collect();

    tokens
        .iter()
        .find(|t| t.chars().any(char::is_alphabetic) && t.chars().any(|c| c.is_ascii_digit()))
        .or_else(|| tokens.first())
        .map(|t| t.to_string())
}
