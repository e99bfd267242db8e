use serde::{Deserialize, Deserializer};

pub mod horoshop;
pub mod job;
pub mod mapping;
pub mod product;
pub mod supplier;

/// Treats `""` and whitespace-only strings as absent.
pub fn blank_as_none(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn de_blank_as_none<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(de).map(blank_as_none)
}

/// Size values are compared with the decimal separator aligned to `.`
pub fn normalize_size<S: AsRef<str>>(size: S) -> String {
    size.as_ref().trim().replace(',', ".")
}
