use serde::{Deserialize, Serialize};

/// Link target used when a search provider supplies no URL for an item.
pub const PLACEHOLDER_URL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub url: String,
}

impl Product {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}
