//! Trading product identifiers (BTC-USD format)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trading product identifier (BASE-QUOTE format, e.g. "BTC-USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Product(String);

impl Product {
    /// BTC-USD product
    pub const BTC_USD: &'static str = "BTC-USD";
    /// ETH-USD product
    pub const ETH_USD: &'static str = "ETH-USD";
    /// ETH-BTC product
    pub const ETH_BTC: &'static str = "ETH-BTC";

    /// Create a new product from a string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the product as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the base currency (e.g., "BTC" from "BTC-USD")
    pub fn base(&self) -> Option<&str> {
        self.0.split('-').next()
    }

    /// Get the quote currency (e.g., "USD" from "BTC-USD")
    pub fn quote(&self) -> Option<&str> {
        self.0.split('-').nth(1)
    }
}

impl FromStr for Product {
    type Err = ProductParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 2 {
            return Err(ProductParseError::InvalidFormat(s.to_string()));
        }
        if parts[0].is_empty() || parts[1].is_empty() {
            return Err(ProductParseError::EmptyPart(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Product {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Product {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Product {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Error parsing a product identifier
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProductParseError {
    #[error("Product must be BASE-QUOTE: {0}")]
    InvalidFormat(String),

    #[error("Product has empty base or quote: {0}")]
    EmptyPart(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_parse() {
        let product: Product = "BTC-USD".parse().unwrap();
        assert_eq!(product.as_str(), "BTC-USD");
        assert_eq!(product.base(), Some("BTC"));
        assert_eq!(product.quote(), Some("USD"));
    }

    #[test]
    fn test_product_parse_error() {
        assert!("BTCUSD".parse::<Product>().is_err());
        assert!("-USD".parse::<Product>().is_err());
        assert!("BTC-".parse::<Product>().is_err());
    }

    #[test]
    fn test_product_serde() {
        let product = Product::new("ETH-USD");
        let json = serde_json::to_string(&product).unwrap();
        assert_eq!(json, "\"ETH-USD\"");

        let parsed: Product = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, product);
    }
}
