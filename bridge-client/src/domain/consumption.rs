use std::fmt;

use time::OffsetDateTime;

/// One hourly record from the historical consumption API.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionNode {
    pub from: OffsetDateTime,
    pub to: Option<OffsetDateTime>,
    pub consumption: Option<f64>,
    pub cost: Option<f64>,
    pub currency: Option<String>,
    pub unit_price: Option<f64>,
    pub unit_price_vat: Option<f64>,
    pub total_cost: Option<f64>,
    pub unit_cost: Option<f64>,
    pub consumption_unit: Option<String>,
}

impl ConsumptionNode {
    /// A node with only its start instant set; useful as a base for fixtures.
    pub fn at(from: OffsetDateTime) -> Self {
        Self {
            from,
            to: None,
            consumption: None,
            cost: None,
            currency: None,
            unit_price: None,
            unit_price_vat: None,
            total_cost: None,
            unit_cost: None,
            consumption_unit: None,
        }
    }
}

/// Opaque pagination token understood by the historical API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionPage {
    pub nodes: Vec<ConsumptionNode>,
    pub has_next_page: bool,
    pub end_cursor: Option<Cursor>,
}
