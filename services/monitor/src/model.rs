//! Domain records exchanged with the source and allocation collaborators.

use serde::{Deserialize, Serialize};

/// One watched data set (a worksheet of the source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,

    /// Location names to watch.
    #[serde(default)]
    pub warehouses: Vec<String>,

    /// Inclusive date range as written in the source (start, end).
    #[serde(default)]
    pub date_range: (String, String),

    #[serde(default)]
    pub items: Vec<Item>,

    /// Highest acceptable coefficient for this data set.
    #[serde(default = "default_max_coefficient")]
    pub max_coefficient: f64,
}

fn default_max_coefficient() -> f64 {
    1.0
}

impl Dataset {
    /// A data set is usable when it has at least one item to check.
    pub fn is_usable(&self) -> bool {
        !self.items.is_empty()
    }
}

/// An item to place (barcode and quantity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub quantity: i64,
}

/// A location known to the allocation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: i64,
    pub name: String,
}

/// Acceptance coefficient for one location, date and box type.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficient {
    pub location_id: i64,
    pub location_name: String,
    /// Date as returned by the API (RFC 3339).
    pub date: String,
    /// Negative values mean the slot is closed.
    pub coefficient: f64,
    pub allow_unload: bool,
    pub box_type: String,
}

/// Acceptance options for a batch of items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionsReport {
    pub result: Vec<ItemOptions>,
}

impl OptionsReport {
    pub fn for_key(&self, key: &str) -> Option<&ItemOptions> {
        self.result.iter().find(|o| o.key == key)
    }
}

/// Where one item may be delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOptions {
    pub key: String,
    pub is_error: bool,
    pub error: Option<String>,
    pub locations: Vec<LocationOption>,
}

/// Packaging accepted for an item at one location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationOption {
    pub location_id: i64,
    pub can_box: bool,
    pub can_monopallet: bool,
    pub can_supersafe: bool,
}

/// Box type names as reported by the coefficient listing.
pub const BOX_TYPE_BOXES: &str = "Короба";
pub const BOX_TYPE_MONOPALLET: &str = "Монопаллеты";
pub const BOX_TYPE_SUPERSAFE: &str = "Суперсейф";

impl LocationOption {
    /// Box type names the item may use here.
    pub fn box_types(&self) -> Vec<&'static str> {
        let mut types = Vec::with_capacity(3);
        if self.can_box {
            types.push(BOX_TYPE_BOXES);
        }
        if self.can_monopallet {
            types.push(BOX_TYPE_MONOPALLET);
        }
        if self.can_supersafe {
            types.push(BOX_TYPE_SUPERSAFE);
        }
        types
    }
}
