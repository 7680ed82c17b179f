use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Upper bound on how many locations a single monitor watches.
pub const MAX_LOCATIONS: usize = 8;

/// A service location as numbered by the booking site. Identity is `id`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
pub struct Location {
    pub id: u32,
    pub name: String,
}

impl Location {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Look up a display name for a location id, falling back to the id itself.
pub fn location_name(locations: &[Location], id: u32) -> String {
    locations
        .iter()
        .find(|l| l.id == id)
        .map(|l| l.name.clone())
        .unwrap_or_else(|| format!("Location {}", id))
}
