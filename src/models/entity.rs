//! Synced entity kinds and their canonical storage rows

use serde::{Deserialize, Serialize};

/// An upstream resource the engine synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Owners,
    Properties,
    Units,
    Tenants,
    Leases,
}

impl EntityKind {
    /// All kinds in dependency order (parents before children)
    pub fn all() -> &'static [EntityKind] {
        &[
            EntityKind::Owners,
            EntityKind::Properties,
            EntityKind::Units,
            EntityKind::Tenants,
            EntityKind::Leases,
        ]
    }

    /// Name used in config, cursors, audit refs and the admin API
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Owners => "owners",
            EntityKind::Properties => "properties",
            EntityKind::Units => "units",
            EntityKind::Tenants => "tenants",
            EntityKind::Leases => "leases",
        }
    }

    /// Upstream collection path
    pub fn path(&self) -> &'static str {
        match self {
            EntityKind::Owners => "/owners",
            EntityKind::Properties => "/properties",
            EntityKind::Units => "/units",
            EntityKind::Tenants => "/tenants",
            EntityKind::Leases => "/leases",
        }
    }

    /// Local table holding the canonical rows
    pub fn table(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owners" => Ok(EntityKind::Owners),
            "properties" => Ok(EntityKind::Properties),
            "units" => Ok(EntityKind::Units),
            "tenants" => Ok(EntityKind::Tenants),
            "leases" => Ok(EntityKind::Leases),
            _ => Err(format!("Invalid entity: {}", s)),
        }
    }
}

/// Canonical owner row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRow {
    pub external_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub updated_at: Option<String>,
}

/// Canonical property row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRow {
    pub external_id: String,
    pub owner_external_id: Option<String>,
    pub name: String,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub updated_at: Option<String>,
}

impl PropertyRow {
    /// Single-line address suitable for a geocoder query
    pub fn full_address(&self) -> Option<String> {
        let parts: Vec<&str> = [
            self.address_line1.as_deref(),
            self.city.as_deref(),
            self.state.as_deref(),
            self.postal_code.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Canonical unit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRow {
    pub external_id: String,
    pub property_external_id: String,
    pub unit_number: String,
    pub bedrooms: Option<i64>,
    pub bathrooms: Option<f64>,
    pub square_feet: Option<i64>,
    pub market_rent: Option<f64>,
    pub updated_at: Option<String>,
}

/// Canonical tenant row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRow {
    pub external_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub updated_at: Option<String>,
}

/// Canonical lease row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub external_id: String,
    pub unit_external_id: String,
    pub tenant_external_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub rent_amount: Option<f64>,
    pub status: Option<String>,
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Display and FromStr agree
    #[test]
    fn test_entity_kind_display_from_str() {
        for kind in EntityKind::all() {
            let parsed: EntityKind = kind.to_string().parse().unwrap();
            assert_eq!(&parsed, kind);
        }
        assert_eq!("OWNERS".parse::<EntityKind>().unwrap(), EntityKind::Owners);
        assert!("garages".parse::<EntityKind>().is_err());
    }

    // Test 2: Paths and serde names
    #[test]
    fn test_entity_kind_path_and_serde() {
        assert_eq!(EntityKind::Leases.path(), "/leases");
        assert_eq!(EntityKind::Units.table(), "units");
        assert_eq!(
            serde_json::to_string(&EntityKind::Properties).unwrap(),
            "\"properties\""
        );
    }

    // Test 3: Every path is the collection name under the root
    #[test]
    fn test_paths_borrow_as_str() {
        fn takes_path(path: &str) -> usize {
            path.len()
        }
        for kind in EntityKind::all() {
            let path: &'static str = kind.path();
            assert_eq!(path, format!("/{}", kind.as_str()));
            assert_eq!(takes_path(kind.path()), kind.as_str().len() + 1);
        }
    }

    // Test 4: Dependency order puts owners first and leases last
    #[test]
    fn test_all_order() {
        let all = EntityKind::all();
        assert_eq!(all.first(), Some(&EntityKind::Owners));
        assert_eq!(all.last(), Some(&EntityKind::Leases));
    }

    // Test 5: Full address skips missing parts
    #[test]
    fn test_property_full_address() {
        let mut row = PropertyRow {
            external_id: "1".to_string(),
            owner_external_id: None,
            name: "Elm Court".to_string(),
            address_line1: Some("12 Elm St".to_string()),
            city: Some("Springfield".to_string()),
            state: None,
            postal_code: Some("".to_string()),
            latitude: None,
            longitude: None,
            updated_at: None,
        };
        assert_eq!(row.full_address(), Some("12 Elm St, Springfield".to_string()));
        assert!(!row.has_coordinates());

        row.address_line1 = None;
        row.city = None;
        assert_eq!(row.full_address(), None);
    }
}
