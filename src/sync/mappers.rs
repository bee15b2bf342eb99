//! Entity mappers: upstream records to canonical rows
//!
//! Each `map_*` function is pure. Upstream records use camelCase fields and
//! ids that may be JSON numbers or strings; optional fields coalesce to
//! `None` when absent or null. `EntityMappers::apply` maps a batch and
//! upserts it, and after a properties upsert looks up coordinates for rows
//! that lack them. Geocoding failures are logged and never fail the batch.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{MapperError, SyncError};
use crate::models::{EntityKind, LeaseRow, OwnerRow, PropertyRow, TenantRow, UnitRow};

/// Address lookup collaborator for property enrichment
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Returns `(latitude, longitude)` or `None` when the address is unknown
    async fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>, SyncError>;
}

/// Result of mapping and storing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperOutcome {
    pub fetched: u64,
    pub upserted: u64,
}

/// Maps and upserts batches for every entity kind
pub struct EntityMappers<D: Database> {
    db: Arc<D>,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl<D: Database> EntityMappers<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db, geocoder: None }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Map `records` and upsert them unless `dry_run`
    pub async fn apply(
        &self,
        kind: EntityKind,
        records: &[Value],
        dry_run: bool,
    ) -> Result<MapperOutcome, MapperError> {
        let fetched = records.len() as u64;
        let upsert_err = |e: crate::error::DbError| MapperError::Upsert {
            entity: kind.to_string(),
            reason: e.to_string(),
        };

        let upserted = match kind {
            EntityKind::Owners => {
                let rows = map_all(records, map_owner)?;
                if dry_run {
                    0
                } else {
                    self.db.upsert_owners(&rows).await.map_err(upsert_err)?
                }
            }
            EntityKind::Properties => {
                let rows = map_all(records, map_property)?;
                if dry_run {
                    0
                } else {
                    let written = self.db.upsert_properties(&rows).await.map_err(upsert_err)?;
                    self.enrich_properties(&rows).await;
                    written
                }
            }
            EntityKind::Units => {
                let rows = map_all(records, map_unit)?;
                if dry_run {
                    0
                } else {
                    self.db.upsert_units(&rows).await.map_err(upsert_err)?
                }
            }
            EntityKind::Tenants => {
                let rows = map_all(records, map_tenant)?;
                if dry_run {
                    0
                } else {
                    self.db.upsert_tenants(&rows).await.map_err(upsert_err)?
                }
            }
            EntityKind::Leases => {
                let rows = map_all(records, map_lease)?;
                if dry_run {
                    0
                } else {
                    self.db.upsert_leases(&rows).await.map_err(upsert_err)?
                }
            }
        };

        debug!(entity = %kind, fetched = fetched, upserted = upserted, dry_run = dry_run, "Mapped batch");
        Ok(MapperOutcome { fetched, upserted })
    }

    async fn enrich_properties(&self, rows: &[PropertyRow]) {
        let Some(geocoder) = &self.geocoder else {
            return;
        };

        for row in rows.iter().filter(|r| !r.has_coordinates()) {
            let Some(address) = row.full_address() else {
                continue;
            };

            match geocoder.geocode(&address).await {
                Ok(Some((lat, lon))) => {
                    if let Err(e) = self
                        .db
                        .set_property_coordinates(&row.external_id, lat, lon)
                        .await
                    {
                        warn!(external_id = %row.external_id, error = %e, "Failed to store coordinates");
                    }
                }
                Ok(None) => {
                    debug!(external_id = %row.external_id, "Address not found by geocoder");
                }
                Err(e) => {
                    warn!(external_id = %row.external_id, error = %e, "Geocoding failed");
                }
            }
        }
    }
}

fn map_all<T>(
    records: &[Value],
    map: fn(&Value) -> Result<T, MapperError>,
) -> Result<Vec<T>, MapperError> {
    records.iter().map(map).collect()
}

// =========================================================================
// Pure mappers
// =========================================================================

pub fn map_owner(record: &Value) -> Result<OwnerRow, MapperError> {
    let r = Record::new(record, EntityKind::Owners)?;
    Ok(OwnerRow {
        external_id: r.id("id")?,
        name: r.required_str("name")?,
        email: r.opt_str("email")?,
        phone: r.opt_str("phone")?,
        updated_at: r.opt_str("updatedAt")?,
    })
}

pub fn map_property(record: &Value) -> Result<PropertyRow, MapperError> {
    let r = Record::new(record, EntityKind::Properties)?;
    let address = r.nested("address")?;

    Ok(PropertyRow {
        external_id: r.id("id")?,
        owner_external_id: r.opt_id("ownerId")?,
        name: r.required_str("name")?,
        address_line1: address.opt_str("line1")?,
        city: address.opt_str("city")?,
        state: address.opt_str("state")?,
        postal_code: address.opt_str("postalCode")?,
        latitude: r.opt_f64("latitude")?,
        longitude: r.opt_f64("longitude")?,
        updated_at: r.opt_str("updatedAt")?,
    })
}

pub fn map_unit(record: &Value) -> Result<UnitRow, MapperError> {
    let r = Record::new(record, EntityKind::Units)?;
    Ok(UnitRow {
        external_id: r.id("id")?,
        property_external_id: r.id("propertyId")?,
        unit_number: r.required_str("unitNumber")?,
        bedrooms: r.opt_i64("bedrooms")?,
        bathrooms: r.opt_f64("bathrooms")?,
        square_feet: r.opt_i64("squareFeet")?,
        market_rent: r.opt_f64("marketRent")?,
        updated_at: r.opt_str("updatedAt")?,
    })
}

pub fn map_tenant(record: &Value) -> Result<TenantRow, MapperError> {
    let r = Record::new(record, EntityKind::Tenants)?;
    Ok(TenantRow {
        external_id: r.id("id")?,
        first_name: r.required_str("firstName")?,
        last_name: r.required_str("lastName")?,
        email: r.opt_str("email")?,
        phone: r.opt_str("phone")?,
        updated_at: r.opt_str("updatedAt")?,
    })
}

pub fn map_lease(record: &Value) -> Result<LeaseRow, MapperError> {
    let r = Record::new(record, EntityKind::Leases)?;
    Ok(LeaseRow {
        external_id: r.id("id")?,
        unit_external_id: r.id("unitId")?,
        tenant_external_id: r.opt_id("tenantId")?,
        start_date: r.opt_str("startDate")?,
        end_date: r.opt_str("endDate")?,
        rent_amount: r.opt_f64("rentAmount")?,
        status: r.opt_str("status")?,
        updated_at: r.opt_str("updatedAt")?,
    })
}

/// Typed field access over one upstream JSON object
struct Record<'a> {
    fields: Option<&'a Map<String, Value>>,
    entity: EntityKind,
}

impl<'a> Record<'a> {
    fn new(value: &'a Value, entity: EntityKind) -> Result<Self, MapperError> {
        match value.as_object() {
            Some(fields) => Ok(Self {
                fields: Some(fields),
                entity,
            }),
            None => Err(MapperError::InvalidField {
                entity: entity.to_string(),
                field: "<record>".to_string(),
                reason: "expected a JSON object".to_string(),
            }),
        }
    }

    /// Nested object; absent or null yields an empty record
    fn nested(&self, field: &str) -> Result<Record<'a>, MapperError> {
        match self.get(field) {
            None => Ok(Record {
                fields: None,
                entity: self.entity,
            }),
            Some(Value::Object(map)) => Ok(Record {
                fields: Some(map),
                entity: self.entity,
            }),
            Some(_) => Err(self.invalid(field, "expected an object")),
        }
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.fields
            .and_then(|f| f.get(field))
            .filter(|v| !v.is_null())
    }

    fn missing(&self, field: &str) -> MapperError {
        MapperError::MissingField {
            entity: self.entity.to_string(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: &str) -> MapperError {
        MapperError::InvalidField {
            entity: self.entity.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    fn opt_id(&self, field: &str) -> Result<Option<String>, MapperError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(self.invalid(field, "expected a string or number id")),
        }
    }

    fn id(&self, field: &str) -> Result<String, MapperError> {
        self.opt_id(field)?.ok_or_else(|| self.missing(field))
    }

    fn opt_str(&self, field: &str) -> Result<Option<String>, MapperError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(field, "expected a scalar")),
        }
    }

    fn required_str(&self, field: &str) -> Result<String, MapperError> {
        self.opt_str(field)?
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| self.missing(field))
    }

    fn opt_f64(&self, field: &str) -> Result<Option<f64>, MapperError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "number out of range")),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(field, "expected a number")),
            Some(_) => Err(self.invalid(field, "expected a number")),
        }
    }

    fn opt_i64(&self, field: &str) -> Result<Option<i64>, MapperError> {
        match self.opt_f64(field)? {
            None => Ok(None),
            Some(v) if v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(_) => Err(self.invalid(field, "expected an integer")),
        }
    }
}
