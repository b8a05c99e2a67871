//! Driver records.

use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::model::Driver;

use super::{DRIVERS_DIR, RecordDir, StoreError, validate_name};

const KIND: &str = "driver";

/// In-memory view of every driver, written through to disk.
#[derive(Debug)]
pub struct DriverStore {
    records: RecordDir,
    drivers: BTreeMap<String, Driver>,
}

impl DriverStore {
    /// Loads every driver under `home`. Unparseable files are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created or
    /// listed.
    pub fn load(home: &Utf8Path) -> Result<Self, StoreError> {
        let records = RecordDir::open(home.join(DRIVERS_DIR))?;
        let drivers = records
            .load_all::<Driver>()?
            .into_iter()
            .map(|driver| (driver.name.clone(), driver))
            .collect();
        Ok(Self { records, drivers })
    }

    /// Looks up a driver.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Driver> {
        self.drivers.get(name)
    }

    /// Iterates over drivers in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Driver> {
        self.drivers.values()
    }

    /// Adds and persists a driver, rolling back the in-memory entry when the
    /// write fails.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] for a duplicate name, or the
    /// persistence error.
    pub fn add(&mut self, driver: Driver) -> Result<(), StoreError> {
        validate_name(KIND, &driver.name)?;
        if self.drivers.contains_key(&driver.name) {
            return Err(StoreError::AlreadyExists {
                kind: KIND,
                name: driver.name,
            });
        }
        let name = driver.name.clone();
        self.records.write(&name, &driver)?;
        self.drivers.insert(name, driver);
        Ok(())
    }

    /// Deletes a driver.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown drivers, or the file
    /// system error.
    pub fn remove(&mut self, name: &str) -> Result<Driver, StoreError> {
        if !self.drivers.contains_key(name) {
            return Err(not_found(name));
        }
        self.records.delete(name)?;
        self.drivers.remove(name).ok_or_else(|| not_found(name))
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::NotFound {
        kind: KIND,
        name: name.to_owned(),
    }
}
