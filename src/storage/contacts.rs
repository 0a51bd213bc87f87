//! Local contacts database using sled embedded database
//!
//! Holds the supplier list known for each customer and the meta info a
//! customer sent to this supplier about its own slot.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::identity::IdUrl;
use crate::unix_now;

#[derive(Error, Debug)]
pub enum ContactsError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupted entry for {0}: {1}")]
    Corrupted(String, serde_json::Error),
}

/// Ordered suppliers of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierList {
    pub ecc_map: Option<String>,
    pub suppliers: Vec<IdUrl>,
    pub updated_at: u64,
}

/// What a customer told this supplier about its place in the family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMeta {
    pub ecc_map: Option<String>,
    pub position: Option<usize>,
    #[serde(default)]
    pub family_snapshot: Vec<IdUrl>,
}

pub struct ContactsStore {
    db: Db,
    suppliers: Tree,
    customer_meta: Tree,
}

impl ContactsStore {
    /// Open or create the contacts database at given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContactsError> {
        Self::from_db(sled::open(path)?)
    }

    /// Database that lives only as long as the process
    pub fn temporary() -> Result<Self, ContactsError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, ContactsError> {
        let suppliers = db.open_tree("suppliers")?;
        let customer_meta = db.open_tree("customer_meta")?;
        Ok(Self {
            db,
            suppliers,
            customer_meta,
        })
    }

    /// Store the supplier list of a customer
    pub fn set_suppliers(
        &self,
        customer: &IdUrl,
        suppliers: &[IdUrl],
        ecc_map: Option<&str>,
    ) -> Result<(), ContactsError> {
        let entry = SupplierList {
            ecc_map: ecc_map.map(str::to_string),
            suppliers: suppliers.to_vec(),
            updated_at: unix_now(),
        };
        let raw = serde_json::to_vec(&entry)
            .map_err(|e| ContactsError::Corrupted(customer.to_string(), e))?;
        self.suppliers.insert(customer.to_text().as_bytes(), raw)?;
        debug!("Stored {} suppliers for {}", suppliers.len(), customer);
        Ok(())
    }

    /// Supplier list of a customer, trying every form of its IDURL
    pub fn suppliers(&self, customer: &IdUrl) -> Result<Option<SupplierList>, ContactsError> {
        for form in customer.forms() {
            if let Some(raw) = self.suppliers.get(form.as_bytes())? {
                let entry = serde_json::from_slice(&raw)
                    .map_err(|e| ContactsError::Corrupted(form.to_string(), e))?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn set_customer_meta(
        &self,
        customer: &IdUrl,
        meta: &CustomerMeta,
    ) -> Result<(), ContactsError> {
        let raw = serde_json::to_vec(meta)
            .map_err(|e| ContactsError::Corrupted(customer.to_string(), e))?;
        self.customer_meta
            .insert(customer.to_text().as_bytes(), raw)?;
        Ok(())
    }

    pub fn customer_meta(&self, customer: &IdUrl) -> Result<Option<CustomerMeta>, ContactsError> {
        for form in customer.forms() {
            if let Some(raw) = self.customer_meta.get(form.as_bytes())? {
                let meta = serde_json::from_slice(&raw)
                    .map_err(|e| ContactsError::Corrupted(form.to_string(), e))?;
                return Ok(Some(meta));
            }
        }
        Ok(None)
    }

    /// Customers with stored meta info
    pub fn customers(&self) -> Result<Vec<IdUrl>, ContactsError> {
        let mut customers = Vec::new();
        for item in self.customer_meta.iter() {
            let (key, _) = item?;
            customers.push(IdUrl::new(String::from_utf8_lossy(&key).into_owned()));
        }
        Ok(customers)
    }

    /// Forget everything known about a customer
    pub fn remove_customer(&self, customer: &IdUrl) -> Result<(), ContactsError> {
        for form in customer.forms() {
            self.suppliers.remove(form.as_bytes())?;
            self.customer_meta.remove(form.as_bytes())?;
        }
        Ok(())
    }

    /// Flush changes to disk
    pub fn flush(&self) -> Result<(), ContactsError> {
        self.db.flush()?;
        Ok(())
    }
}
