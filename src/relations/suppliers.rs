use futures::future::join_all;
use tracing::{debug, warn};

use super::{Relations, RelationsError};
use crate::dht::Contact;
use crate::identity::IdUrl;
use crate::records::SuppliersRecord;

/// Other forms of a rotated customer IDURL tried after the given one
const ROTATED_FORMS: usize = 2;

/// Supplier family of a customer as read from the DHT
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSuppliers {
    /// The form of the customer IDURL that produced the record
    pub customer_idurl: IdUrl,
    pub publisher_idurl: Option<IdUrl>,
    pub ecc_map: String,
    pub suppliers: Vec<IdUrl>,
    pub revision: u64,
    pub timestamp: u64,
}

impl CustomerSuppliers {
    fn from_record(record: SuppliersRecord) -> Self {
        Self {
            customer_idurl: IdUrl::new(record.customer_idurl),
            publisher_idurl: record
                .publisher_idurl
                .filter(|p| !p.is_empty())
                .map(IdUrl::new),
            ecc_map: record.ecc_map,
            suppliers: record.suppliers.into_iter().map(IdUrl::new).collect(),
            revision: record.revision,
            timestamp: record.timestamp,
        }
    }
}

impl Relations {
    /// Read the supplier family of a customer
    ///
    /// Known rotated forms of the customer IDURL are tried in turn. Every
    /// listed IDURL is fed to the identity cache before returning, and the
    /// list of any customer other than this node lands in the contacts
    /// database.
    pub async fn read_customer_suppliers(
        &self,
        customer_idurl: &IdUrl,
        use_cache: bool,
    ) -> Result<Option<CustomerSuppliers>, RelationsError> {
        let forms = self
            .identities
            .interner()
            .rotations(customer_idurl.to_text(), ROTATED_FORMS);

        let mut found = None;
        for (attempt, form) in forms.iter().enumerate() {
            if attempt > 0 {
                warn!("Re-trying suppliers of {} with rotated IDURL {}", customer_idurl, form);
            }
            let key = SuppliersRecord::key_for(form);
            if let Some(record) = self
                .records
                .read::<SuppliersRecord>(&key, use_cache && attempt == 0)
                .await?
            {
                found = Some(CustomerSuppliers::from_record(record));
                break;
            }
        }
        let Some(family) = found else {
            debug!("No suppliers record for {}", customer_idurl);
            return Ok(None);
        };

        self.cache_identities(&family).await;

        if !self.is_me(&family.customer_idurl) {
            self.contacts.set_suppliers(
                &family.customer_idurl,
                &family.suppliers,
                Some(&family.ecc_map),
            )?;
        }
        debug!(
            "Read {} suppliers of {} at revision {}",
            family.suppliers.len(),
            family.customer_idurl,
            family.revision
        );
        Ok(Some(family))
    }

    async fn cache_identities(&self, family: &CustomerSuppliers) {
        let targets: Vec<&IdUrl> = family
            .suppliers
            .iter()
            .chain(std::iter::once(&family.customer_idurl))
            .filter(|idurl| !idurl.is_empty())
            .collect();
        let results = join_all(
            targets
                .iter()
                .map(|idurl| self.identities.immediately_caching(idurl)),
        )
        .await;
        for (idurl, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                debug!("Failed caching identity {}: {}", idurl, e);
            }
        }
    }

    /// Publish the supplier family of a customer
    pub async fn write_customer_suppliers(
        &self,
        customer_idurl: &IdUrl,
        suppliers: &[IdUrl],
        ecc_map: &str,
        revision: u64,
        publisher_idurl: Option<&IdUrl>,
    ) -> Result<Vec<Contact>, RelationsError> {
        if self.is_me(customer_idurl) {
            debug!("Writing my own suppliers list to the DHT");
        } else {
            self.contacts
                .set_suppliers(customer_idurl, suppliers, Some(ecc_map))?;
        }
        let customer = self.current_form(customer_idurl);
        let publisher = publisher_idurl.map(|p| self.current_form(p));
        let record = SuppliersRecord::new(
            &customer,
            publisher.as_deref(),
            ecc_map,
            suppliers.iter().map(|s| self.current_form(s)).collect(),
            revision,
        );
        Ok(self.records.write(&record, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::TestNet;
    use super::*;

    const CAROL_OLD: &str = "http://old.net/carol.xml";
    const CAROL: &str = "http://new.net/carol.xml";
    const ALICE: &str = "http://id.net/alice.xml";
    const BOB: &str = "http://id.net/bob.xml";

    #[tokio::test]
    async fn test_write_and_read_suppliers() {
        let net = TestNet::new();
        net.publish(CAROL).await;
        net.publish(ALICE).await;
        let seed = net.relations(7000, BOB).await;
        let alice = net.relations(7001, ALICE).await;
        let bob = net.relations(7002, BOB).await;
        let _ = seed;

        alice
            .write_customer_suppliers(
                &IdUrl::new(CAROL),
                &[IdUrl::new(ALICE), IdUrl::empty()],
                "ecc/2x2",
                1,
                Some(&IdUrl::new(ALICE)),
            )
            .await
            .unwrap();

        let family = bob
            .read_customer_suppliers(&IdUrl::new(CAROL), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.revision, 1);
        assert_eq!(family.suppliers, vec![IdUrl::new(ALICE), IdUrl::empty()]);
        assert_eq!(family.publisher_idurl, Some(IdUrl::new(ALICE)));

        assert!(bob.identities().is_cached(&IdUrl::new(ALICE)).await);
        assert!(bob.identities().is_cached(&IdUrl::new(CAROL)).await);
        let stored = bob.contacts().suppliers(&IdUrl::new(CAROL)).unwrap().unwrap();
        assert_eq!(stored.ecc_map.as_deref(), Some("ecc/2x2"));
    }

    #[tokio::test]
    async fn test_rotated_customer_read() {
        let net = TestNet::new();
        net.publish(ALICE).await;
        net.publish(CAROL).await;
        let _seed = net.relations(7000, BOB).await;
        let writer = net.relations(7001, ALICE).await;
        let reader = net.relations(7002, BOB).await;

        writer
            .write_customer_suppliers(
                &IdUrl::new(CAROL),
                &[IdUrl::new(ALICE), IdUrl::empty()],
                "ecc/2x2",
                0,
                None,
            )
            .await
            .unwrap();

        reader.identities().interner().record_rotation(CAROL_OLD, CAROL);
        let family = reader
            .read_customer_suppliers(&IdUrl::new(CAROL_OLD), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(family.customer_idurl.to_text(), CAROL);
        assert!(reader.identities().is_cached(&IdUrl::new(ALICE)).await);
    }

    #[tokio::test]
    async fn test_missing_family() {
        let net = TestNet::new();
        let _seed = net.relations(7000, BOB).await;
        let reader = net.relations(7001, BOB).await;
        let family = reader
            .read_customer_suppliers(&IdUrl::new(CAROL), true)
            .await
            .unwrap();
        assert!(family.is_none());
    }

    #[tokio::test]
    async fn test_own_family_not_stored_in_contacts() {
        let net = TestNet::new();
        net.publish(ALICE).await;
        net.publish(CAROL).await;
        let _seed = net.relations(7000, BOB).await;
        let carol = net.relations(7001, CAROL).await;
        carol
            .write_customer_suppliers(
                &IdUrl::new(CAROL),
                &[IdUrl::new(ALICE), IdUrl::empty()],
                "ecc/2x2",
                0,
                Some(&IdUrl::new(CAROL)),
            )
            .await
            .unwrap();
        carol
            .read_customer_suppliers(&IdUrl::new(CAROL), false)
            .await
            .unwrap()
            .unwrap();
        assert!(carol.contacts().suppliers(&IdUrl::new(CAROL)).unwrap().is_none());
    }
}
