use futures::future::join_all;
use tracing::{debug, error};

use super::{Relations, RelationsError};
use crate::dht::Contact;
use crate::identity::IdUrl;
use crate::records::MessageBrokerRecord;

/// Message broker of a customer at one position
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerInfo {
    pub customer_idurl: IdUrl,
    pub broker_idurl: IdUrl,
    pub position: u32,
    pub revision: u64,
    pub timestamp: u64,
}

impl Relations {
    /// Read the brokers of a customer at `positions`, sorted by position
    ///
    /// Records naming another customer or position than their key, and
    /// brokers whose identity can not be fetched, are left out.
    pub async fn read_customer_message_brokers(
        &self,
        customer_idurl: &IdUrl,
        positions: &[u32],
        use_cache: bool,
    ) -> Result<Vec<BrokerInfo>, RelationsError> {
        let reads = positions
            .iter()
            .map(|position| self.read_one_broker(customer_idurl, *position, use_cache));
        let mut brokers = Vec::new();
        for result in join_all(reads).await {
            if let Some(broker) = result? {
                brokers.push(broker);
            }
        }
        brokers.sort_by_key(|b| b.position);
        debug!("Found {} message brokers of {}", brokers.len(), customer_idurl);
        Ok(brokers)
    }

    async fn read_one_broker(
        &self,
        customer_idurl: &IdUrl,
        position: u32,
        use_cache: bool,
    ) -> Result<Option<BrokerInfo>, RelationsError> {
        let key = MessageBrokerRecord::key_for(&self.current_form(customer_idurl), position);
        let Some(record) = self
            .records
            .read::<MessageBrokerRecord>(&key, use_cache)
            .await?
        else {
            return Ok(None);
        };

        let record_customer = IdUrl::new(record.customer_idurl.as_str());
        if !self
            .identities
            .interner()
            .rotated_equal(record_customer.to_text(), customer_idurl.to_text())
            && record_customer != *customer_idurl
        {
            error!(
                "Wrong customer {} in message broker record of {} at position {}",
                record_customer, customer_idurl, position
            );
            return Ok(None);
        }
        if record.position != position {
            error!(
                "Wrong position {} in message broker record of {} at position {}",
                record.position, customer_idurl, position
            );
            return Ok(None);
        }

        let broker_idurl = IdUrl::new(record.broker_idurl.as_str());
        if let Err(e) = self.identities.immediately_caching(&broker_idurl).await {
            debug!("Broker {} identity not available: {}", broker_idurl, e);
            return Ok(None);
        }
        Ok(Some(BrokerInfo {
            customer_idurl: record_customer,
            broker_idurl,
            position,
            revision: record.revision,
            timestamp: record.timestamp,
        }))
    }

    /// Publish the broker of a customer at one position
    pub async fn write_customer_message_broker(
        &self,
        customer_idurl: &IdUrl,
        broker_idurl: &IdUrl,
        position: u32,
        revision: u64,
    ) -> Result<Vec<Contact>, RelationsError> {
        let record = MessageBrokerRecord::new(
            &self.current_form(customer_idurl),
            &self.current_form(broker_idurl),
            position,
            revision,
        );
        Ok(self.records.write(&record, None).await?)
    }
}
