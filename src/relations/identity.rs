//! Nicknames, identity documents and blockchain identity requests

use tracing::debug;

use super::{Relations, RelationsError};
use crate::dht::{Contact, LAYER_DEFAULT};
use crate::identity::IdUrl;
use crate::records::{
    hour_bucket, IdentityRecord, IdentityRequestRecord, NicknameRecord, Record,
};
use crate::unix_now;

impl Relations {
    pub async fn set_nickname(
        &self,
        nickname: &str,
        position: u32,
        idurl: &IdUrl,
    ) -> Result<Vec<Contact>, RelationsError> {
        let record = NicknameRecord::new(nickname, position, &self.current_form(idurl));
        Ok(self.records.write(&record, None).await?)
    }

    /// Owner of a nickname slot
    pub async fn get_nickname(
        &self,
        nickname: &str,
        position: u32,
        use_cache: bool,
    ) -> Result<Option<IdUrl>, RelationsError> {
        let key = NicknameRecord::key_for(nickname, position);
        let record = self.records.read::<NicknameRecord>(&key, use_cache).await?;
        Ok(record.map(|r| IdUrl::new(r.idurl)))
    }

    pub async fn set_identity(
        &self,
        idurl: &IdUrl,
        identity_source: &str,
    ) -> Result<Vec<Contact>, RelationsError> {
        let record = IdentityRecord::new(&self.current_form(idurl), identity_source);
        Ok(self.records.write(&record, None).await?)
    }

    /// Identity document published under `idurl`
    pub async fn get_identity(
        &self,
        idurl: &IdUrl,
        use_cache: bool,
    ) -> Result<Option<String>, RelationsError> {
        let record = self
            .records
            .read::<IdentityRecord>(idurl.to_text(), use_cache)
            .await?;
        Ok(record.map(|r| r.identity))
    }

    /// Queue a registration request in the current hour's slot
    pub async fn write_identity_request(
        &self,
        position: u32,
        idurl: &IdUrl,
        public_key: &str,
        wallet_address: &str,
    ) -> Result<Vec<Contact>, RelationsError> {
        let record = IdentityRequestRecord::new(
            position,
            &self.current_form(idurl),
            public_key,
            wallet_address,
        );
        debug!("Writing identity request of {} at {}", idurl, record.key());
        Ok(self.records.write(&record, None).await?)
    }

    /// Request queued in the current hour's slot at `position`
    pub async fn read_identity_request(
        &self,
        position: u32,
    ) -> Result<Option<IdentityRequestRecord>, RelationsError> {
        self.read_identity_request_at(hour_bucket(unix_now()), position)
            .await
    }

    pub async fn read_identity_request_at(
        &self,
        bucket: u64,
        position: u32,
    ) -> Result<Option<IdentityRequestRecord>, RelationsError> {
        let key = IdentityRequestRecord::key_for(bucket, position);
        Ok(self
            .records
            .read::<IdentityRequestRecord>(&key, false)
            .await?)
    }

    /// Remove the current hour's request at `position`, idempotent
    pub async fn erase_identity_request(&self, position: u32) -> Result<(), RelationsError> {
        let key = IdentityRequestRecord::key_for(hour_bucket(unix_now()), position);
        self.records.erase(&key, LAYER_DEFAULT).await?;
        debug!("Erased identity request {}", key);
        Ok(())
    }
}
