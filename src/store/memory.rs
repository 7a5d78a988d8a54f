use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{
    record_id, AcmeUserSession, AcmeUserStore, CertSession, CertStateStore, CertificateRecord,
    IssuedCertificate, RenewalJob, StoreError, StoreResult, StoredAccount,
};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    certs: Mutex<HashMap<Key, (CertificateRecord, IssuedCertificate)>>,
    accounts: Mutex<HashMap<Key, StoredAccount>>,
    cert_writes: AtomicUsize,
}

/// Process-local store for both certificates and accounts.
///
/// Sessions share the same maps, so concurrent engine calls observe each other's writes exactly as
/// they would with a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful certificate mutations so far.
    pub fn cert_writes(&self) -> usize {
        self.inner.cert_writes.load(Ordering::SeqCst)
    }

    pub fn account_count(&self) -> usize {
        self.inner.accounts.lock().len()
    }

    fn open(&self) -> Box<MemorySession> {
        Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
        })
    }
}

#[async_trait]
impl CertStateStore for MemoryStore {
    async fn session(&self) -> StoreResult<Box<dyn CertSession>> {
        Ok(self.open())
    }
}

#[async_trait]
impl AcmeUserStore for MemoryStore {
    async fn session(&self) -> StoreResult<Box<dyn AcmeUserSession>> {
        Ok(self.open())
    }
}

struct MemorySession {
    inner: Arc<Inner>,
}

fn key(a: &str, b: &str) -> Key {
    (a.to_owned(), b.to_owned())
}

#[async_trait]
impl CertSession for MemorySession {
    async fn get_by_id(
        &self,
        key_name: &str,
        ca_id: &str,
    ) -> StoreResult<Option<CertificateRecord>> {
        let certs = self.inner.certs.lock();
        Ok(certs
            .get(&key(key_name, ca_id))
            .map(|(record, _)| record.clone()))
    }

    async fn put(
        &self,
        record: &CertificateRecord,
        issued: &IssuedCertificate,
    ) -> StoreResult<u64> {
        let mut certs = self.inner.certs.lock();
        let id = key(&record.key_name, &record.ca_id);

        if certs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(record.id()));
        }

        let mut record = record.clone();
        record.version = 1;
        certs.insert(id, (record, issued.clone()));
        self.inner.cert_writes.fetch_add(1, Ordering::SeqCst);

        Ok(1)
    }

    async fn update(
        &self,
        record: &CertificateRecord,
        expected_version: u64,
        issued: &IssuedCertificate,
    ) -> StoreResult<u64> {
        let mut certs = self.inner.certs.lock();

        let Some((stored, stored_issued)) = certs.get_mut(&key(&record.key_name, &record.ca_id))
        else {
            return Err(StoreError::NotFound(record.id()));
        };

        if stored.version != expected_version {
            return Err(StoreError::VersionMismatch(record.id()));
        }

        let version = expected_version + 1;
        *stored = CertificateRecord {
            version,
            ..record.clone()
        };
        *stored_issued = issued.clone();
        self.inner.cert_writes.fetch_add(1, Ordering::SeqCst);

        Ok(version)
    }

    async fn delete(&self, key_name: &str, ca_id: &str) -> StoreResult<()> {
        let mut certs = self.inner.certs.lock();

        match certs.remove(&key(key_name, ca_id)) {
            Some(_) => {
                self.inner.cert_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound(record_id(key_name, ca_id))),
        }
    }

    async fn get_certificate(
        &self,
        key_name: &str,
        ca_id: &str,
    ) -> StoreResult<Option<IssuedCertificate>> {
        let certs = self.inner.certs.lock();
        Ok(certs
            .get(&key(key_name, ca_id))
            .map(|(_, issued)| issued.clone()))
    }

    async fn list_due(
        &self,
        ca_id: &str,
        due_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<RenewalJob>> {
        let certs = self.inner.certs.lock();

        let mut due = certs
            .values()
            .map(|(record, _)| record)
            .filter(|record| record.ca_id == ca_id && record.next_renewal_time <= due_before)
            .map(|record| RenewalJob {
                key_name: record.key_name.clone(),
                next_renewal_time: record.next_renewal_time,
            })
            .collect::<Vec<_>>();

        due.sort_by(|a, b| {
            a.next_renewal_time
                .cmp(&b.next_renewal_time)
                .then_with(|| a.key_name.cmp(&b.key_name))
        });
        due.truncate(limit);

        Ok(due)
    }

    async fn list_expiring(
        &self,
        ca_id: &str,
        valid_end_before: OffsetDateTime,
        limit: usize,
    ) -> StoreResult<Vec<CertificateRecord>> {
        let certs = self.inner.certs.lock();

        let mut expiring = certs
            .values()
            .map(|(record, _)| record)
            .filter(|record| record.ca_id == ca_id && record.valid_end_time <= valid_end_before)
            .cloned()
            .collect::<Vec<_>>();

        expiring.sort_by(|a, b| {
            a.valid_end_time
                .cmp(&b.valid_end_time)
                .then_with(|| a.key_name.cmp(&b.key_name))
        });
        expiring.truncate(limit);

        Ok(expiring)
    }

    async fn count_by_acme_user(&self, ca_id: &str, acme_user: &str) -> StoreResult<usize> {
        let certs = self.inner.certs.lock();
        Ok(certs
            .values()
            .filter(|(record, _)| record.ca_id == ca_id && record.acme_user == acme_user)
            .count())
    }
}

#[async_trait]
impl AcmeUserSession for MemorySession {
    async fn get_by_id(&self, user_id: &str, ca_id: &str) -> StoreResult<Option<StoredAccount>> {
        Ok(self
            .inner
            .accounts
            .lock()
            .get(&key(user_id, ca_id))
            .cloned())
    }

    async fn put(&self, account: &StoredAccount) -> StoreResult<()> {
        let mut accounts = self.inner.accounts.lock();
        let id = key(&account.user_id, &account.ca_id);

        if accounts.contains_key(&id) {
            return Err(StoreError::AlreadyExists(record_id(
                &account.user_id,
                &account.ca_id,
            )));
        }

        accounts.insert(id, account.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str, ca_id: &str) -> StoreResult<()> {
        match self.inner.accounts.lock().remove(&key(user_id, ca_id)) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(record_id(user_id, ca_id))),
        }
    }
}
