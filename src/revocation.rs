use std::collections::HashSet;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use num_bigint::BigUint;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::authority::{AuthoritySelector, lifetime_end};
use crate::config::PkiConfig;
use crate::crl::{RevocationList, RevokedCert, X509CrlBuilder, der_to_pem};
use crate::error::{PkiError, Result, StoreError};
use crate::store::{CrlStore, KeyStorage};

const MAX_CRL_WRITE_ATTEMPTS: usize = 8;

/// Maintains the single signed CRL.
///
/// Every update is a full read, re-sign and write of the list. Updates from one
/// engine are serialized by a lock; updates from other engines sharing the same
/// store are detected through [`CrlStore::compare_and_put`] and replayed.
pub struct RevocationEngine {
    storage: Arc<dyn KeyStorage>,
    crl_store: Arc<dyn CrlStore>,
    selector: Arc<dyn AuthoritySelector>,
    config: Arc<PkiConfig>,
    lock: Mutex<()>,
}

impl RevocationEngine {
    pub fn new(
        storage: Arc<dyn KeyStorage>,
        crl_store: Arc<dyn CrlStore>,
        selector: Arc<dyn AuthoritySelector>,
        config: Arc<PkiConfig>,
    ) -> Self {
        Self {
            storage,
            crl_store,
            selector,
            config,
            lock: Mutex::new(()),
        }
    }

    /// The current CRL; `NotFound` if none was ever issued.
    pub fn get_crl(&self) -> Result<RevocationList> {
        let pem = self
            .crl_store
            .get()
            .map_err(|e| PkiError::storage("fetching CRL", e))?;
        debug!(bytes = pem.len(), "loaded CRL");
        RevocationList::from_pem(&pem)
    }

    /// Adds `serial` to the CRL and re-signs it with the highest-serial authority.
    /// Revoking an already revoked serial leaves a single entry for it.
    pub fn revoke_one(&self, serial: &BigUint) -> Result<()> {
        let _guard = self.lock.lock();
        for attempt in 1..=MAX_CRL_WRITE_ATTEMPTS {
            match self.try_revoke(serial) {
                Err(PkiError::Storage {
                    source: StoreError::Conflict,
                    ..
                }) => {
                    debug!(%serial, attempt, "CRL changed underneath, retrying");
                }
                result => return result,
            }
        }
        Err(PkiError::Storage {
            context: "replacing CRL",
            source: StoreError::Conflict,
        })
    }

    fn try_revoke(&self, serial: &BigUint) -> Result<()> {
        let (previous_pem, previous) = match self.crl_store.get() {
            Ok(pem) => {
                let list = RevocationList::from_pem(&pem)?;
                (Some(pem), Some(list))
            }
            Err(StoreError::NotFound) => (None, None),
            Err(e) => return Err(PkiError::storage("fetching CRL", e)),
        };

        let authority = self
            .selector
            .crl_authority()
            .map_err(|e| e.authority_missing("fetching CA certs for signing CRL"))?;
        let (ca_key, ca_cert) = authority
            .decode()
            .map_err(|e| PkiError::corrupt_authority("decoding CA for signing CRL", e))?;

        let now = Utc::now().trunc_subsecs(0);
        let mut entries = previous
            .as_ref()
            .map(|list| list.entries().to_vec())
            .unwrap_or_default();
        entries.push(RevokedCert::new(serial.clone(), now));
        let entries = dedup_by_serial(entries);
        let crl_number = previous
            .as_ref()
            .and_then(|list| list.crl_number())
            .map_or_else(|| BigUint::from(1u32), |n| n + 1u32);

        let next_update = lifetime_end(now, self.config.crl_lifetime_days, "CRL lifetime")?;
        let mut builder = X509CrlBuilder::new(&ca_cert, &ca_key);
        builder.set_update_times(now, next_update);
        builder.set_crl_number(crl_number.clone());
        let count = entries.len();
        builder.extend_revoked(entries);
        let der = builder
            .build_and_sign()
            .map_err(|e| PkiError::generation("signing CRL", e))?;

        self.crl_store
            .compare_and_put(previous_pem.as_deref(), der_to_pem(&der))
            .map_err(|e| PkiError::storage("replacing CRL", e))?;

        info!(
            %serial,
            crl_number = %crl_number,
            entries = count,
            authority = %authority.serial(),
            "revoked certificate"
        );
        Ok(())
    }

    /// Revokes every pair ever issued for `common_name`.
    ///
    /// Stops at the first failure; serials revoked before it stay revoked.
    pub fn revoke_all_by_cn(&self, common_name: &str) -> Result<()> {
        let pairs = self
            .storage
            .get_by_cn(common_name)
            .map_err(|e| PkiError::storage("fetching pairs for revoke", e))?;
        for pair in &pairs {
            if let Err(e) = self.revoke_one(pair.serial()) {
                warn!(common_name, serial = %pair.serial(), error = %e, "revoke by common name aborted");
                return Err(e);
            }
        }
        info!(common_name, count = pairs.len(), "revoked all certificates for common name");
        Ok(())
    }

    /// Whether `serial` is on the current CRL.
    ///
    /// A missing CRL means nothing is revoked. Other failures are logged and
    /// reported as `false`; use [`RevocationEngine::try_is_revoked`] to see them.
    pub fn is_revoked(&self, serial: &BigUint) -> bool {
        match self.try_is_revoked(serial) {
            Ok(revoked) => revoked,
            Err(e) => {
                warn!(%serial, error = %e, "could not read CRL, treating serial as not revoked");
                false
            }
        }
    }

    pub fn try_is_revoked(&self, serial: &BigUint) -> Result<bool> {
        match self.get_crl() {
            Ok(list) => Ok(list.contains(serial)),
            Err(PkiError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Serials on the current CRL, empty if there is none.
    pub fn revoked_serials(&self) -> Result<Vec<BigUint>> {
        match self.get_crl() {
            Ok(list) => Ok(list.entries().iter().map(|e| e.serial().clone()).collect()),
            Err(PkiError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

/// Keeps the first entry for each serial.
fn dedup_by_serial(entries: Vec<RevokedCert>) -> Vec<RevokedCert> {
    let mut seen = HashSet::with_capacity(entries.len());
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.serial().clone()))
        .collect()
}
