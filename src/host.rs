//! Everything the pipeline borrows from the application hosting it.

use crate::client::{HttpTransport, SubmissionClient};
use crate::clock::{Clock, SystemClock};
use crate::error::VerifactuResult;
use crate::ledger::StatusLedger;
use crate::policy::{JitterSource, RandomJitter};
use crate::sled_store::SledStore;
use crate::store::{
    AlwaysLicensed, ClusterLock, CredentialStore, FiscalRecordStore, LicenseGate, MarkerStore,
    TenantDirectory,
};
use crate::utils::new_uuid_to_bech32;
use std::sync::Arc;

#[derive(Clone)]
pub struct HostServices {
    pub records: Arc<dyn FiscalRecordStore>,
    pub ledger: StatusLedger,
    pub credentials: Arc<dyn CredentialStore>,
    pub lock: Arc<dyn ClusterLock>,
    pub markers: Arc<dyn MarkerStore>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub license: Arc<dyn LicenseGate>,
    pub client: Arc<SubmissionClient>,
    pub clock: Arc<dyn Clock>,
    pub jitter: Arc<dyn JitterSource>,
    /// identifies this process as a lock holder
    pub holder: String,
}

impl HostServices {
    /// Every store capability served by one sled database.
    pub fn from_sled(
        store: Arc<SledStore>,
        tenants: Arc<dyn TenantDirectory>,
        transport: Arc<dyn HttpTransport>,
    ) -> VerifactuResult<Self> {
        Ok(Self {
            records: store.clone(),
            ledger: StatusLedger::new(store.clone()),
            credentials: store.clone(),
            lock: store.clone(),
            markers: store,
            tenants,
            license: Arc::new(AlwaysLicensed),
            client: Arc::new(SubmissionClient::new(transport)),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter),
            holder: new_uuid_to_bech32("worker")?,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_license(mut self, license: Arc<dyn LicenseGate>) -> Self {
        self.license = license;
        self
    }

    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = holder.to_string();
        self
    }
}
