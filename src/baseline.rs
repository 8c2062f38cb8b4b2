//! Baseline profiles: generation, lookup and atomic promotion.
//!
//! At most one profile per site is ACTIVE at any time. The store enforces this
//! inside one exclusive transaction per promotion; this module only maps the
//! store's answers to typed errors.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::fingerprint::digest_hex;
use crate::models::{now_millis, BaselineEntry, BaselineProfile, BaselineStatus, PageVersion};
use crate::store::{BaselineStore, StoreError};

#[derive(Error, Debug)]
pub enum BaselineError {
    /// Bad input: the baseline does not exist or belongs to another site.
    #[error("baseline {baseline_id} not found for site {site_id}")]
    NotFound { site_id: u64, baseline_id: String },

    /// Infrastructure broke; the transaction was rolled back.
    #[error("baseline store failure: {0}")]
    Store(#[from] StoreError),
}

pub struct BaselineManager {
    store: Arc<dyn BaselineStore>,
}

impl BaselineManager {
    pub fn new(store: Arc<dyn BaselineStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, profile: &BaselineProfile) -> Result<(), BaselineError> {
        self.store.save_baseline(profile)?;
        info!(
            site_id = profile.site_id,
            baseline_id = %profile.id,
            pages = profile.pages.len(),
            "baseline saved"
        );
        Ok(())
    }

    pub fn get_active(&self, site_id: u64) -> Result<Option<BaselineProfile>, BaselineError> {
        Ok(self.store.active_baseline(site_id)?)
    }

    /// The active baseline's page for `normalized_url`, if there is one.
    pub fn lookup(&self, site_id: u64, normalized_url: &str) -> Result<Option<BaselineEntry>, BaselineError> {
        let Some(profile) = self.store.active_baseline(site_id)? else {
            return Ok(None);
        };

        Ok(profile.page(normalized_url).map(|page| BaselineEntry {
            baseline_id: profile.id.clone(),
            site_id,
            page: page.clone(),
        }))
    }

    /// Make `baseline_id` the only active baseline for the site. Idempotent.
    pub fn promote(&self, site_id: u64, baseline_id: &str) -> Result<(), BaselineError> {
        match self.store.promote(site_id, baseline_id) {
            Ok(true) => {
                info!(site_id, baseline_id, "baseline promoted");
                Ok(())
            }
            Ok(false) => {
                warn!(site_id, baseline_id, "promotion target not found");
                Err(BaselineError::NotFound {
                    site_id,
                    baseline_id: baseline_id.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(site_id, baseline_id, error = %e, "promotion rolled back");
                Err(BaselineError::Store(e))
            }
        }
    }

    /// Profile history for a site, oldest first.
    pub fn history(&self, site_id: u64) -> Result<Vec<BaselineProfile>, BaselineError> {
        Ok(self.store.baselines_for_site(site_id)?)
    }
}

/// Collects page fingerprints during a baseline crawl. Shared by all workers.
pub struct BaselineBuilder {
    site_id: u64,
    root_url: String,
    extraction_version: String,
    pages: Mutex<BTreeMap<String, PageVersion>>,
}

impl BaselineBuilder {
    pub fn new(site_id: u64, root_url: impl Into<String>, extraction_version: impl Into<String>) -> Self {
        Self {
            site_id,
            root_url: root_url.into(),
            extraction_version: extraction_version.into(),
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn site_id(&self) -> u64 {
        self.site_id
    }

    pub fn extraction_version(&self) -> &str {
        &self.extraction_version
    }

    /// Record a page; the first fingerprint seen for a URL wins.
    pub fn add(&self, page: PageVersion) -> bool {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.normalized_url) {
            return false;
        }
        pages.insert(page.normalized_url.clone(), page);
        true
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Snapshot the collected pages into an INACTIVE profile.
    ///
    /// The id is derived from the site, the extraction version and the page
    /// identities, so rebuilding from the same pages yields the same id.
    pub fn build(&self) -> BaselineProfile {
        let pages = self.pages.lock().clone();
        let site = self.site_id.to_string();
        let identities: Vec<&str> = pages.values().map(|p| p.identity.as_str()).collect();
        let joined = identities.join(",");
        let id = digest_hex(&[&site, &self.extraction_version, &joined]);

        BaselineProfile {
            id,
            site_id: self.site_id,
            root_url: self.root_url.clone(),
            extraction_version: self.extraction_version.clone(),
            created_at: now_millis(),
            status: BaselineStatus::Inactive,
            pages,
        }
    }
}
