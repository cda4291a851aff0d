use std::collections::HashMap;
use std::sync::RwLock;

use worklib::types::JobId;

/// The distinguished principal allowed to act on any job.
const ADMIN_PRINCIPAL: &str = "admin@example.com";

/// Records which principal submitted each job and answers access checks.
///
/// Entries are never removed; like the job registry, ownership lives for the
/// lifetime of the process.
pub struct Authorizer {
    owners: RwLock<HashMap<JobId, String>>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Binds a freshly submitted job to its owner. Called exactly once per
    /// job, before the id is handed back to the submitting client.
    pub fn record_owner(&self, job_id: JobId, principal: &str) {
        self.owners
            .write()
            .unwrap()
            .insert(job_id, principal.to_string());
    }

    /// A caller may act on a job when it owns the job or is the
    /// administrative principal. Unknown jobs are unauthorized for everyone
    /// else, which keeps "does not exist" and "not yours" indistinguishable.
    pub fn is_authorized(&self, principal: &str, job_id: JobId) -> bool {
        if principal == ADMIN_PRINCIPAL {
            return true;
        }
        match self.owners.read().unwrap().get(&job_id) {
            Some(owner) => owner == principal,
            None => false,
        }
    }
}
