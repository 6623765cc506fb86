use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of the admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    Admitted { correlation_id: String },
    Unauthorized,
    BadRequest,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Admission::Admitted { correlation_id } => Some(correlation_id),
            _ => None,
        }
    }

    /// The `(code, payload)` pair older HTTP handlers still expect.
    ///
    /// The codes do not follow HTTP semantics; "400" means admitted.
    pub fn legacy_status(&self) -> (&'static str, String) {
        match self {
            Admission::Admitted { correlation_id } => ("400", correlation_id.clone()),
            Admission::Unauthorized => ("404", "Unauthorized".to_string()),
            Admission::BadRequest => ("404", "Bad Request".to_string()),
        }
    }
}

/// Authorization policy consulted once identity and credential are present
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, submitter: &str, credential: &str) -> bool;
}

/// Accepts any caller that presents a credential
#[derive(Debug, Default, Clone, Copy)]
pub struct PresenceOnly;

impl Authorizer for PresenceOnly {
    fn authorize(&self, _submitter: &str, _credential: &str) -> bool {
        true
    }
}

impl<F> Authorizer for F
where
    F: Fn(&str, &str) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, submitter: &str, credential: &str) -> bool {
        self(submitter, credential)
    }
}

/// Synchronous admission gate run on the caller's thread before anything is queued
#[derive(Clone)]
pub struct WorkAcceptor {
    authorizer: Arc<dyn Authorizer>,
}

impl WorkAcceptor {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    pub fn submit_work(&self, submitter: Option<&str>, credential: Option<&str>) -> Admission {
        let submitter = match submitter.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s,
            None => {
                debug!("Rejecting work without submitter identity");
                return Admission::Unauthorized;
            }
        };
        let credential = match credential.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => c,
            None => {
                debug!(submitter, "Rejecting work without credential");
                return Admission::BadRequest;
            }
        };

        if !self.authorizer.authorize(submitter, credential) {
            warn!(submitter, "Authorizer denied work submission");
            return Admission::Unauthorized;
        }

        let correlation_id = cuid2::create_id();
        debug!(submitter, correlation_id = %correlation_id, "Work admitted");
        Admission::Admitted { correlation_id }
    }
}

impl Default for WorkAcceptor {
    fn default() -> Self {
        Self::new(Arc::new(PresenceOnly))
    }
}
