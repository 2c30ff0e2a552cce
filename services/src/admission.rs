//! Request admission at the edge.
//!
//! Two IP-keyed gates run before any service logic: a cheap global limiter
//! on every request, and a stricter one on account registration. Only the
//! gate is in scope here; what happens after admission belongs to the
//! identity service.

use ripple_runtime::{RateAdmissionController, RateDecision, RateLimitPolicy};

/// IP-keyed admission for incoming requests.
#[derive(Clone)]
pub struct AdmissionGate {
    limiter: RateAdmissionController,
    global: RateLimitPolicy,
    registration: RateLimitPolicy,
}

impl AdmissionGate {
    /// Gate with the standard policies.
    #[must_use]
    pub const fn new(limiter: RateAdmissionController) -> Self {
        Self::with_policies(limiter, RateLimitPolicy::GLOBAL_PER_IP, RateLimitPolicy::REGISTRATION_PER_IP)
    }

    /// Gate with custom policies.
    #[must_use]
    pub const fn with_policies(
        limiter: RateAdmissionController,
        global: RateLimitPolicy,
        registration: RateLimitPolicy,
    ) -> Self {
        Self {
            limiter,
            global,
            registration,
        }
    }

    /// Admit any request from `client_ip`. Fails open if the store is down.
    pub async fn admit_request(&self, client_ip: &str) -> RateDecision {
        self.limiter.check(&self.global, client_ip, 1).await
    }

    /// Admit a registration attempt from `client_ip`.
    ///
    /// The request must also pass [`AdmissionGate::admit_request`]. Fails
    /// closed if the store is down.
    pub async fn admit_registration(&self, client_ip: &str) -> bool {
        self.admit_request(client_ip).await.allowed
            && self.limiter.try_consume(&self.registration, client_ip, 1).await
    }
}
