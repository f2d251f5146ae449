//! Admission control
//!
//! Token-bucket limiting keyed by (query class, identity). Buckets are
//! created on first use and pinned; they are cheap, so there is no sweep.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimitConfig;
use crate::{Error, Result};

type KeyedLimiter = GovernorLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Which upstream a request is about to query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    /// Scheduler operations (jobs, sandboxes, tools)
    SchedulerQuery,
    /// Directory ad lookups
    DirectoryQuery,
}

/// Per-identity admission control for both query classes
pub struct AdmissionController {
    enabled: bool,
    clock: DefaultClock,
    scheduler: KeyedLimiter,
    directory: KeyedLimiter,
}

fn quota(rate: u32, burst: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN))
}

impl AdmissionController {
    /// Create from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let clock = DefaultClock::default();
        Self {
            enabled: config.enabled,
            scheduler: GovernorLimiter::dashmap_with_clock(
                quota(config.scheduler_query_rate, config.scheduler_query_burst),
                clock.clone(),
            ),
            directory: GovernorLimiter::dashmap_with_clock(
                quota(config.directory_query_rate, config.directory_query_burst),
                clock.clone(),
            ),
            clock,
        }
    }

    /// Attempt admission for `identity` against the class bucket.
    ///
    /// Denials carry a retry hint in whole seconds, never zero.
    pub fn admit(&self, class: QueryClass, identity: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let limiter = match class {
            QueryClass::SchedulerQuery => &self.scheduler,
            QueryClass::DirectoryQuery => &self.directory,
        };
        match limiter.check_key(&identity.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(Error::RateLimited {
                    retry_after: wait.as_secs().max(1),
                })
            }
        }
    }
}
