//! Configuration supplied to constructors.
//!
//! Nothing here is parsed from files or read from globals. Callers build these
//! values and hand them to [`Proposer::new`](crate::Proposer::new),
//! [`Learner::new`](crate::Learner::new) and
//! [`Backend::open`](crate::storage::Backend::open).

use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Proposer settings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposerConfig {
    /// Number of acceptors in the cluster
    pub acceptors: usize,
    /// Phase 1 quorum size
    pub q1: usize,
    /// Phase 2 quorum size
    pub q2: usize,
    /// Age after which an in-flight instance is retransmitted
    pub timeout: Duration,
    /// Maximum number of instances in flight at once
    pub preexec_window: usize,
    /// Maximum number of values waiting for an instance
    pub pending_capacity: usize,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            preexec_window: 128,
            pending_capacity: 5000,
            ..Self::majority(3)
        }
    }
}

impl ProposerConfig {
    /// Majority quorums for both phases over `acceptors` acceptors.
    #[must_use]
    pub fn majority(acceptors: usize) -> Self {
        let quorum = acceptors / 2 + 1;
        Self {
            acceptors,
            q1: quorum,
            q2: quorum,
            timeout: Duration::from_secs(1),
            preexec_window: 128,
            pending_capacity: 5000,
        }
    }

    /// Check the quorum sizes and limits.
    ///
    /// Phase 1 and phase 2 quorums must intersect: `q1 + q2 > acceptors`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.acceptors == 0 {
            return Err(Report::new(ConfigError).attach("acceptors must be at least 1"));
        }
        for (name, q) in [("q1", self.q1), ("q2", self.q2)] {
            if q == 0 || q > self.acceptors {
                return Err(Report::new(ConfigError).attach(format!(
                    "{name} = {q} must be in 1..={}",
                    self.acceptors
                )));
            }
        }
        if self.q1 + self.q2 <= self.acceptors {
            return Err(Report::new(ConfigError).attach(format!(
                "q1 ({}) + q2 ({}) must exceed the acceptor count ({})",
                self.q1, self.q2, self.acceptors
            )));
        }
        if self.preexec_window == 0 {
            return Err(Report::new(ConfigError).attach("preexec_window must be at least 1"));
        }
        if self.pending_capacity == 0 {
            return Err(Report::new(ConfigError).attach("pending_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Learner settings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LearnerConfig {
    pub acceptors: usize,
    /// Matching acks needed to close an instance
    pub quorum: usize,
    /// Number of instances tracked ahead of the delivery point
    pub instances: usize,
    /// Deliver from instance 1 (`true`) or from the first instance heard of
    pub catch_up: bool,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            acceptors: 3,
            quorum: 2,
            instances: 2048,
            catch_up: true,
        }
    }
}

impl LearnerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the quorum or window is out of range.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.quorum == 0 || self.quorum > self.acceptors {
            return Err(Report::new(ConfigError).attach(format!(
                "quorum = {} must be in 1..={}",
                self.quorum, self.acceptors
            )));
        }
        if self.instances == 0 {
            return Err(Report::new(ConfigError).attach("instances must be at least 1"));
        }
        Ok(())
    }
}

/// Which storage backend an acceptor uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StorageConfig {
    /// Volatile, lost on restart
    #[default]
    Memory,
    /// fjall database rooted at `path`
    Persistent { path: PathBuf },
}
