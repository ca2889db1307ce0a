//! Routing rules: an ordered selector list, shared storage descriptors,
//! and the obsolete-flagging merge used for hot reconfiguration.
//!
//! Rules are shared as `Arc<Rule>` by the table, by every route bound to
//! them, and by every routed client. A rule superseded by a reconfigure
//! is flagged obsolete and dropped from the table; its `Arc` lives on in
//! routes and clients until they drain, at which point the rule is freed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use pgrelay_core::{RuleConfig, StorageConfig};

/// An upstream database endpoint.
///
/// Shared by reference inside a rule; `clone` produces an independent
/// copy so a cancel request can outlive a reconfigure that drops the
/// rule holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Storage {
    fn from_config(config: &StorageConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
        }
    }
}

/// A routing rule: selector, upstream, and the pool limits applied to
/// clients landing on it.
#[derive(Debug)]
pub struct Rule {
    /// Database selector; `"*"` matches any.
    pub database: String,
    /// User selector; `"*"` matches any.
    pub user: String,
    pub storage: Arc<Storage>,
    /// Override the database name used for the backend pool, so several
    /// client `(database, user)` tuples share one route.
    pub storage_db: Option<String>,
    /// Override the user name used for the backend pool.
    pub storage_user: Option<String>,
    /// Cap on concurrent backend servers; `0` means always open a new
    /// connection and never wait.
    pub pool_size: u32,
    /// Idle server TTL in seconds; `0` disables expiry.
    pub pool_ttl: u64,
    /// Per-route client admission cap. `None` disables the cap.
    pub client_max: Option<u32>,
    obsolete: AtomicBool,
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Arc<Self> {
        Arc::new(Self {
            database: config.database.clone(),
            user: config.user.clone(),
            storage: Arc::new(Storage::from_config(&config.storage)),
            storage_db: config.storage_db.clone(),
            storage_user: config.storage_user.clone(),
            pool_size: config.pool_size,
            pool_ttl: config.pool_ttl,
            client_max: config.client_max,
            obsolete: AtomicBool::new(false),
        })
    }

    fn matches(&self, database: &[u8], user: &[u8]) -> bool {
        (self.database == "*" || self.database.as_bytes() == database)
            && (self.user == "*" || self.user.as_bytes() == user)
    }

    /// Selector and every parameter equal — `merge` keeps the installed
    /// rule object so routes bound to it keep matching by identity.
    fn same(&self, other: &Rule) -> bool {
        self.database == other.database
            && self.user == other.user
            && *self.storage == *other.storage
            && self.storage_db == other.storage_db
            && self.storage_user == other.storage_user
            && self.pool_size == other.pool_size
            && self.pool_ttl == other.pool_ttl
            && self.client_max == other.client_max
    }

    /// Superseded by a reconfigure; routes still holding this rule must
    /// be drained.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Returns whether the flag actually flipped.
    pub(crate) fn set_obsolete(&self) -> bool {
        !self.obsolete.swap(true, Ordering::AcqRel)
    }

    /// Independent copy of the storage descriptor, for cancellation.
    pub fn storage_copy(&self) -> Storage {
        (*self.storage).clone()
    }
}

/// The installed rule set, in priority order. First match wins.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Vec<Arc<Rule>>,
}

impl RuleTable {
    pub fn from_config(configs: &[RuleConfig]) -> Self {
        Self {
            rules: configs.iter().map(Rule::from_config).collect(),
        }
    }

    /// Forward-match a startup `(database, user)` pair against the
    /// ordered rules. O(n); always called under the router lock.
    pub fn forward(&self, database: &[u8], user: &[u8]) -> Option<Arc<Rule>> {
        self.rules
            .iter()
            .find(|rule| rule.matches(database, user))
            .cloned()
    }

    /// Atomically replace the installed set with `new`.
    ///
    /// Installed rules with a parameter-identical counterpart in `new`
    /// survive by identity; the rest are flagged obsolete and dropped
    /// from the table. Returns the number of rules whose obsolescence
    /// state changed, the trigger for draining routes on reconfigure.
    pub fn merge(&mut self, new: RuleTable) -> usize {
        let old = std::mem::take(&mut self.rules);

        let mut installed = Vec::with_capacity(new.rules.len());
        for incoming in new.rules {
            match old.iter().find(|rule| rule.same(&incoming)) {
                Some(kept) => installed.push(Arc::clone(kept)),
                None => installed.push(incoming),
            }
        }

        let mut updates = 0;
        for rule in &old {
            let survives = installed.iter().any(|r| Arc::ptr_eq(r, rule));
            if !survives && rule.set_obsolete() {
                debug!(
                    database = %rule.database,
                    user = %rule.user,
                    "rule obsoleted by reconfigure"
                );
                updates += 1;
            }
        }

        self.rules = installed;
        updates
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
