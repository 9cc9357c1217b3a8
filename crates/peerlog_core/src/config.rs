//! Configuration for databases and queries.

use std::time::Duration;

/// Default timeout for fetching one remote entry.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Timeout for fetching a single entry during a sync round.
    ///
    /// `None` waits until the database is closed.
    pub fetch_timeout: Option<Duration>,
    /// Publish the current heads whenever a peer joins the topic.
    pub announce_on_join: bool,
    /// Publish the new heads after every local append.
    pub announce_on_append: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            announce_on_join: true,
            announce_on_append: true,
        }
    }
}

impl DatabaseConfig {
    /// Sets the per-entry fetch timeout.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Disables the per-entry fetch timeout.
    #[must_use]
    pub fn without_fetch_timeout(mut self) -> Self {
        self.fetch_timeout = None;
        self
    }

    /// Sets whether heads are announced when a peer joins.
    #[must_use]
    pub fn with_announce_on_join(mut self, announce: bool) -> Self {
        self.announce_on_join = announce;
        self
    }

    /// Sets whether heads are announced after local appends.
    #[must_use]
    pub fn with_announce_on_append(mut self, announce: bool) -> Self {
        self.announce_on_append = announce;
        self
    }
}

/// Options for database iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Maximum number of entries to yield. `None` yields everything.
    pub amount: Option<usize>,
}

impl QueryOptions {
    /// Creates options that yield every entry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of yielded entries.
    #[must_use]
    pub fn amount(mut self, amount: usize) -> Self {
        self.amount = Some(amount);
        self
    }
}
