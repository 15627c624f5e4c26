use crate::errors::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

const DEFAULT_SCHEMA: &str = "jobstore";
const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_INVISIBILITY_TIMEOUT_MINUTES: i64 = 30;

/// Immutable configuration for the storage primitives.
///
/// Constructed once and shared; this crate performs no environment or file
/// access of its own.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    schema: String,
    queue_poll_interval: Duration,
    invisibility_timeout: TimeDelta,
    utc_offset: TimeDelta,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_owned(),
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
            invisibility_timeout: TimeDelta::minutes(DEFAULT_INVISIBILITY_TIMEOUT_MINUTES),
            utc_offset: TimeDelta::zero(),
        }
    }
}

impl StorageOptions {
    /// Create options with the default schema namespace, a 15 second queue
    /// poll interval and a 30 minute invisibility timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schema namespace all tables live in.
    ///
    /// The name must be a plain identifier (letters, digits and underscores,
    /// not starting with a digit); it is interpolated into SQL as a quoted
    /// identifier.
    pub fn schema(mut self, schema: &str) -> Result<Self> {
        if !is_valid_identifier(schema) {
            return Err(Error::InvalidArgument(
                "schema name must be a non-empty identifier",
            ));
        }
        self.schema = schema.to_owned();
        Ok(self)
    }

    /// Set how long a dequeuer sleeps when no fetchable entry was found.
    pub fn queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    /// Set the duration after which a claimed-but-unacknowledged queue entry
    /// becomes eligible for reclaiming by another dequeuer.
    pub fn invisibility_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.invisibility_timeout = TimeDelta::from_std(timeout)
            .map_err(|_| Error::InvalidArgument("invisibility timeout is out of range"))?;
        Ok(self)
    }

    /// Set a clock correction applied to every timestamp this crate computes.
    pub fn utc_offset(mut self, offset: TimeDelta) -> Self {
        self.utc_offset = offset;
        self
    }

    /// The configured schema namespace.
    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.queue_poll_interval
    }

    /// Fully qualified, quoted table reference for SQL interpolation.
    pub(crate) fn table(&self, name: &str) -> String {
        format!(r#""{}"."{}""#, self.schema, name)
    }

    /// Current time with the configured clock correction applied.
    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.utc_offset
    }

    /// Entries claimed before this instant are considered abandoned.
    pub(crate) fn invisibility_threshold(&self) -> DateTime<Utc> {
        self.now() - self.invisibility_timeout
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn schema_names_are_validated() {
        assert_ok!(StorageOptions::new().schema("hangfire_v2"));
        assert_ok!(StorageOptions::new().schema("_private"));
        assert_err!(StorageOptions::new().schema(""));
        assert_err!(StorageOptions::new().schema("1abc"));
        assert_err!(StorageOptions::new().schema(r#"x"; DROP TABLE jobs; --"#));
    }

    #[test]
    fn table_references_are_quoted() {
        let options = StorageOptions::new();
        assert_eq!(options.table("jobqueue"), r#""jobstore"."jobqueue""#);
    }

    #[test]
    fn invisibility_threshold_respects_offset() {
        let options = StorageOptions::new().utc_offset(TimeDelta::hours(-2));
        let threshold = options.invisibility_threshold();
        let expected = Utc::now() - TimeDelta::hours(2) - TimeDelta::minutes(30);
        assert!((threshold - expected).abs() < TimeDelta::seconds(5));
    }
}
