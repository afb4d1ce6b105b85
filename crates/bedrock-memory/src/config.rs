//! Construction-time options shared by every allocator.

use crate::error::MemoryError;

/// What an allocator does when it detects damaged bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum IntegrityPolicy {
    /// Log the failure and panic with the rendered error.
    #[display("panic")]
    Panic,
    /// Log the failure and return it to the caller.
    #[display("report")]
    Report,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Report
        }
    }
}

impl IntegrityPolicy {
    /// Routes a detected failure according to the policy.
    ///
    /// Always logs at error level. Panics under [`IntegrityPolicy::Panic`],
    /// otherwise hands the error back so the caller can return it.
    #[track_caller]
    pub(crate) fn fail(self, allocator: &str, err: MemoryError) -> MemoryError {
        error!("{allocator}: {err} (raised at {})", err.location());
        match self {
            Self::Panic => panic!("{allocator}: integrity failure: {err}"),
            Self::Report => err,
        }
    }
}

/// Options accepted by every allocator's `with_config` constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub integrity: IntegrityPolicy,
    /// Record the caller's file and line in block headers where the layout has
    /// room for it.
    pub record_provenance: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integrity: IntegrityPolicy::default(),
            record_provenance: cfg!(debug_assertions),
        }
    }
}

impl Config {
    /// A configuration that reports integrity failures instead of panicking.
    #[must_use]
    pub fn reporting() -> Self {
        Self {
            integrity: IntegrityPolicy::Report,
            ..Self::default()
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Offset;

    #[test]
    fn test_report_returns_error() {
        let err = IntegrityPolicy::Report.fail("test", MemoryError::not_owned(Offset::new(8)));
        assert!(matches!(err, MemoryError::NotOwned { .. }));
    }

    #[test]
    #[should_panic(expected = "test: integrity failure")]
    fn test_panic_policy_panics() {
        let _ = IntegrityPolicy::Panic.fail("test", MemoryError::not_owned(Offset::new(8)));
    }

    #[test]
    fn test_reporting_config() {
        let config = Config::reporting();
        assert!(config.integrity.is_report());
        assert_eq!(config.integrity.to_string(), "report");
    }
}
