use common::ErrorKind;
use regex::RegexSet;

use crate::{HandlerError, Result};

/// Fallback patterns for messages that describe a permanent failure.
pub const DEFAULT_NON_RETRIABLE: &[&str] = &[
    r"(?i)validation",
    r"(?i)invalid",
    r"(?i)malformed",
    r"(?i)\bformat\b",
    r"(?i)business rule",
    r"(?i)insufficient",
    r"(?i)declined",
];

/// Fallback patterns for messages that describe a temporary failure.
pub const DEFAULT_RETRIABLE: &[&str] = &[
    r"(?i)network",
    r"(?i)time(d)?\s?out",
    r"(?i)connection",
    r"(?i)unavailable",
    r"(?i)temporar(y|ily)",
];

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    DeadLetter,
}

/// Maps handler errors to a [`Disposition`].
///
/// Typed kinds decide directly. Unclassified errors are matched against
/// the message patterns, retriable first; anything unmatched is retried.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    non_retriable: RegexSet,
    retriable: RegexSet,
}

impl ErrorClassifier {
    pub fn new<I, J, S, T>(non_retriable: I, retriable: J) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Ok(Self {
            non_retriable: RegexSet::new(non_retriable)?,
            retriable: RegexSet::new(retriable)?,
        })
    }

    pub fn classify(&self, error: &HandlerError) -> Disposition {
        match error.kind {
            ErrorKind::Validation | ErrorKind::Business => Disposition::DeadLetter,
            ErrorKind::Conflict | ErrorKind::Transient => Disposition::Retry,
            ErrorKind::Unclassified => self.classify_message(&error.message),
        }
    }

    fn classify_message(&self, message: &str) -> Disposition {
        if self.retriable.is_match(message) {
            return Disposition::Retry;
        }
        if self.non_retriable.is_match(message) {
            tracing::debug!(message, "unclassified error matched a non-retriable pattern");
            return Disposition::DeadLetter;
        }
        Disposition::Retry
    }
}

impl Default for ErrorClassifier {
    /// The built-in patterns. Should they fail to compile, every
    /// unclassified error is retried and the failure is logged.
    fn default() -> Self {
        Self::new(DEFAULT_NON_RETRIABLE, DEFAULT_RETRIABLE).unwrap_or_else(|e| {
            tracing::error!(error = %e, "built-in error patterns failed to compile");
            Self {
                non_retriable: RegexSet::empty(),
                retriable: RegexSet::empty(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_kinds_decide_without_patterns() {
        let classifier = ErrorClassifier::default();

        assert_eq!(
            classifier.classify(&HandlerError::validation("connection reset")),
            Disposition::DeadLetter
        );
        assert_eq!(
            classifier.classify(&HandlerError::business("out of stock")),
            Disposition::DeadLetter
        );
        assert_eq!(
            classifier.classify(&HandlerError::transient("invalid state")),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(&HandlerError::conflict("write conflict")),
            Disposition::Retry
        );
    }

    #[test]
    fn unclassified_errors_use_patterns() {
        let classifier = ErrorClassifier::default();

        assert_eq!(
            classifier.classify(&HandlerError::unclassified("Invalid order payload")),
            Disposition::DeadLetter
        );
        assert_eq!(
            classifier.classify(&HandlerError::unclassified("Payment DECLINED by issuer")),
            Disposition::DeadLetter
        );
        assert_eq!(
            classifier.classify(&HandlerError::unclassified("connection refused")),
            Disposition::Retry
        );
        assert_eq!(
            classifier.classify(&HandlerError::unclassified("request timed out")),
            Disposition::Retry
        );
    }

    #[test]
    fn unmatched_unclassified_errors_are_retried() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify(&HandlerError::unclassified("something odd happened")),
            Disposition::Retry
        );
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let classifier = ErrorClassifier::new([r"^E4\d\d"], [r"^E5\d\d"]).unwrap();

        assert_eq!(
            classifier.classify(&HandlerError::unclassified("E404 missing")),
            Disposition::DeadLetter
        );
        assert_eq!(
            classifier.classify(&HandlerError::unclassified("invalid input")),
            Disposition::Retry
        );
    }

    #[test]
    fn built_in_patterns_compile() {
        let classifier = ErrorClassifier::new(DEFAULT_NON_RETRIABLE, DEFAULT_RETRIABLE).unwrap();
        assert_eq!(classifier.non_retriable.len(), DEFAULT_NON_RETRIABLE.len());
        assert_eq!(classifier.retriable.len(), DEFAULT_RETRIABLE.len());

        let default = ErrorClassifier::default();
        assert_eq!(default.non_retriable.len(), DEFAULT_NON_RETRIABLE.len());
        assert_eq!(default.retriable.len(), DEFAULT_RETRIABLE.len());
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(ErrorClassifier::new(["("], Vec::<&str>::new()).is_err());
    }
}
