//! Programmer-error reporting.
//!
//! Structural misuse of the framework (re-rendering an active control, a
//! runaway change cycle, a missing element) is not a runtime condition to
//! retry. [`Contracts::report`] logs the violation and then either halts the
//! program or hands the violation back to the caller as an `Err`, depending on
//! [`RuntimeConfig::halt_on_contract_violation`](crate::RuntimeConfig).

use crate::logging::targets;

/// A structural contract that was broken by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// `render_html` was called on an active control.
    #[error("control `{control}` was re-rendered while active; deactivate it first")]
    RenderWhileActive {
        /// Id of the offending control.
        control: String,
    },
    /// `activate` was called on a disposed control.
    #[error("control `{control}` was activated after being disposed")]
    ActivateDisposed {
        /// Id of the offending control.
        control: String,
    },
    /// The control's root element was not in the document at activation.
    #[error("element `{element}` for control `{control}` was not found upon activation")]
    MissingElement {
        /// Id of the offending control.
        control: String,
        /// The element id that was looked up.
        element: String,
    },
    /// A template sub-element was not in the document at activation.
    #[error("sub element `{element}` of control `{control}` was referenced by the template but not found")]
    MissingSubElement {
        /// Id of the offending control.
        control: String,
        /// The element id that was looked up.
        element: String,
    },
    /// The change loop was still dirty after the cycle ceiling.
    #[error("control `{control}` got into a redundant update cycle ({cycles} cycles)")]
    RedundantUpdateCycle {
        /// Id of the offending control.
        control: String,
        /// The ceiling that was hit.
        cycles: usize,
    },
    /// A keyed lookup was attempted with an item that has no key.
    #[error("item set lookup requires a keyed item")]
    MissingKey,
    /// `clear` left materialized items behind.
    #[error("item set materialized count was {count} after a clear")]
    MaterializedCountMismatch {
        /// The count that remained.
        count: usize,
    },
    /// An index was outside the collection.
    #[error("index {index} is out of range for a collection of {len}")]
    IndexOutOfRange {
        /// The index that was used.
        index: usize,
        /// The collection length.
        len: usize,
    },
}

/// Assertion sink applying the configured halt policy.
#[derive(Debug, Clone, Copy)]
pub struct Contracts {
    halt: bool,
}

impl Contracts {
    /// Create a sink. With `halt` set, violations panic after logging.
    pub fn new(halt: bool) -> Self {
        Self { halt }
    }

    /// Whether violations halt the program.
    pub fn halts(&self) -> bool {
        self.halt
    }

    /// Log `violation` and apply the halt policy.
    ///
    /// # Panics
    ///
    /// Panics with the violation's message when the sink halts.
    #[track_caller]
    pub fn report(&self, violation: ContractViolation) -> Result<(), ContractViolation> {
        tracing::error!(target: targets::CONTRACT, %violation, "contract violation");
        if self.halt {
            panic!("{violation}");
        }
        Err(violation)
    }

    /// Report `violation` unless `condition` holds.
    #[track_caller]
    pub fn check(
        &self,
        condition: bool,
        violation: impl FnOnce() -> ContractViolation,
    ) -> Result<(), ContractViolation> {
        if condition {
            Ok(())
        } else {
            self.report(violation())
        }
    }
}

impl Default for Contracts {
    fn default() -> Self {
        Self::new(cfg!(debug_assertions))
    }
}
