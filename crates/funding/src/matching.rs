//! Investment matching engine
//!
//! Allocates funds between one newly created fundable (the subject) and the
//! open entities of the opposite kind, oldest first.
//!
//! PROPERTIES:
//! 1. Deterministic (same counterparts and balances in, same result out)
//! 2. Pure (mutates only the values handed to it, no I/O)
//! 3. First-come-first-served (counterparts are consumed in the given order)
//! 4. Conservative (every unit added to the subject is added to a counterpart)

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Allocation, Fundable};

/// Outcome of one matching run
#[derive(Debug, Clone)]
pub struct MatchResult<C> {
    /// Counterparts that received a nonzero transfer, in allocation order
    pub touched: Vec<C>,
    /// One audit record per transfer
    pub allocations: Vec<Allocation>,
}

impl<C> MatchResult<C> {
    /// Nothing was transferred
    pub fn is_noop(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Sum of all transfers in this run
    pub fn total_transferred(&self) -> u64 {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// Match `subject` against `open_counterparts`
///
/// Counterparts must be ordered oldest first and be of the opposite kind.
/// Counterparts that end up untouched are dropped from the result and must
/// not be written back.
pub fn run_matching<S, C>(
    subject: &mut S,
    open_counterparts: Vec<C>,
    now: DateTime<Utc>,
) -> MatchResult<C>
where
    S: Fundable,
    C: Fundable,
{
    let mut touched = Vec::new();
    let mut allocations = Vec::new();

    for mut counterpart in open_counterparts {
        if !subject.is_open() || subject.remaining() == 0 {
            break;
        }
        debug_assert_eq!(counterpart.kind(), subject.kind().counterpart());

        let transfer = subject.remaining().min(counterpart.remaining());
        if transfer == 0 {
            continue;
        }

        subject.add_invested(transfer);
        counterpart.add_invested(transfer);

        if counterpart.remaining() == 0 {
            counterpart.close(now);
        }
        if subject.remaining() == 0 {
            subject.close(now);
        }

        debug!(
            subject_kind = %subject.kind(),
            subject_id = subject.id(),
            counterpart_id = counterpart.id(),
            transfer,
            counterpart_closed = !counterpart.is_open(),
            "Allocated funds"
        );

        allocations.push(Allocation::between(
            subject.kind(),
            subject.id(),
            counterpart.id(),
            transfer,
            now,
        ));
        touched.push(counterpart);
    }

    MatchResult {
        touched,
        allocations,
    }
}
