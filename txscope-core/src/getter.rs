//! Read-only access to the ambient transaction

use crate::carrier;
use crate::context::Context;
use crate::error::DbError;
use crate::tx::Tx;

/// Looks up the transaction a `TxManager` attached to a context.
///
/// The returned handle borrows the context, so repositories cannot keep it
/// beyond the call that obtained it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxGetter;

impl TxGetter {
    pub fn new() -> Self {
        Self
    }

    /// The active transaction, or `None` outside any unit of work
    pub fn get_tx<'c>(&self, ctx: &'c Context) -> Option<&'c dyn Tx> {
        carrier::lookup(ctx).map(|active| active.tx())
    }

    /// Like `get_tx`, but absence is `DbError::NoTransaction`.
    ///
    /// For repository operations that must never run unguarded.
    pub fn require_tx<'c>(&self, ctx: &'c Context) -> Result<&'c dyn Tx, DbError> {
        self.get_tx(ctx).ok_or(DbError::NoTransaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_on_fresh_context() {
        let getter = TxGetter::new();
        let ctx = Context::background();
        assert!(getter.get_tx(&ctx).is_none());
        assert!(matches!(getter.require_tx(&ctx), Err(DbError::NoTransaction)));
    }
}
