//! Ambient transaction slot on a `Context`
//!
//! The key type is private to this module: nothing outside the crate can
//! read or overwrite the carried transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::{Context, ContextKey};
use crate::tx::{Tx, TxSettings};

struct ActiveTxKey;

impl ContextKey for ActiveTxKey {
    type Value = ActiveTx;
}

/// The transaction carried by a context, shared by the manager and repositories
#[derive(Clone)]
pub(crate) struct ActiveTx {
    tx: Arc<dyn Tx>,
    /// Address of the `Database` that began `tx`
    owner: usize,
    settings: TxSettings,
    rollback_only: Arc<AtomicBool>,
}

impl ActiveTx {
    pub(crate) fn new(tx: Arc<dyn Tx>, owner: usize, settings: TxSettings) -> Self {
        Self {
            tx,
            owner,
            settings,
            rollback_only: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn tx(&self) -> &dyn Tx {
        self.tx.as_ref()
    }

    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    pub(crate) fn settings(&self) -> TxSettings {
        self.settings
    }

    pub(crate) fn rollback_only_flag(&self) -> Arc<AtomicBool> {
        self.rollback_only.clone()
    }

    pub(crate) fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn attach(ctx: &Context, entry: ActiveTx) -> Context {
    ctx.with_value::<ActiveTxKey>(entry)
}

pub(crate) fn lookup(ctx: &Context) -> Option<&ActiveTx> {
    ctx.value::<ActiveTxKey>()
}

/// Innermost carried transaction begun on the database identified by `owner`
pub(crate) fn lookup_owned(ctx: &Context, owner: usize) -> Option<&ActiveTx> {
    ctx.values::<ActiveTxKey>().find(|entry| entry.owner == owner)
}
