//! Reactive layer: change notifications and query subscriptions.
//!
//! Every store write names the table it touched; subscriptions declare (by
//! inspection of their SQL) which tables they depend on. A write marks the
//! dependent subscriptions dirty, and the engine flushes the dirty set once
//! per tick, so a batch of writes coalesces into at most one re-evaluation
//! per subscription. Between writes the cached result is served.
//!
//! Callbacks never re-enter the store on the notification path; they only
//! receive the already-materialized rows.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use super::query::referenced_tables;
use super::{Rows, Store, TABLES};
use crate::errors::StoreError;

/// Handle to a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    sql: String,
    params: Vec<Value>,
    tables: Vec<&'static str>,
    last: Rc<Rows>,
    notify: Rc<dyn Fn(Rc<Rows>)>,
    skip: bool,
    dirty: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<SubscriptionId, Entry>,
    any_dirty: bool,
}

/// Subscription registry attached to a [`Store`].
pub struct Reactive {
    inner: RefCell<Inner>,
}

impl Reactive {
    pub(crate) fn new() -> Self {
        Self {
            inner: RefCell::new(Inner::default()),
        }
    }

    /// Register a subscription and evaluate it once. The `notify` callback
    /// fires on later flushes whenever the result set changed; it must not
    /// query the store synchronously.
    pub fn subscribe(
        &self,
        store: &Store,
        sql: &str,
        params: Vec<Value>,
        notify: Rc<dyn Fn(Rc<Rows>)>,
    ) -> Result<(SubscriptionId, Rc<Rows>), StoreError> {
        let initial = Rc::new(store.query_json(sql, &params)?);
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.entries.insert(
            id,
            Entry {
                sql: sql.to_string(),
                params,
                tables: referenced_tables(sql, &TABLES),
                last: Rc::clone(&initial),
                notify,
                skip: false,
                dirty: false,
            },
        );
        Ok((id, initial))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.borrow_mut().entries.remove(&id);
    }

    /// Disable or re-enable evaluation without unregistering. A skipped
    /// subscription keeps serving its cached result.
    pub fn set_skip(&self, id: SubscriptionId, skip: bool) {
        if let Some(entry) = self.inner.borrow_mut().entries.get_mut(&id) {
            entry.skip = skip;
        }
    }

    /// Cached result of a subscription.
    pub fn cached(&self, id: SubscriptionId) -> Option<Rc<Rows>> {
        self.inner
            .borrow()
            .entries
            .get(&id)
            .map(|e| Rc::clone(&e.last))
    }

    /// Mark every subscription that depends on `table` dirty.
    pub(crate) fn notify_write(&self, table: &'static str) {
        let mut inner = self.inner.borrow_mut();
        let mut any = false;
        for entry in inner.entries.values_mut() {
            if !entry.skip && entry.tables.contains(&table) {
                entry.dirty = true;
                any = true;
            }
        }
        if any {
            inner.any_dirty = true;
        }
    }

    pub fn has_dirty(&self) -> bool {
        self.inner.borrow().any_dirty
    }

    /// Re-evaluate every dirty subscription; invoke callbacks whose result
    /// changed. Evaluation errors surface to the caller, leaving the
    /// remaining dirty entries for the next flush.
    pub fn flush(&self, store: &Store) -> Result<usize, StoreError> {
        let dirty: Vec<(SubscriptionId, String, Vec<Value>)> = {
            let mut inner = self.inner.borrow_mut();
            inner.any_dirty = false;
            inner
                .entries
                .iter_mut()
                .filter(|(_, e)| e.dirty && !e.skip)
                .map(|(id, e)| {
                    e.dirty = false;
                    (*id, e.sql.clone(), e.params.clone())
                })
                .collect()
        };

        let mut fired = 0;
        for (id, sql, params) in dirty {
            let fresh = Rc::new(store.query_json(&sql, &params)?);
            // The entry may have been unsubscribed by an earlier callback in
            // this same flush; re-check under the borrow, then invoke the
            // callback outside it so callbacks may subscribe or unsubscribe.
            let notify = {
                let mut inner = self.inner.borrow_mut();
                match inner.entries.get_mut(&id) {
                    Some(entry) if *entry.last != *fresh => {
                        entry.last = Rc::clone(&fresh);
                        Some(Rc::clone(&entry.notify))
                    }
                    _ => None,
                }
            };
            if let Some(cb) = notify {
                cb(fresh);
                fired += 1;
            }
        }
        Ok(fired)
    }
}
