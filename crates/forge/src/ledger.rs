//! Bookkeeping shared by the in-memory cloud backends used for dry runs and
//! tests.
//!
//! A [`ResourceLedger`] hands out identifiers and addresses, remembers which
//! resources are alive, counts creations per kind and can be told to fail a
//! named operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail};

#[derive(Default)]
struct Inner {
    next_id: u64,
    next_host: u32,
    live: BTreeMap<String, String>,
    created: HashMap<String, usize>,
    polls: HashMap<String, u32>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct ResourceLedger {
    inner: Mutex<Inner>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("resource ledger poisoned"))
    }

    /// Makes every later call of `operation` fail until [`Self::heal`].
    pub fn fail(&self, operation: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing.insert(operation.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing.clear();
        }
    }

    /// Fails when `operation` has been marked failing.
    pub fn check(&self, operation: &str) -> anyhow::Result<()> {
        if self.lock()?.failing.contains(operation) {
            bail!("{} rejected by backend", operation);
        }
        Ok(())
    }

    /// Records a new resource of `kind` and returns its identifier.
    pub fn create(&self, kind: &str) -> anyhow::Result<String> {
        self.check(&format!("create {}", kind))?;
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = format!("{}-{:04}", kind, inner.next_id);
        inner.live.insert(id.clone(), kind.to_string());
        *inner.created.entry(kind.to_string()).or_default() += 1;
        Ok(id)
    }

    /// Forgets a resource. Deleting something unknown is an error, as it would
    /// be on a real backend.
    pub fn delete(&self, kind: &str, id: &str) -> anyhow::Result<()> {
        self.check(&format!("delete {}", kind))?;
        match self.lock()?.live.remove(id) {
            Some(_) => Ok(()),
            None => Err(anyhow!("{} {} not found", kind, id)),
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock()
            .map(|inner| inner.live.contains_key(id))
            .unwrap_or(false)
    }

    /// How many resources of `kind` were ever created.
    pub fn created(&self, kind: &str) -> usize {
        self.lock()
            .map(|inner| inner.created.get(kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// How many resources of `kind` are alive.
    pub fn live(&self, kind: &str) -> usize {
        self.lock()
            .map(|inner| inner.live.values().filter(|k| *k == kind).count())
            .unwrap_or(0)
    }

    /// Identifiers of every live resource.
    pub fn live_ids(&self) -> Vec<String> {
        self.lock()
            .map(|inner| inner.live.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Counts a status poll of `id` and returns how many polls it has had.
    pub fn poll(&self, id: &str) -> anyhow::Result<u32> {
        let mut inner = self.lock()?;
        if !inner.live.contains_key(id) {
            bail!("{} not found", id);
        }
        let polls = inner.polls.entry(id.to_string()).or_default();
        *polls += 1;
        Ok(*polls)
    }

    /// A fresh `(public, private)` address pair.
    pub fn allocate_addresses(&self) -> anyhow::Result<(String, String)> {
        let mut inner = self.lock()?;
        inner.next_host += 1;
        let n = inner.next_host;
        Ok((
            format!("203.0.113.{}", n % 250 + 1),
            format!("10.1.{}.{}", n / 250, n % 250 + 1),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tracks_creations_and_deletions() {
        let ledger = ResourceLedger::new();
        let a = ledger.create("network").unwrap();
        let b = ledger.create("network").unwrap();
        assert_ne!(a, b);
        assert_eq!(ledger.live("network"), 2);

        ledger.delete("network", &a).unwrap();
        assert!(ledger.delete("network", &a).is_err());
        assert_eq!(ledger.live("network"), 1);
        assert_eq!(ledger.created("network"), 2);
    }

    #[test]
    fn injected_failures_last_until_healed() {
        let ledger = ResourceLedger::new();
        ledger.fail("create firewall");
        assert!(ledger.create("firewall").is_err());
        assert!(ledger.create("network").is_ok());
        ledger.heal();
        assert!(ledger.create("firewall").is_ok());
    }
}
