//! # Phonebooks
//!
//! Pluggable sources of candidate peer addresses for mesh maintenance.
//!
//! | Type | Source |
//! |------|--------|
//! | [`EmptyPhonebook`] | Nothing (listen-only nodes, tests) |
//! | [`StaticPhonebook`] | A replaceable in-memory list |
//! | [`DnsPhonebook`] | Host names resolved periodically through a [`Resolver`] |
//! | [`MultiPhonebook`] | Union of other phonebooks without duplicates |
//!
//! Each entry carries a retry-after time. Mesh maintenance pushes the
//! deadline forward after a failed dial so that unreachable addresses are
//! not hammered; [`Phonebook::get_addresses`] skips entries still backing off.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default interval between DNS phonebook refreshes.
pub const DEFAULT_DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub trait Phonebook: Send + Sync {
    /// Up to `n` addresses, in random order, excluding entries in backoff.
    fn get_addresses(&self, n: usize) -> Vec<String>;

    /// Do not hand out `addr` again before `retry_after`.
    fn update_retry_after(&self, _addr: &str, _retry_after: Instant) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyPhonebook;

impl Phonebook for EmptyPhonebook {
    fn get_addresses(&self, _n: usize) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhonebookEntry {
    pub address: String,
    pub retry_after: Option<Instant>,
}

impl PhonebookEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            retry_after: None,
        }
    }

    fn available(&self, now: Instant) -> bool {
        self.retry_after.is_none_or(|t| t <= now)
    }
}

/// Thread-safe, replaceable address list.
#[derive(Debug, Default)]
pub struct StaticPhonebook {
    entries: RwLock<Vec<PhonebookEntry>>,
}

impl StaticPhonebook {
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let book = Self::default();
        book.extend_peer_list(addrs);
        book
    }

    /// Replace the whole list, keeping backoff state of surviving addresses.
    pub fn replace_peer_list<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut seen = HashSet::new();
        let next: Vec<PhonebookEntry> = addrs
            .into_iter()
            .map(Into::into)
            .filter(|a: &String| seen.insert(a.clone()))
            .map(|address| {
                entries
                    .iter()
                    .find(|e| e.address == address)
                    .cloned()
                    .unwrap_or_else(|| PhonebookEntry::new(address))
            })
            .collect();
        *entries = next;
    }

    /// Add addresses not already present.
    pub fn extend_peer_list<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for addr in addrs {
            let addr = addr.into();
            if !entries.iter().any(|e| e.address == addr) {
                entries.push(PhonebookEntry::new(addr));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<PhonebookEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Phonebook for StaticPhonebook {
    fn get_addresses(&self, n: usize) -> Vec<String> {
        let now = Instant::now();
        let mut addrs: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.available(now))
            .map(|e| e.address.clone())
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(n);
        addrs
    }

    fn update_retry_after(&self, addr: &str, retry_after: Instant) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.iter_mut().find(|e| e.address == addr) {
            entry.retry_after = Some(retry_after);
        }
    }
}

/// Union of several phonebooks.
#[derive(Default)]
pub struct MultiPhonebook {
    phonebooks: RwLock<Vec<Arc<dyn Phonebook>>>,
}

impl MultiPhonebook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_phonebook(&self, phonebook: Arc<dyn Phonebook>) {
        self.phonebooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(phonebook);
    }

    pub fn len(&self) -> usize {
        self.phonebooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Phonebook for MultiPhonebook {
    fn get_addresses(&self, n: usize) -> Vec<String> {
        let phonebooks = self.phonebooks.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut seen = HashSet::new();
        let mut addrs: Vec<String> = phonebooks
            .iter()
            .flat_map(|pb| pb.get_addresses(usize::MAX))
            .filter(|a| seen.insert(a.clone()))
            .collect();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(n);
        addrs
    }

    fn update_retry_after(&self, addr: &str, retry_after: Instant) {
        for pb in self.phonebooks.read().unwrap_or_else(|e| e.into_inner()).iter() {
            pb.update_retry_after(addr, retry_after);
        }
    }
}

/// Name resolution capability used by [`DnsPhonebook`].
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>>;
}

/// Resolves through the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host(name)
            .await
            .with_context(|| format!("failed to resolve {name}"))?;
        Ok(addrs.collect())
    }
}

/// Phonebook backed by DNS names (`host:port`), refreshed on demand or by
/// a background task.
pub struct DnsPhonebook {
    names: Vec<String>,
    resolver: Arc<dyn Resolver>,
    book: StaticPhonebook,
}

impl DnsPhonebook {
    pub fn new(names: Vec<String>) -> Self {
        Self::with_resolver(names, Arc::new(SystemResolver))
    }

    pub fn with_resolver(names: Vec<String>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            names,
            resolver,
            book: StaticPhonebook::default(),
        }
    }

    /// Resolve every name and replace the address list. Names that fail to
    /// resolve are skipped; an error is returned only if all of them fail.
    pub async fn refresh(&self) -> Result<usize> {
        let mut resolved = Vec::new();
        let mut failures = 0usize;
        for name in &self.names {
            match self.resolver.resolve(name).await {
                Ok(addrs) => resolved.extend(addrs.into_iter().map(|a| a.to_string())),
                Err(e) => {
                    failures += 1;
                    warn!(name = %name, error = %e, "dns phonebook lookup failed");
                }
            }
        }
        if failures > 0 && failures == self.names.len() {
            anyhow::bail!("all {} dns phonebook names failed to resolve", failures);
        }
        self.book.replace_peer_list(resolved);
        let count = self.book.len();
        debug!(count, "dns phonebook refreshed");
        Ok(count)
    }

    /// Refresh every `interval` until `shutdown` flips to true.
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    // The guard from `wait_for` is not Send; drop it inside the branch.
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "dns phonebook refresh failed");
                        }
                    }
                }
            }
        })
    }
}

impl Phonebook for DnsPhonebook {
    fn get_addresses(&self, n: usize) -> Vec<String> {
        self.book.get_addresses(n)
    }

    fn update_retry_after(&self, addr: &str, retry_after: Instant) {
        self.book.update_retry_after(addr, retry_after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_phonebook_returns_at_most_n() {
        let pb = StaticPhonebook::new(["a:1", "b:2", "c:3"]);
        assert_eq!(pb.get_addresses(10).len(), 3);
        assert_eq!(pb.get_addresses(2).len(), 2);
        assert!(pb.get_addresses(0).is_empty());
    }

    #[test]
    fn static_phonebook_deduplicates() {
        let pb = StaticPhonebook::new(["a:1", "a:1"]);
        pb.extend_peer_list(["a:1", "b:2"]);
        assert_eq!(pb.len(), 2);
        pb.replace_peer_list(["c:3", "c:3"]);
        assert_eq!(pb.get_addresses(10), vec!["c:3".to_string()]);
    }

    #[test]
    fn backoff_hides_address_until_deadline() {
        let pb = StaticPhonebook::new(["a:1", "b:2"]);
        pb.update_retry_after("a:1", Instant::now() + Duration::from_secs(60));
        assert_eq!(pb.get_addresses(10), vec!["b:2".to_string()]);

        pb.update_retry_after("a:1", Instant::now() - Duration::from_millis(1));
        assert_eq!(pb.get_addresses(10).len(), 2);
    }

    #[test]
    fn replace_keeps_backoff_of_surviving_entries() {
        let pb = StaticPhonebook::new(["a:1"]);
        pb.update_retry_after("a:1", Instant::now() + Duration::from_secs(60));
        pb.replace_peer_list(["a:1", "b:2"]);
        assert_eq!(pb.get_addresses(10), vec!["b:2".to_string()]);
    }

    #[test]
    fn multi_phonebook_unions_without_duplicates() {
        let multi = MultiPhonebook::new();
        multi.add_phonebook(Arc::new(StaticPhonebook::new(["a:1", "b:2"])));
        multi.add_phonebook(Arc::new(StaticPhonebook::new(["b:2", "c:3"])));
        multi.add_phonebook(Arc::new(EmptyPhonebook));

        let mut addrs = multi.get_addresses(100);
        addrs.sort();
        assert_eq!(addrs, vec!["a:1", "b:2", "c:3"]);
        assert_eq!(multi.get_addresses(1).len(), 1);
    }

    #[test]
    fn multi_phonebook_forwards_backoff() {
        let first = Arc::new(StaticPhonebook::new(["a:1"]));
        let second = Arc::new(StaticPhonebook::new(["a:1", "b:2"]));
        let multi = MultiPhonebook::new();
        multi.add_phonebook(first.clone());
        multi.add_phonebook(second.clone());

        multi.update_retry_after("a:1", Instant::now() + Duration::from_secs(60));
        assert_eq!(multi.get_addresses(10), vec!["b:2".to_string()]);
        assert!(first.get_addresses(10).is_empty());
    }

    struct FixedResolver;

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>> {
            match name {
                "relays.example:4160" => Ok(vec![
                    "10.0.0.1:4160".parse()?,
                    "10.0.0.2:4160".parse()?,
                ]),
                _ => anyhow::bail!("no such host"),
            }
        }
    }

    #[tokio::test]
    async fn dns_phonebook_refresh() {
        let pb = DnsPhonebook::with_resolver(
            vec!["relays.example:4160".into(), "missing.example:1".into()],
            Arc::new(FixedResolver),
        );
        assert!(pb.get_addresses(10).is_empty());
        assert_eq!(pb.refresh().await.unwrap(), 2);

        let mut addrs = pb.get_addresses(10);
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1:4160", "10.0.0.2:4160"]);
    }

    #[tokio::test]
    async fn refresh_task_fills_book_and_stops_on_shutdown() {
        let pb = Arc::new(DnsPhonebook::with_resolver(
            vec!["relays.example:4160".into()],
            Arc::new(FixedResolver),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = pb.clone().spawn_refresh(Duration::from_millis(20), stop_rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while pb.get_addresses(10).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("refresh task never populated the book");

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("refresh task ignored shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dns_phonebook_fails_when_nothing_resolves() {
        let pb = DnsPhonebook::with_resolver(vec!["missing.example:1".into()], Arc::new(FixedResolver));
        assert!(pb.refresh().await.is_err());
    }
}
