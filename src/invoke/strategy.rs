//! Provider selection policies

use crate::transport::Invocation;
use crate::{Error, Result};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait ProviderStrategy: Send + Sync {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String>;

    /// Reject a selection before it is used for `call`.
    fn validate(&self, selected: Option<&str>, call: &Invocation) -> Result<()> {
        match selected {
            Some(address) if !address.trim().is_empty() => Ok(()),
            _ => Err(Error::NoAvailableProvider(format!(
                "{}_{}",
                call.interface, call.version
            ))),
        }
    }
}

/// Cycles through candidates with a shared counter
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    fn next(&self) -> u64 {
        // fetch_update only fails if the closure returns None
        match self.counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            Some(if c == u64::MAX { 0 } else { c + 1 })
        }) {
            Ok(prev) | Err(prev) => prev,
        }
    }
}

impl ProviderStrategy for RoundRobinStrategy {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        let index = (self.next() % candidates.len() as u64) as usize;
        candidates.get(index)
    }
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl ProviderStrategy for RandomStrategy {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        candidates.get(rand::thread_rng().gen_range(0..candidates.len()))
    }
}
