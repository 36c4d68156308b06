//! In-memory resolver and sink used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::asset::{AssetRef, AssetResolver, MediaKind, ResolveError};
use crate::stream::delivery::{DeliveryError, DeliverySink};
use crate::stream::proto::{ElementDescriptor, ElementKind};

/// Resolves `https://host/path/name` to `resolved-name`.
#[derive(Default)]
pub(crate) struct FakeResolver {
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub(crate) fn with_delay(mut self, locator: &str, delay: Duration) -> Self {
        self.delays.insert(locator.to_string(), delay);
        self
    }

    pub(crate) fn failing(mut self, locator: &str) -> Self {
        self.failures.insert(locator.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl AssetResolver for FakeResolver {
    async fn resolve(&self, locator: &str, _kind: MediaKind) -> Result<AssetRef, ResolveError> {
        self.calls.lock().expect("calls lock").push(locator.to_string());
        if let Some(delay) = self.delays.get(locator) {
            tokio::time::sleep(*delay).await;
        }
        if self.failures.contains(locator) {
            return Err(ResolveError::Rejected(format!("cannot import {locator}")));
        }
        let name = locator.rsplit('/').next().unwrap_or(locator);
        Ok(AssetRef::new(format!("resolved-{name}")))
    }
}

/// Records deliveries; optionally fails the n-th (0-based) one.
#[derive(Default)]
pub(crate) struct RecordingSink {
    delivered: Mutex<Vec<ElementDescriptor>>,
    fail_at: Option<usize>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub(crate) fn failing_at(attempt: usize) -> Self {
        Self {
            fail_at: Some(attempt),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn delivered(&self) -> Vec<ElementDescriptor> {
        self.delivered.lock().expect("delivered lock").clone()
    }

    /// Text elements as their joined children, everything else as `ref:<ref>`.
    pub(crate) fn delivered_summary(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .map(|element| match element.kind {
                ElementKind::Text => element.children.join(" "),
                _ => format!("ref:{}", element.resource.as_deref().unwrap_or_default()),
            })
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, element: &ElementDescriptor) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut delivered = self.delivered.lock().expect("delivered lock");
        if self.fail_at == Some(delivered.len()) {
            return Err(DeliveryError::new("host rejected element"));
        }
        delivered.push(element.clone());
        Ok(())
    }
}
