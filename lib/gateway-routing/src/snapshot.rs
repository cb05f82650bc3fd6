use gateway_auth::{DisabledProvider, ProviderHandle};
use gateway_core::{ProviderSpec, RouteEntry, RouteTable};
use std::fmt;
use std::sync::Arc;

/// One immutable view of routes plus the provider bound to them
///
/// Built completely before it is published; never mutated afterwards.
pub struct RoutingSnapshot {
    routes: RouteTable,
    provider_spec: ProviderSpec,
    provider: ProviderHandle,
    generation: u64,
    source_hash: Option<String>,
}

impl RoutingSnapshot {
    pub fn new(
        routes: RouteTable,
        provider_spec: ProviderSpec,
        provider: ProviderHandle,
        generation: u64,
        source_hash: Option<String>,
    ) -> Self {
        Self {
            routes,
            provider_spec,
            provider,
            generation,
            source_hash,
        }
    }

    /// Placeholder published before the first configuration is loaded
    pub fn empty() -> Self {
        Self::new(
            RouteTable::default(),
            ProviderSpec::Disabled,
            Arc::new(DisabledProvider),
            0,
            None,
        )
    }

    pub fn lookup(&self, path: &str) -> Option<&RouteEntry> {
        self.routes.lookup(path)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    pub fn provider_spec(&self) -> &ProviderSpec {
        &self.provider_spec
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_hash(&self) -> Option<&str> {
        self.source_hash.as_deref()
    }
}

impl fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("generation", &self.generation)
            .field("routes", &self.routes.len())
            .field("provider", &self.provider.name())
            .field("source_hash", &self.source_hash)
            .finish()
    }
}
