//! Construct-at-startup, read-only name→provider map (Design Notes §9):
//! "a construct-at-startup immutable map; reject runtime registration
//! except through an explicit plugin-load API with its own locking."

use std::collections::HashMap;
use std::sync::Arc;

use crate::jobs::model::Provider;

use super::ProviderSurface;

pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn ProviderSurface>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            providers: HashMap::new(),
        }
    }

    pub fn get(&self, variant: Provider) -> Option<Arc<dyn ProviderSurface>> {
        self.providers.get(&variant).cloned()
    }

    pub fn variants(&self) -> impl Iterator<Item = Provider> + '_ {
        self.providers.keys().copied()
    }
}

pub struct ProviderRegistryBuilder {
    providers: HashMap<Provider, Arc<dyn ProviderSurface>>,
}

impl ProviderRegistryBuilder {
    pub fn register(mut self, provider: Arc<dyn ProviderSurface>) -> Self {
        self.providers.insert(provider.variant(), provider);
        self
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}
