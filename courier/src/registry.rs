//! Registry of delivery channels.
//!
//! Channels are constructed lazily on first resolution and cached for the
//! registry's lifetime. External code contributes channels through
//! [`ChannelProvider`]s, invoked once during discovery.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channels::{
    Channel, ChannelContext, ChannelKind, ChannelSettings, DatabaseChannel, MailChannel,
    WebhookChannel, canonical_name,
};
use crate::{Error, Result};

/// Constructor for a channel instance.
pub type ChannelFactory =
    Arc<dyn Fn(&ChannelContext, &ChannelSettings) -> Result<Arc<dyn Channel>> + Send + Sync>;

/// Factory for a [`ChannelKind`].
pub fn factory_of<C: ChannelKind>() -> ChannelFactory {
    Arc::new(|context: &ChannelContext, settings: &ChannelSettings| {
        let channel: Arc<dyn Channel> = Arc::new(C::build(context, settings)?);
        Ok(channel)
    })
}

/// Channels resolvable without any configuration.
const IMPLICIT_CHANNELS: [&str; 2] = ["database", "mail"];

/// Discovery participant contributing channels to a registry.
pub trait ChannelProvider: Send + Sync {
    /// Channel names this provider registers.
    fn provides(&self) -> Vec<String>;

    fn register(&self, registry: &ChannelRegistry) -> Result<()>;

    /// Settings merged under whatever the provider registered.
    fn default_settings(&self) -> ChannelSettings {
        ChannelSettings::new()
    }
}

#[derive(Clone)]
struct ChannelEntry {
    factory: ChannelFactory,
    settings: ChannelSettings,
}

#[derive(Default)]
struct DiscoveryState {
    ran: bool,
    pending: Vec<Arc<dyn ChannelProvider>>,
}

/// Named channel configuration plus the cache of constructed channels.
pub struct ChannelRegistry {
    context: ChannelContext,
    kinds: RwLock<HashMap<String, ChannelFactory>>,
    entries: RwLock<HashMap<String, ChannelEntry>>,
    loaded: DashMap<String, Arc<dyn Channel>>,
    discovery: Mutex<DiscoveryState>,
}

impl ChannelRegistry {
    /// Create a registry with the built-in channel kinds.
    pub fn new(context: ChannelContext) -> Self {
        let registry = Self {
            context,
            kinds: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            loaded: DashMap::new(),
            discovery: Mutex::new(DiscoveryState::default()),
        };
        registry.register_kind::<DatabaseChannel>();
        registry.register_kind::<MailChannel>();
        registry.register_kind::<WebhookChannel>();
        registry
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Make a channel type available to configuration by its canonical name.
    pub fn register_kind<C: ChannelKind>(&self) {
        self.kinds.write().insert(C::kind_name(), factory_of::<C>());
    }

    /// Factory for a configured class: a kind name or a channel type path.
    pub fn kind(&self, class: &str) -> Option<ChannelFactory> {
        let kinds = self.kinds.read();
        kinds
            .get(class)
            .or_else(|| kinds.get(&canonical_name(class)))
            .cloned()
    }

    /// Register (or replace) the configuration for `name`.
    ///
    /// Fails once `name` has been resolved; call [`unregister`](Self::unregister) first.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: ChannelFactory,
        settings: ChannelSettings,
    ) -> Result<()> {
        let name = name.into();
        // Held across the check so a concurrent resolve cannot load in between.
        let mut entries = self.entries.write();
        if self.loaded.contains_key(&name) {
            return Err(Error::ChannelAlreadyLoaded { channel: name });
        }
        debug!(channel = %name, "Registering channel");
        entries.insert(name, ChannelEntry { factory, settings });
        Ok(())
    }

    /// Register `name` backed by the channel kind `class`.
    pub fn register_class(
        &self,
        name: impl Into<String>,
        class: &str,
        settings: ChannelSettings,
    ) -> Result<()> {
        let name = name.into();
        let factory = self
            .kind(class)
            .ok_or_else(|| Error::config(format!("Unknown channel class '{}' for '{}'", class, name)))?;
        self.register(name, factory, settings)
    }

    /// Drop the configuration and any cached instance for `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let configured = entries.remove(name).is_some();
        let loaded = self.loaded.remove(name).is_some();
        configured || loaded
    }

    pub fn has(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
            || self.entries.read().contains_key(name)
            || IMPLICIT_CHANNELS.contains(&name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// Names with explicit configuration, sorted.
    pub fn configured(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Configured settings for `name`.
    pub fn settings(&self, name: &str) -> Option<ChannelSettings> {
        self.entries.read().get(name).map(|e| e.settings.clone())
    }

    /// Resolve `name` to its channel, constructing it on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.loaded.get(name) {
            return Ok(Arc::clone(channel.value()));
        }

        self.run_discovery();

        // Registration waits until this instance is cached.
        let entries = self.entries.read();
        let entry = match entries.get(name).cloned() {
            Some(entry) => entry,
            None if IMPLICIT_CHANNELS.contains(&name) => ChannelEntry {
                factory: self
                    .kind(name)
                    .ok_or_else(|| Error::channel_not_configured(name))?,
                settings: ChannelSettings::new(),
            },
            None => return Err(Error::channel_not_configured(name)),
        };

        let built = (entry.factory)(&self.context, &entry.settings)?;
        // First constructed instance wins if two resolutions race.
        let channel = self
            .loaded
            .entry(name.to_string())
            .or_insert(built)
            .value()
            .clone();
        debug!(channel = %name, "Channel loaded");
        Ok(channel)
    }

    /// Add a discovery participant. Invoked immediately if discovery already ran.
    pub fn add_provider(&self, provider: Arc<dyn ChannelProvider>) {
        {
            let mut discovery = self.discovery.lock();
            if !discovery.ran {
                discovery.pending.push(provider);
                return;
            }
        }
        self.invoke_provider(provider.as_ref());
    }

    /// Invoke every pending provider. Only the first call does anything.
    pub fn run_discovery(&self) {
        let pending = {
            let mut discovery = self.discovery.lock();
            if discovery.ran {
                return;
            }
            discovery.ran = true;
            std::mem::take(&mut discovery.pending)
        };

        for provider in pending {
            self.invoke_provider(provider.as_ref());
        }
    }

    pub fn discovery_ran(&self) -> bool {
        self.discovery.lock().ran
    }

    fn invoke_provider(&self, provider: &dyn ChannelProvider) {
        let provides = provider.provides();
        if let Err(e) = provider.register(self) {
            warn!(channels = ?provides, error = %e, "Channel provider failed to register");
            return;
        }

        let defaults = provider.default_settings();
        if defaults.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for name in &provides {
            if let Some(entry) = entries.get_mut(name) {
                for (key, value) in &defaults {
                    entry
                        .settings
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(ChannelContext::default())
    }
}

/// Settings map from a JSON object; anything else is empty.
pub fn settings_from(value: Value) -> ChannelSettings {
    match value {
        Value::Object(map) => map,
        _ => ChannelSettings::new(),
    }
}
