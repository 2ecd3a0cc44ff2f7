//! Process-wide plugin registry.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::aes::AesPlugin;
use crate::error::{CipherError, Result};
use crate::hkdf_plugin::HkdfPlugin;
use crate::hmac_plugin::HmacPlugin;
use crate::password_plugin::PasswordPlugin;
use crate::pbkdf2_plugin::Pbkdf2Plugin;
use crate::plugin::VaultPlugin;
use crate::rsa_plugin::RsaPlugin;

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn VaultPlugin>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn VaultPlugin>> = HashMap::new();
    for plugin in [
        Arc::new(AesPlugin) as Arc<dyn VaultPlugin>,
        Arc::new(HmacPlugin),
        Arc::new(HkdfPlugin),
        Arc::new(Pbkdf2Plugin),
        Arc::new(RsaPlugin),
        Arc::new(PasswordPlugin),
    ] {
        map.insert(plugin.name().to_string(), plugin);
    }
    RwLock::new(map)
});

/// Register a plugin under its own name, replacing any previous one.
pub fn register(plugin: Arc<dyn VaultPlugin>) {
    let name = plugin.name().to_string();
    tracing::debug!(plugin = %name, "registering cipher plugin");
    REGISTRY.write().insert(name, plugin);
}

/// Look up a plugin by key type name.
pub fn get(name: &str) -> Result<Arc<dyn VaultPlugin>> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| CipherError::UnsupportedType(name.to_string()))
}

/// Names of all registered plugins, for diagnostics.
pub fn names() -> Vec<String> {
    REGISTRY.read().keys().cloned().collect()
}
