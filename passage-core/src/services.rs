use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfigStore, SecretStore};
use crate::Lifecycle;

/// The explicit context threaded through the orchestrator and forwarders in
/// place of process globals. Loaded once per invocation.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ConfigStore>,
    pub secrets: Arc<SecretStore>,
    pub lifecycle: Arc<Lifecycle>,
}

impl Services {
    pub fn load(user_config: Option<PathBuf>, overrides: &[(String, String)]) -> Self {
        let user_path = user_config.unwrap_or_else(ConfigStore::default_user_path);
        let mut config = ConfigStore::load(&user_path, &ConfigStore::default_system_path());
        config.set_overrides(overrides);
        let secrets = SecretStore::load(&SecretStore::default_path());
        Self {
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            lifecycle: Lifecycle::new(),
        }
    }
}
