//! top level configuration loading and the generation lifecycle
//!
//! A configuration generation is one fully provisioned set of apps. A new
//! generation is provisioned and started completely before the previous one
//! is stopped, and a generation is immutable once it carries traffic.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use serde_derive::Deserialize;
use serde_json::{json, Map, Value};

use crate::logging::{self, LoggingConfig};
use crate::module::{load_module, LoadContext, Module, ModuleError};

#[derive(Debug)]
pub enum ConfigError {
    /// The root document is not valid JSON or misses required structure
    Parse(serde_json::Error),
    /// Loading or provisioning a module failed
    Module(ModuleError),
    /// An app loaded fine but cannot run as an app
    App { name: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "parsing config: {}", e),
            ConfigError::Module(e) => write!(f, "{}", e),
            ConfigError::App { name, reason } => write!(f, "app {}: {}", name, reason),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Parse(e) => Some(e),
            ConfigError::Module(e) => Some(e),
            ConfigError::App { .. } => None,
        }
    }
}

impl From<ModuleError> for ConfigError {
    fn from(err: ModuleError) -> Self {
        ConfigError::Module(err)
    }
}

type Result<T> = std::result::Result<T, ConfigError>;

/// The `admin` section. Parsed and retained; no admin endpoint is served.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub listen: Option<String>,
}

/// The root configuration document.
#[derive(Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub apps: Map<String, Value>,
}

/// One provisioned and started configuration. Apps are retained in
/// provisioning order so shutdown can run in reverse.
pub struct Generation {
    apps: Vec<(String, Arc<dyn Module>)>,
}

lazy_static! {
    static ref CURRENT: Mutex<Option<Generation>> = Mutex::new(None);
}

/// Parse a root configuration document.
pub fn load_config(data: &[u8]) -> Result<Config> {
    serde_json::from_slice(data).map_err(ConfigError::Parse)
}

/// Load configuration bytes and run them, replacing any live generation.
/// Empty or `null` input selects the default configuration.
pub fn load(data: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(data).unwrap_or("").trim();
    let config = if text.is_empty() || text == "null" {
        default_config()
    } else {
        load_config(data)?
    };

    run(config)
}

/// Run the given configuration, replacing any live generation. The new
/// generation is provisioned and started fully before the old one is
/// stopped; a failure leaves the old generation running.
pub fn run(config: Config) -> Result<()> {
    let generation = start_config(&config)?;

    let old = {
        let mut current = CURRENT.lock();
        current.replace(generation)
    };

    if let Some(old) = old {
        stop_generation(&old);
    }

    Ok(())
}

/// Stop the live generation, if any.
pub fn stop() {
    let old = CURRENT.lock().take();
    if let Some(generation) = old {
        stop_generation(&generation);
    }
}

/// The configuration used when none is supplied: a single DNS server on
/// the standard port forwarding everything upstream, with debug text
/// logging.
pub fn default_config() -> Config {
    let mut apps = Map::new();
    apps.insert(
        "dns".to_string(),
        json!({
            "servers": {
                "main": {
                    "listen": [":53"],
                    "protocol": ["udp", "tcp"],
                    "handler": {
                        "handler": "dns.resolver.upstream"
                    }
                }
            }
        }),
    );

    Config {
        admin: None,
        logging: Some(LoggingConfig {
            level: Some("DEBUG".to_string()),
            handler: Some("logger.text".to_string()),
            options: Map::new(),
        }),
        apps,
    }
}

/// Provision and start every app of a configuration. On any failure the
/// partially built generation is stopped and cleaned up before the error
/// propagates; no partial tree is ever exposed to traffic.
fn start_config(config: &Config) -> Result<Generation> {
    logging::setup_logging(config.logging.as_ref())?;

    let app_registry: Arc<RwLock<HashMap<String, Arc<dyn Module>>>> =
        Arc::new(RwLock::new(HashMap::new()));
    let ctx = LoadContext::with_apps(app_registry.clone());

    let mut apps: Vec<(String, Arc<dyn Module>)> = Vec::new();

    for (name, fragment) in &config.apps {
        log::info!("loading app name={}", name);

        let module = match load_module(&ctx.child(name), fragment, name) {
            Ok(module) => module,
            Err(err) => {
                cleanup_apps(&apps);
                return Err(err.into());
            }
        };

        if module.as_app().is_none() {
            cleanup_apps(&apps);
            return Err(ConfigError::App {
                name: name.clone(),
                reason: "module does not implement the App interface".to_string(),
            });
        }

        app_registry.write().insert(name.clone(), module.clone());
        apps.push((name.clone(), module));
    }

    for (index, (name, module)) in apps.iter().enumerate() {
        log::info!("starting app name={}", name);

        if let Err(err) = module.as_app().map(|app| app.start()).unwrap_or(Ok(())) {
            log::error!("failed to start app name={} error={}", name, err);

            // stop whatever already runs, then release everything loaded
            for (_, started) in apps.iter().take(index + 1).rev() {
                if let Some(app) = started.as_app() {
                    if let Err(stop_err) = app.stop() {
                        log::error!("error stopping app during rollback: {}", stop_err);
                    }
                }
            }
            cleanup_apps(&apps);

            return Err(ConfigError::App {
                name: name.clone(),
                reason: err.to_string(),
            });
        }
    }

    log::info!("all apps started successfully");

    Ok(Generation { apps })
}

fn cleanup_apps(apps: &[(String, Arc<dyn Module>)]) {
    for (name, module) in apps.iter().rev() {
        if let Err(err) = module.cleanup() {
            log::error!("error cleaning up app name={} error={}", name, err);
        }
    }
}

fn stop_generation(generation: &Generation) {
    log::info!("stopping configuration");

    for (name, module) in generation.apps.iter().rev() {
        log::info!("stopping app name={}", name);

        if let Some(app) = module.as_app() {
            if let Err(err) = app.stop() {
                log::error!("error stopping app name={} error={}", name, err);
            }
        }
        if let Err(err) = module.cleanup() {
            log::error!("error cleaning up app name={} error={}", name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::register_builtin_modules;

    fn test_config(json_text: &str) -> Config {
        load_config(json_text.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_root_document() {
        let config = test_config(
            r#"{
                "admin": { "listen": "127.0.0.1:2019" },
                "logging": { "level": "INFO", "handler": "logger.text" },
                "apps": { "dns": { "servers": {} } }
            }"#,
        );

        assert_eq!(
            Some("127.0.0.1:2019"),
            config.admin.as_ref().and_then(|a| a.listen.as_deref())
        );
        assert!(config.apps.contains_key("dns"));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(load_config(b"{ not json").is_err());
    }

    #[test]
    fn test_default_config_shape() {
        let config = default_config();
        assert!(config.apps.contains_key("dns"));

        let logging = config.logging.unwrap();
        assert_eq!(Some("DEBUG"), logging.level.as_deref());
        assert_eq!(Some("logger.text"), logging.handler.as_deref());
    }

    #[test]
    fn test_unknown_app_module_fails() {
        register_builtin_modules();

        let config = test_config(
            r#"{
                "logging": { "level": "ERROR" },
                "apps": { "carrier-pigeon": {} }
            }"#,
        );

        match start_config(&config) {
            Err(ConfigError::Module(err)) => {
                assert!(err.to_string().contains("carrier-pigeon"));
            }
            other => panic!("expected module error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_generation_start_and_stop() {
        register_builtin_modules();

        let config = test_config(
            r#"{
                "logging": { "level": "ERROR" },
                "apps": {
                    "dns": {
                        "servers": {
                            "main": {
                                "listen": ["127.0.0.1:0"],
                                "protocol": ["udp"],
                                "handler": {
                                    "handler": "dns.zone.manager",
                                    "default_upstream": { "upstreams": [] }
                                }
                            }
                        }
                    }
                }
            }"#,
        );

        let generation = start_config(&config).unwrap();
        assert_eq!(1, generation.apps.len());
        stop_generation(&generation);
    }

    #[test]
    fn test_load_is_idempotent() {
        register_builtin_modules();

        let doc = r#"{
            "logging": { "level": "ERROR" },
            "apps": {
                "dns": {
                    "servers": {
                        "main": {
                            "listen": ["127.0.0.1:0"],
                            "protocol": ["udp"],
                            "handler": {
                                "handler": "dns.zone.manager",
                                "zones": [{
                                    "zone": "example.com.",
                                    "records": { "api": { "type": "A", "value": "192.0.2.1" } }
                                }],
                                "default_upstream": { "upstreams": [] }
                            }
                        }
                    }
                }
            }
        }"#;

        // loading the same document twice yields a behaviorally identical
        // generation each time
        for _ in 0..2 {
            let generation = start_config(&test_config(doc)).unwrap();
            assert_eq!(1, generation.apps.len());
            stop_generation(&generation);
        }
    }

    #[test]
    fn test_provision_failure_leaves_no_generation() {
        register_builtin_modules();

        let config = test_config(
            r#"{
                "logging": { "level": "ERROR" },
                "apps": {
                    "dns": {
                        "servers": {
                            "main": {
                                "listen": ["127.0.0.1:0"],
                                "protocol": ["udp"],
                                "handler": { "handler": "dns.resolver.upstream", "timeout": "bogus" }
                            }
                        }
                    }
                }
            }"#,
        );

        assert!(start_config(&config).is_err());
    }
}
