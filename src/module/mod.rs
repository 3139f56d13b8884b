//! The module registry and loader binding configuration trees to handler
//! trees
//!
//! Every pluggable piece of the server is a module: apps, query handlers and
//! log handlers. Modules are registered under a string id during startup and
//! instantiated from JSON configuration fragments. A fragment selects its
//! module through a `handler` field (or, for apps, through the app name) and
//! the whole fragment is handed to the new instance for hydration.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde_json::Value;

use crate::dns::protocol::DnsPacket;

/// Client IP classification based on configured source groups
pub mod client;

/// Client-aware policy routing with selective configuration override
pub mod policy;

#[derive(Debug)]
pub enum ModuleError {
    /// Configuration references an id with no registered factory
    UnknownModule(String),
    /// A module rejected its configuration during validation
    InvalidConfig(String),
    /// Decoding a configuration fragment into a module instance failed
    Hydrate {
        id: String,
        source: serde_json::Error,
    },
    /// A child module's provisioning failed; carries the failing path
    Provision {
        path: String,
        source: Box<ModuleError>,
    },
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::UnknownModule(id) => write!(f, "unknown module: {}", id),
            ModuleError::InvalidConfig(reason) => write!(f, "invalid config: {}", reason),
            ModuleError::Hydrate { id, source } => {
                write!(f, "unmarshaling config for module {}: {}", id, source)
            }
            ModuleError::Provision { path, source } => {
                write!(f, "provisioning {}: {}", path, source)
            }
        }
    }
}

impl Error for ModuleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ModuleError::Hydrate { source, .. } => Some(source),
            ModuleError::Provision { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ModuleError>;

/// Errors produced while serving a query. The server host maps any of these
/// to a SERVFAIL response; the listener loop itself never dies from one.
#[derive(Debug)]
pub enum HandlerError {
    Protocol(crate::dns::protocol::ProtocolError),
    Exchange(crate::dns::client::ClientError),
    Io(std::io::Error),
    /// The request context was canceled before the query completed
    Canceled,
    /// A subtree was configured with a module that cannot serve queries
    NotAHandler(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Protocol(e) => write!(f, "protocol error: {}", e),
            HandlerError::Exchange(e) => write!(f, "upstream exchange error: {}", e),
            HandlerError::Io(e) => write!(f, "io error: {}", e),
            HandlerError::Canceled => write!(f, "request canceled"),
            HandlerError::NotAHandler(id) => {
                write!(f, "module {} does not implement a DNS handler", id)
            }
        }
    }
}

impl Error for HandlerError {}

impl From<crate::dns::protocol::ProtocolError> for HandlerError {
    fn from(err: crate::dns::protocol::ProtocolError) -> Self {
        HandlerError::Protocol(err)
    }
}

impl From<crate::dns::client::ClientError> for HandlerError {
    fn from(err: crate::dns::client::ClientError) -> Self {
        HandlerError::Exchange(err)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Io(err)
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Destination for a response packet. Uniform over datagram and stream
/// transports; the remote address carries the client's network identity.
pub trait ResponseWriter {
    fn remote_addr(&self) -> SocketAddr;
    fn write_packet(&mut self, packet: &mut DnsPacket) -> HandlerResult<()>;
}

/// A node in the handler tree. Implementations must be safe for concurrent
/// calls; all per-query state lives on the stack of the serving thread.
pub trait DnsHandler: Send + Sync {
    fn serve_dns(
        &self,
        ctx: &RequestContext,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
    ) -> HandlerResult<()>;
}

/// Long running top level modules like the dns server host.
pub trait App: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// A configurable unit of the server. The lifecycle is: construct through
/// the registered factory, hydrate from the JSON fragment, provision, serve,
/// cleanup. Instances are immutable once provisioned.
pub trait Module: Send + Sync {
    /// Decode the configuration fragment (including its `handler` field)
    /// into this instance.
    fn hydrate(&mut self, raw: &Value) -> Result<()>;

    /// Resolve dependencies and run validators. Called exactly once, before
    /// any traffic reaches the module.
    fn provision(&mut self, _ctx: &LoadContext) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called at most once, in reverse provisioning
    /// order, when the owning configuration generation is replaced.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn as_handler(&self) -> Option<&dyn DnsHandler> {
        None
    }

    fn as_app(&self) -> Option<&dyn App> {
        None
    }

    fn as_log_handler(&self) -> Option<&dyn crate::logging::LogHandler> {
        None
    }
}

/// Registration record tying a module id to its factory.
#[derive(Clone, Copy)]
pub struct ModuleInfo {
    pub id: &'static str,
    pub new: fn() -> Box<dyn Module>,
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<&'static str, ModuleInfo>> = RwLock::new(HashMap::new());
}

/// Insert a module factory into the process wide registry. Registering the
/// same id twice is a programming error and aborts the process.
pub fn register_module(info: ModuleInfo) {
    let mut registry = REGISTRY.write();
    if registry.contains_key(info.id) {
        panic!("module already registered: {}", info.id);
    }
    registry.insert(info.id, info);
}

pub fn get_module(id: &str) -> Option<ModuleInfo> {
    REGISTRY.read().get(id).copied()
}

/// Ids of every registered module, sorted for stable output.
pub fn module_ids() -> Vec<String> {
    let mut ids: Vec<String> = REGISTRY.read().keys().map(|id| id.to_string()).collect();
    ids.sort();
    ids
}

/// Register the modules shipped with the server. Safe to call more than
/// once; only the first call registers.
pub fn register_builtin_modules() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        register_module(crate::dns::app::module_info());
        register_module(crate::dns::resolver::module_info());
        register_module(crate::dns::zone::module_info());
        register_module(policy::module_info());
        register_module(crate::logging::text_module_info());
        register_module(crate::logging::json_module_info());
    });
}

/// Load a module by id: look up the factory, construct, hydrate from the
/// fragment, provision. A provisioning failure cleans up the partially
/// built instance (and, through it, any children it already provisioned)
/// before the error propagates.
pub fn load_module(ctx: &LoadContext, fragment: &Value, id: &str) -> Result<Arc<dyn Module>> {
    let info = get_module(id).ok_or_else(|| ModuleError::UnknownModule(id.to_string()))?;

    let mut module = (info.new)();
    module.hydrate(fragment)?;

    if let Err(err) = module.provision(ctx) {
        if let Err(cleanup_err) = module.cleanup() {
            log::warn!(
                "cleanup after failed provisioning of {} also failed: {}",
                ctx.path(),
                cleanup_err
            );
        }
        return Err(ModuleError::Provision {
            path: ctx.path().to_string(),
            source: Box::new(err),
        });
    }

    Ok(Arc::from(module))
}

/// Context handed to modules while they provision. Immutable for the
/// lifetime of the configuration generation. Logging goes through the
/// global `log` facade.
#[derive(Clone)]
pub struct LoadContext {
    apps: Arc<RwLock<HashMap<String, Arc<dyn Module>>>>,
    path: String,
}

impl LoadContext {
    pub fn new() -> LoadContext {
        LoadContext {
            apps: Arc::new(RwLock::new(HashMap::new())),
            path: String::new(),
        }
    }

    pub fn with_apps(apps: Arc<RwLock<HashMap<String, Arc<dyn Module>>>>) -> LoadContext {
        LoadContext {
            apps,
            path: String::new(),
        }
    }

    /// The configuration path leading to the module being provisioned,
    /// used to locate failures in nested trees.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Derive a context one step deeper in the configuration tree.
    pub fn child(&self, segment: &str) -> LoadContext {
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.path, segment)
        };
        LoadContext {
            apps: self.apps.clone(),
            path,
        }
    }

    /// Look up a sibling app by name. Only apps provisioned earlier in the
    /// same generation are visible.
    pub fn app(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.apps
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::InvalidConfig(format!("app {} not found", name)))
    }

    /// Load a child handler from a fragment. The fragment must be an object
    /// with a string `handler` field naming the module; the entire fragment
    /// is passed through to the child for hydration.
    pub fn load_child(&self, fragment: &Value) -> Result<Arc<dyn Module>> {
        let obj = fragment.as_object().ok_or_else(|| {
            ModuleError::InvalidConfig("handler config must be a JSON object".to_string())
        })?;

        let id = obj.get("handler").and_then(Value::as_str).ok_or_else(|| {
            ModuleError::InvalidConfig("handler config must specify a 'handler' field".to_string())
        })?;

        load_module(&self.child(id), fragment, id)
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        LoadContext::new()
    }
}

/// Per request state carried through the handler tree.
///
/// The client group tag is deliberately private: the policy handler is the
/// only writer (through `with_client_group`) and the zone manager the only
/// reader, so modules cannot collide on the key by accident.
#[derive(Clone)]
pub struct RequestContext {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    client_group: Option<String>,
}

impl RequestContext {
    pub fn new() -> RequestContext {
        RequestContext {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: None,
            client_group: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> RequestContext {
        RequestContext {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
            client_group: None,
        }
    }

    /// Derive a context carrying the given client group tag. Cancellation
    /// and deadline are shared with the parent.
    pub fn with_client_group(&self, group: &str) -> RequestContext {
        RequestContext {
            canceled: self.canceled.clone(),
            deadline: self.deadline,
            client_group: Some(group.to_string()),
        }
    }

    /// The client group tag set by the policy handler, if any. An empty
    /// string means the policy layer ran but no group matched.
    pub fn client_group(&self) -> Option<&str> {
        self.client_group.as_deref()
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.canceled.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext::new()
    }
}
