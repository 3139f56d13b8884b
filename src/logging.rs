//! log setup and the pluggable log handler modules
//!
//! All code logs through the `log` facade; where the records end up is
//! decided by configuration. The `logging.handler` field names a registered
//! log handler module (`logger.text` or `logger.json`) and the facade
//! forwards every enabled record to it. The sink is swappable so a new
//! configuration generation can change handler and level without
//! re-registering with `log`, which only accepts a logger once per process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::module::{get_module, LoadContext, Module, ModuleError, ModuleInfo};

/// The `logging` section of the root configuration. Fields beyond `level`
/// and `handler` are passed through to the selected handler module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

/// Capability implemented by log handler modules: render and emit one
/// record.
pub trait LogHandler: Send + Sync {
    fn write_record(&self, record: &Record);
}

struct ActiveSink {
    handler: Arc<dyn Module>,
    level: LevelFilter,
}

lazy_static! {
    static ref ACTIVE: RwLock<Option<ActiveSink>> = RwLock::new(None);
}

struct FacadeLogger;

static FACADE: FacadeLogger = FacadeLogger;

impl Log for FacadeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match ACTIVE.read().as_ref() {
            Some(sink) => metadata.level() <= sink.level,
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        let active = ACTIVE.read();
        if let Some(sink) = active.as_ref() {
            if record.level() > sink.level {
                return;
            }
            if let Some(handler) = sink.handler.as_log_handler() {
                handler.write_record(record);
            }
        }
    }

    fn flush(&self) {}
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Install the configured log handler. Absent configuration selects the
/// text handler at INFO.
pub fn setup_logging(config: Option<&LoggingConfig>) -> crate::module::Result<()> {
    let level = parse_level(config.and_then(|c| c.level.as_deref()).unwrap_or("INFO"));

    let handler_id = config
        .and_then(|c| c.handler.as_deref())
        .filter(|id| !id.is_empty())
        .unwrap_or("logger.text");

    let info = get_module(handler_id).ok_or_else(|| {
        ModuleError::InvalidConfig(format!("unknown logging handler: {}", handler_id))
    })?;

    // the whole logging section is handed to the handler so options like
    // `output` reach it
    let fragment = config
        .and_then(|c| serde_json::to_value(c).ok())
        .unwrap_or(Value::Null);

    let mut module = (info.new)();
    module.hydrate(&fragment)?;
    module.provision(&LoadContext::new())?;

    if module.as_log_handler().is_none() {
        return Err(ModuleError::InvalidConfig(format!(
            "module {} does not implement a log handler",
            handler_id
        )));
    }

    // The facade registers with `log` once; later generations only swap
    // the sink behind it.
    let _ = log::set_logger(&FACADE);
    log::set_max_level(level);

    *ACTIVE.write() = Some(ActiveSink {
        handler: Arc::from(module),
        level,
    });

    Ok(())
}

pub fn text_module_info() -> ModuleInfo {
    ModuleInfo {
        id: "logger.text",
        new: || Box::new(TextLogHandler::default()),
    }
}

pub fn json_module_info() -> ModuleInfo {
    ModuleInfo {
        id: "logger.json",
        new: || Box::new(JsonLogHandler::default()),
    }
}

/// Where rendered records go. The default is stdout; `output` may also
/// name stderr or a file path opened in append mode.
#[derive(Default)]
enum OutputTarget {
    #[default]
    Stdout,
    Stderr,
    File(Mutex<File>),
}

fn open_output(output: &str) -> crate::module::Result<OutputTarget> {
    match output {
        "" | "stdout" => Ok(OutputTarget::Stdout),
        "stderr" => Ok(OutputTarget::Stderr),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ModuleError::InvalidConfig(format!("opening log output {}: {}", path, e))
                })?;
            Ok(OutputTarget::File(Mutex::new(file)))
        }
    }
}

fn emit(target: &OutputTarget, line: &str) {
    match target {
        OutputTarget::Stdout => println!("{}", line),
        OutputTarget::Stderr => eprintln!("{}", line),
        OutputTarget::File(file) => {
            let _ = writeln!(file.lock(), "{}", line);
        }
    }
}

/// Single line human readable log output.
#[derive(Default, Deserialize)]
pub struct TextLogHandler {
    #[serde(default)]
    output: String,

    #[serde(skip)]
    target: OutputTarget,
}

impl TextLogHandler {
    fn render(&self, record: &Record) -> String {
        format!(
            "{} {:<5} {}: {}",
            Utc::now().to_rfc3339(),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Module for TextLogHandler {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        if raw.is_null() {
            return Ok(());
        }
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "logger.text".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, _ctx: &LoadContext) -> crate::module::Result<()> {
        self.target = open_output(&self.output)?;
        Ok(())
    }

    fn as_log_handler(&self) -> Option<&dyn LogHandler> {
        Some(self)
    }
}

impl LogHandler for TextLogHandler {
    fn write_record(&self, record: &Record) {
        emit(&self.target, &self.render(record));
    }
}

/// One JSON object per line, suitable for log shippers.
#[derive(Default, Deserialize)]
pub struct JsonLogHandler {
    #[serde(default)]
    output: String,

    #[serde(skip)]
    target: OutputTarget,
}

impl JsonLogHandler {
    fn render(&self, record: &Record) -> String {
        serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "level": record.level().to_string(),
            "target": record.target(),
            "msg": record.args().to_string(),
        })
        .to_string()
    }
}

impl Module for JsonLogHandler {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        if raw.is_null() {
            return Ok(());
        }
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "logger.json".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, _ctx: &LoadContext) -> crate::module::Result<()> {
        self.target = open_output(&self.output)?;
        Ok(())
    }

    fn as_log_handler(&self) -> Option<&dyn LogHandler> {
        Some(self)
    }
}

impl LogHandler for JsonLogHandler {
    fn write_record(&self, record: &Record) {
        emit(&self.target, &self.render(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_parse_level() {
        assert_eq!(LevelFilter::Debug, parse_level("DEBUG"));
        assert_eq!(LevelFilter::Debug, parse_level("debug"));
        assert_eq!(LevelFilter::Info, parse_level("INFO"));
        assert_eq!(LevelFilter::Warn, parse_level("WARN"));
        assert_eq!(LevelFilter::Error, parse_level("ERROR"));
        // unknown levels fall back to INFO
        assert_eq!(LevelFilter::Info, parse_level("verbose"));
    }

    #[test]
    fn test_text_render() {
        let handler = TextLogHandler::default();
        let line = handler.render(
            &Record::builder()
                .level(Level::Info)
                .target("meridian::dns")
                .args(format_args!("server started"))
                .build(),
        );

        assert!(line.contains("INFO"));
        assert!(line.contains("meridian::dns"));
        assert!(line.ends_with("server started"));
    }

    #[test]
    fn test_json_render() {
        let handler = JsonLogHandler::default();
        let line = handler.render(
            &Record::builder()
                .level(Level::Warn)
                .target("meridian::dns")
                .args(format_args!("upstream failed"))
                .build(),
        );

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!("WARN", value["level"]);
        assert_eq!("meridian::dns", value["target"]);
        assert_eq!("upstream failed", value["msg"]);
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_output_targets() {
        assert!(matches!(open_output(""), Ok(OutputTarget::Stdout)));
        assert!(matches!(open_output("stdout"), Ok(OutputTarget::Stdout)));
        assert!(matches!(open_output("stderr"), Ok(OutputTarget::Stderr)));
        // an unopenable path is a configuration error
        assert!(open_output("/nonexistent-dir/meridian.log").is_err());
    }

    #[test]
    fn test_handler_hydrates_output_option() {
        let mut handler = JsonLogHandler::default();
        handler
            .hydrate(&serde_json::json!({
                "level": "INFO",
                "handler": "logger.json",
                "output": "stderr"
            }))
            .unwrap();
        assert_eq!("stderr", handler.output);
    }

    #[test]
    fn test_setup_rejects_unknown_handler() {
        crate::module::register_builtin_modules();

        let config = LoggingConfig {
            level: Some("INFO".to_string()),
            handler: Some("logger.syslog".to_string()),
            options: serde_json::Map::new(),
        };
        assert!(setup_logging(Some(&config)).is_err());
    }

    #[test]
    fn test_setup_with_builtin_handlers() {
        crate::module::register_builtin_modules();

        let config = LoggingConfig {
            level: Some("DEBUG".to_string()),
            handler: Some("logger.json".to_string()),
            options: serde_json::Map::new(),
        };
        assert!(setup_logging(Some(&config)).is_ok());
        assert!(setup_logging(None).is_ok());
    }
}
