use backtrace::Backtrace;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    default_level: LogLevel,
    level_map: HashMap<String, LogLevel>,
    // Possibly a file, otherwise stderr
    sink: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = Mutex::new(init_globals());
}

/// `SYSFAULT_LOG` is a comma separated list of `level` or `module=level`
/// entries, e.g. `SYSFAULT_LOG=warn,thread_monitor=debug`. The sink is stderr
/// unless `SYSFAULT_LOG_FILE` names a file to append to.
fn init_globals() -> LogGlobals {
    let mut default_level = LogWarn;
    let mut level_map: HashMap<String, LogLevel> = HashMap::new();
    if let Ok(spec) = env::var("SYSFAULT_LOG") {
        for entry in spec.split(',').filter(|e| !e.is_empty()) {
            match entry.find('=') {
                Some(loc) => {
                    if let Some(level) = parse_level(&entry[loc + 1..]) {
                        level_map.insert(entry[..loc].to_owned(), level);
                    }
                }
                None => {
                    if let Some(level) = parse_level(entry) {
                        default_level = level;
                    }
                }
            }
        }
    }

    let sink: Box<dyn Write + Send> = match env::var("SYSFAULT_LOG_FILE") {
        Ok(path) => match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Box::new(f),
            Err(_) => Box::new(io::stderr()),
        },
        Err(_) => Box::new(io::stderr()),
    };

    LogGlobals {
        default_level,
        level_map,
        sink,
    }
}

fn parse_level(name: &str) -> Option<LogLevel> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" => Some(LogFatal),
        "error" => Some(LogError),
        "warn" => Some(LogWarn),
        "info" => Some(LogInfo),
        "debug" => Some(LogDebug),
        _ => None,
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Given a module path what is the corresponding module name?
fn module_leaf(module_path: &str) -> &str {
    module_path.rsplit("::").next().unwrap_or(module_path)
}

/// Never call this from signal-handler context; it locks and may allocate.
pub fn write_log(level: LogLevel, file: &str, line: u32, module_path: &str, args: fmt::Arguments) {
    let mut g = match LOG_GLOBALS.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let module = module_leaf(module_path);
    let enabled = level == LogFatal || level <= *g.level_map.get(module).unwrap_or(&g.default_level);
    if !enabled {
        return;
    }
    let _ = if level <= LogError {
        writeln!(g.sink, "[{}] {}:{} {}", level_name(level), file, line, args)
    } else {
        writeln!(g.sink, "[{}] [{}] {}", level_name(level), module, args)
    };
    let _ = g.sink.flush();
}

pub fn notifying_abort(bt: Backtrace) -> ! {
    let mut err = io::stderr();
    let _ = write!(err, "=== Start sysfault backtrace:\n{:?}\n=== End sysfault backtrace\n", bt);
    std::process::abort();
}

macro_rules! log {
    ($level:expr, $($args:tt)*) => {
        crate::log::write_log(
            $level,
            file!(),
            line!(),
            module_path!(),
            format_args!($($args)*),
        )
    };
}

macro_rules! fatal {
    ($($args:tt)*) => {{
        crate::log::write_log(
            crate::log::LogLevel::LogFatal,
            file!(),
            line!(),
            module_path!(),
            format_args!($($args)*),
        );
        crate::log::notifying_abort(backtrace::Backtrace::new())
    }};
}
