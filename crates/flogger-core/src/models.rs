//! Data models for flogger.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{FloggerError, Result};

/// Time key of a data point (epoch, iteration, tick...).
pub type Key = u64;

/// Data of one entry, ordered by key.
pub type Series = BTreeMap<Key, Value>;

/// Default number of executors for the thread and process pools.
pub const DEFAULT_PARALLELISM: usize = 5;

/// A single logged value.
///
/// Serializes as plain JSON, except non-finite floats which JSON cannot hold:
/// they are written as `{"$float": "NaN" | "inf" | "-inf"}` and read back as
/// [`Value::Float`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ValueRepr")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

const NON_FINITE_KEY: &str = "$float";

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    NonFinite {
        #[serde(rename = "$float")]
        float: String,
    },
    Text(String),
    List(Vec<Value>),
}

impl TryFrom<ValueRepr> for Value {
    type Error = String;

    fn try_from(repr: ValueRepr) -> std::result::Result<Self, Self::Error> {
        Ok(match repr {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(v) => Value::Bool(v),
            ValueRepr::Int(v) => Value::Int(v),
            ValueRepr::Float(v) => Value::Float(v),
            ValueRepr::NonFinite { float } => Value::Float(match float.as_str() {
                "NaN" => f64::NAN,
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                other => return Err(format!("unknown non-finite float `{other}`")),
            }),
            ValueRepr::Text(v) => Value::Text(v),
            ValueRepr::List(v) => Value::List(v),
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            Value::Float(v) => {
                let name = if v.is_nan() {
                    "NaN"
                } else if v.is_sign_positive() {
                    "inf"
                } else {
                    "-inf"
                };
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NON_FINITE_KEY, name)?;
                map.end()
            }
            Value::Text(v) => serializer.serialize_str(v),
            Value::List(items) => items.serialize(serializer),
        }
    }
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// The three moments at which handlers are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Push,
    Dump,
    Reset,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Push => write!(f, "push"),
            Event::Dump => write!(f, "dump"),
            Event::Reset => write!(f, "reset"),
        }
    }
}

/// Executor used to run handlers.
///
/// `Sync` and `Silent` run against a local store, `Thread` and `Process` against
/// a shared one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PoolKind {
    /// Handlers run right away on the caller's thread.
    #[default]
    Sync,
    /// Handlers never run.
    Silent,
    /// Handlers run on a fixed-size pool of background threads.
    Thread { workers: usize },
    /// Handlers run on a fixed-size pool of worker processes.
    Process { workers: usize },
}

impl PoolKind {
    /// Map a pool name (`"sync"`, `"silent"`, `"thread"`, `"process"`) and a
    /// parallelism to a pool kind. Parallelism is ignored for the inline pools.
    pub fn parse(kind: &str, parallelism: usize) -> Result<Self> {
        let pool = match kind {
            "sync" => PoolKind::Sync,
            "silent" => PoolKind::Silent,
            "thread" => PoolKind::Thread {
                workers: parallelism,
            },
            "process" => PoolKind::Process {
                workers: parallelism,
            },
            other => {
                return Err(FloggerError::configuration(format!(
                    "unknown pool type `{other}`"
                )))
            }
        };
        pool.validate()?;
        Ok(pool)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PoolKind::Thread { workers: 0 } | PoolKind::Process { workers: 0 } => Err(
                FloggerError::configuration(format!("{} pool needs at least one worker", self.label())),
            ),
            _ => Ok(()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PoolKind::Sync => "sync",
            PoolKind::Silent => "silent",
            PoolKind::Thread { .. } => "thread",
            PoolKind::Process { .. } => "process",
        }
    }

    /// Whether this pool needs the shared store variant.
    pub fn needs_shared_store(&self) -> bool {
        matches!(self, PoolKind::Thread { .. } | PoolKind::Process { .. })
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Thread { workers } | PoolKind::Process { workers } => {
                write!(f, "{}({workers})", self.label())
            }
            _ => write!(f, "{}", self.label()),
        }
    }
}

/// Configuration of a data logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Display name used in every log record (default: "data-logger")
    pub name: String,
    /// Root directory handed to every handler (default: ".")
    pub path: PathBuf,
    /// Executor for handlers (default: sync)
    pub pool: PoolKind,
    /// Executable launched by the process pool (default: the current executable)
    pub worker_program: Option<PathBuf>,
    /// Upper bound on a single sleep of the wait barrier, in milliseconds (default: 100)
    pub poll_interval_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            name: "data-logger".to_string(),
            path: PathBuf::from("."),
            pool: PoolKind::Sync,
            worker_program: None,
            poll_interval_ms: 100,
        }
    }
}

impl LoggerConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: PoolKind) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Load a configuration from a YAML file. A missing file yields the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let config: Self = crate::storage::load_yaml(path)?;
        config.pool.validate()?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: &Path) -> Result<()> {
        crate::storage::save_yaml(path, self)
    }
}
