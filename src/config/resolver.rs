//! Layered option lookup for one job run
//!
//! A connector option is looked up, in order, in the runtime options passed to
//! the scrape call, the options persisted in the job's config snapshot, and
//! the source's default config. The first layer that *has* the key wins, even
//! when its value is `0`, `false` or `""`. Only a missing key or JSON `null`
//! falls through.

use serde_json::{Map, Value};

/// Option map used by every layer
pub type Options = Map<String, Value>;

/// Returns the first present value for `name` across `layers`
///
/// Layers are consulted in slice order. `null` counts as absent.
pub fn resolve<'a>(name: &str, layers: &[&'a Options]) -> Option<&'a Value> {
    layers
        .iter()
        .find_map(|layer| layer.get(name).filter(|value| !value.is_null()))
}

/// Resolves connector options for one job run
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    runtime: Options,
    snapshot: Options,
    source_defaults: Options,
}

impl ConfigResolver {
    /// Creates a resolver from the three option layers, highest precedence first
    pub fn new(runtime: Options, snapshot: Options, source_defaults: Options) -> Self {
        Self {
            runtime,
            snapshot,
            source_defaults,
        }
    }

    fn layers(&self) -> [&Options; 3] {
        [&self.runtime, &self.snapshot, &self.source_defaults]
    }

    /// First present value for `name`, if any layer has it
    pub fn get(&self, name: &str) -> Option<&Value> {
        resolve(name, &self.layers())
    }

    /// First present value for `name`, or the supplied hard default
    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.get(name).cloned().unwrap_or(default)
    }

    /// Resolved value as an unsigned integer
    ///
    /// Numeric strings are accepted since command-line options arrive as text.
    /// A present value of the wrong type yields `None`; it does not fall through.
    pub fn u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn u64_or(&self, name: &str, default: u64) -> u64 {
        self.u64(name).unwrap_or(default)
    }

    /// Resolved value as a float
    pub fn f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64_or(&self, name: &str, default: f64) -> f64 {
        self.f64(name).unwrap_or(default)
    }

    /// Resolved value as a boolean
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.bool(name).unwrap_or(default)
    }

    /// Resolved value as a string slice
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    pub fn str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.str(name).unwrap_or(default)
    }
}
