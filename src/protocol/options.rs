use serde_json::{json, Map, Value};

use super::error::DriverError;
use super::types::TERM_DB;

/// Output format preference for one pseudo-type family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Leave the pseudo-type object as received.
    Raw,
    /// Convert to the closest native JSON representation.
    #[default]
    Native,
}

impl Format {
    /// Parse a format option value. Anything but `"raw"` / `"native"` is
    /// an argument error.
    pub fn parse(key: &str, value: &Value) -> Result<Format, DriverError> {
        match value.as_str() {
            Some("raw") => Ok(Format::Raw),
            Some("native") => Ok(Format::Native),
            _ => Err(DriverError::Argument(format!(
                "`{}` must be \"raw\" or \"native\", got {}",
                key, value
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Format::Raw => "raw",
            Format::Native => "native",
        }
    }
}

/// The format preferences retained per token so the reader can decode
/// that token's responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub time: Format,
    pub group: Format,
    pub binary: Format,
}

/// Per-query options merged with the connection defaults by `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Database override for this query.
    pub db: Option<String>,
    /// Fire-and-forget mode: no waiter is registered, no response comes.
    pub noreply: bool,
    pub time_format: Format,
    pub group_format: Format,
    pub binary_format: Format,
    /// Ask the server to interleave feed state rows.
    pub include_states: bool,
    /// Unrecognized options, passed through to the server untouched.
    pub extra: Map<String, Value>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn noreply(mut self, noreply: bool) -> Self {
        self.noreply = noreply;
        self
    }

    pub fn time_format(mut self, format: Format) -> Self {
        self.time_format = format;
        self
    }

    pub fn group_format(mut self, format: Format) -> Self {
        self.group_format = format;
        self
    }

    pub fn binary_format(mut self, format: Format) -> Self {
        self.binary_format = format;
        self
    }

    pub fn include_states(mut self, include: bool) -> Self {
        self.include_states = include;
        self
    }

    /// Set one option from a raw JSON value, the way an option map arrives
    /// from an embedding application. Recognized keys are validated,
    /// `noreply` is coerced to a boolean, everything else passes through.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), DriverError> {
        match key {
            "db" => match value.as_str() {
                Some(name) => self.db = Some(name.to_string()),
                None => {
                    return Err(DriverError::Argument(format!(
                        "`db` must be a string, got {}",
                        value
                    )))
                }
            },
            "noreply" => self.noreply = !matches!(value, Value::Null | Value::Bool(false)),
            "time_format" => self.time_format = Format::parse(key, &value)?,
            "group_format" => self.group_format = Format::parse(key, &value)?,
            "binary_format" => self.binary_format = Format::parse(key, &value)?,
            "include_states" => {
                self.include_states = !matches!(value, Value::Null | Value::Bool(false))
            }
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    pub(crate) fn formats(&self) -> FormatOptions {
        FormatOptions {
            time: self.time_format,
            group: self.group_format,
            binary: self.binary_format,
        }
    }

    /// Assemble the global options object for the wire. The database name
    /// (per-query override, else the connection default) is wrapped as a
    /// DB term; the remaining values are trivial terms, i.e. literals.
    pub fn to_global_optargs(&self, default_db: Option<&str>) -> Value {
        let mut opts = Map::new();

        if let Some(db) = self.db.as_deref().or(default_db) {
            opts.insert("db".to_string(), json!([TERM_DB, [db]]));
        }
        if self.noreply {
            opts.insert("noreply".to_string(), Value::Bool(true));
        }
        if self.time_format != Format::default() {
            opts.insert("time_format".to_string(), json!(self.time_format.as_str()));
        }
        if self.group_format != Format::default() {
            opts.insert("group_format".to_string(), json!(self.group_format.as_str()));
        }
        if self.binary_format != Format::default() {
            opts.insert(
                "binary_format".to_string(),
                json!(self.binary_format.as_str()),
            );
        }
        if self.include_states {
            opts.insert("include_states".to_string(), Value::Bool(true));
        }
        for (key, value) in &self.extra {
            opts.insert(key.clone(), value.clone());
        }

        Value::Object(opts)
    }
}
