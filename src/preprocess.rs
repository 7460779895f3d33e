/// Query Preprocessing Module
///
/// Substitutes bind values directly into query text as quoted literals, for
/// drivers (or callers) that cannot bind natively.
///
/// Placeholders:
/// - `?` takes the next positional bind, in order of appearance
/// - `?name` takes the named bind `name`
///
/// Placeholders inside single-quoted string literals are left alone.

use crate::core::{RdbiError, Result, Value};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"'(?:[^']|'')*'|\?([A-Za-z_][A-Za-z0-9_]*)?").expect("static regex")
});

/// Positional and named values for preprocessing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binds {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Binds {
    pub fn new() -> Self {
        Binds::default()
    }

    /// Appends a positional value
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a named value, replacing any previous one of the same name
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    /// Merges a map of named values; later maps win on conflicting names
    pub fn merge<I, K>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.named
            .extend(values.into_iter().map(|(name, value)| (name.into(), value)));
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }
}

impl From<Vec<Value>> for Binds {
    fn from(positional: Vec<Value>) -> Self {
        Binds {
            positional,
            named: HashMap::new(),
        }
    }
}

/// Default literal rendering: NULL, or the value's text in single quotes with
/// embedded quotes doubled. Blobs become hex literals.
pub fn quote_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Blob(_) => format!("X'{}'", value),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Replaces every placeholder in `query` with `quote(bind)`.
///
/// # Errors
///
/// `RdbiError::Bind` when a placeholder has no matching value.
///
/// # Examples
///
/// ```
/// use rdbi::preprocess::{preprocess, quote_value, Binds};
///
/// let binds = Binds::new().push("foo").named("id", 5);
/// let query = preprocess("select * from t where a = ? and b = ?id", &binds, quote_value).unwrap();
/// assert_eq!(query, "select * from t where a = 'foo' and b = '5'");
/// ```
pub fn preprocess<F>(query: &str, binds: &Binds, quote: F) -> Result<String>
where
    F: Fn(&Value) -> String,
{
    let mut output = String::with_capacity(query.len());
    let mut last = 0;
    let mut next_positional = 0;

    for captures in PLACEHOLDER.captures_iter(query) {
        let Some(matched) = captures.get(0) else { continue };
        if matched.as_str().starts_with('\'') {
            continue;
        }

        output.push_str(&query[last..matched.start()]);
        let value = match captures.get(1) {
            Some(name) => binds.get_named(name.as_str()).ok_or_else(|| {
                RdbiError::Bind(format!("no value for named placeholder ?{}", name.as_str()))
            })?,
            None => {
                let value = binds.positional.get(next_positional).ok_or_else(|| {
                    RdbiError::Bind(format!("no value for positional placeholder {}", next_positional + 1))
                })?;
                next_positional += 1;
                value
            }
        };
        output.push_str(&quote(value));
        last = matched.end();
    }

    output.push_str(&query[last..]);
    Ok(output)
}
