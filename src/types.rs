/// Type Conversion Module
///
/// Bidirectional coercion between host values and the representation a
/// driver expects. Conversions are organized as filter chains:
///
/// - A [`Filter`] pairs a check with a conversion.
/// - A [`FilterList`] runs its filters in order and applies the first one
///   whose check passes; if none passes the value is returned untouched.
///   Every list starts with the null filter, so null always maps to null.
/// - A [`TypeMap`] selects a filter list by key, falling back to its
///   `default` list when the key has no entry.
///
/// Input conversion (binds going to the database) is keyed by the value's
/// own kind. Output conversion (row fields coming back) is keyed by the
/// column's [`HostType`].

use crate::core::db::schema::{Column, HostType};
use crate::core::{Value, ValueKind, DEFAULT_DATETIME_FORMAT};
use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

/// Predicate deciding whether a filter applies
pub type Check = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Conversion applied when the check passes
pub type Conversion = Arc<dyn Fn(Value) -> Value + Send + Sync>;

static STR_IS_BOOLEAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(t(rue)?|f(alse)?|1|0)$").expect("static regex"));
static STR_IS_TRUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(t(rue)?|1)$").expect("static regex"));

/// A check/conversion pair
#[derive(Clone)]
pub struct Filter {
    check: Check,
    convert: Conversion,
}

impl Filter {
    pub fn new<C, F>(check: C, convert: F) -> Self
    where
        C: Fn(&Value) -> bool + Send + Sync + 'static,
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Filter {
            check: Arc::new(check),
            convert: Arc::new(convert),
        }
    }

    pub fn applies(&self, value: &Value) -> bool {
        (self.check)(value)
    }

    pub fn apply(&self, value: Value) -> Value {
        (self.convert)(value)
    }

    /// Null in, null out
    pub fn null() -> Self {
        Filter::new(Value::is_null, |_| Value::Null)
    }

    /// Any integer to its decimal text
    pub fn from_integer() -> Self {
        Filter::new(
            |v| matches!(v, Value::Integer(_)),
            |v| Value::Text(v.to_string()),
        )
    }

    /// Any float to its text form
    pub fn from_float() -> Self {
        Filter::new(
            |v| matches!(v, Value::Float(_)),
            |v| match v {
                Value::Float(x) => Value::Text(format_float(x)),
                other => other,
            },
        )
    }

    /// Decimals in plain (non-scientific) notation
    pub fn from_decimal() -> Self {
        Filter::new(
            |v| matches!(v, Value::Decimal(_)),
            |v| Value::Text(v.to_string()),
        )
    }

    /// Date-times rendered with [`DEFAULT_DATETIME_FORMAT`]
    pub fn from_datetime() -> Self {
        Filter::new(
            |v| matches!(v, Value::DateTime(_)),
            |v| match v {
                Value::DateTime(dt) => Value::Text(dt.format(DEFAULT_DATETIME_FORMAT).to_string()),
                other => other,
            },
        )
    }

    /// Booleans as `TRUE` / `FALSE`
    pub fn from_boolean() -> Self {
        Filter::new(
            |v| matches!(v, Value::Boolean(_)),
            |v| match v {
                Value::Boolean(true) => Value::Text("TRUE".to_string()),
                Value::Boolean(false) => Value::Text("FALSE".to_string()),
                other => other,
            },
        )
    }

    /// Integer-looking text to an integer
    pub fn str_to_integer() -> Self {
        Filter::new(
            |v| v.as_str().map_or(false, |s| s.trim().parse::<i64>().is_ok()),
            |v| match v.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
                Some(i) => Value::Integer(i),
                None => v,
            },
        )
    }

    /// Float-looking text to a float
    pub fn str_to_float() -> Self {
        Filter::new(
            |v| v.as_str().map_or(false, |s| s.trim().parse::<f64>().is_ok()),
            |v| match v.as_str().and_then(|s| s.trim().parse::<f64>().ok()) {
                Some(x) => Value::Float(x),
                None => v,
            },
        )
    }

    /// Decimal-looking text to a decimal
    pub fn str_to_decimal() -> Self {
        Filter::new(
            |v| v.as_str().map_or(false, |s| Decimal::from_str(s.trim()).is_ok()),
            |v| match v.as_str().and_then(|s| Decimal::from_str(s.trim()).ok()) {
                Some(d) => Value::Decimal(d),
                None => v,
            },
        )
    }

    /// Integers and floats widened to decimals
    pub fn number_to_decimal() -> Self {
        Filter::new(
            |v| matches!(v, Value::Integer(_) | Value::Float(_)),
            |v| match v {
                Value::Integer(i) => Value::Decimal(Decimal::from(i)),
                Value::Float(x) => Decimal::try_from(x).map(Value::Decimal).unwrap_or(Value::Float(x)),
                other => other,
            },
        )
    }

    /// Text parsed with the given strftime-style format
    pub fn strptime(format: &'static str) -> Self {
        Filter::new(
            move |v| {
                v.as_str()
                    .map_or(false, |s| DateTime::parse_from_str(s.trim(), format).is_ok())
            },
            move |v| match v.as_str().and_then(|s| DateTime::parse_from_str(s.trim(), format).ok()) {
                Some(dt) => Value::DateTime(dt),
                None => v,
            },
        )
    }

    /// SQL truth strings (`t`, `true`, `f`, `false`, `1`, `0`) to booleans
    pub fn str_to_boolean() -> Self {
        Filter::new(
            |v| v.as_str().map_or(false, |s| STR_IS_BOOLEAN.is_match(s)),
            |v| match v.as_str() {
                Some(s) => Value::Boolean(STR_IS_TRUE.is_match(s)),
                None => v,
            },
        )
    }

    /// Integer 0/1 to booleans
    pub fn integer_to_boolean() -> Self {
        Filter::new(
            |v| matches!(v, Value::Integer(0) | Value::Integer(1)),
            |v| match v {
                Value::Integer(i) => Value::Boolean(i == 1),
                other => other,
            },
        )
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter")
    }
}

/// Formats floats so whole numbers keep a trailing `.0`
fn format_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        x.to_string()
    }
}

/// Ordered, first-match-wins chain of filters
#[derive(Clone, Debug)]
pub struct FilterList {
    filters: Vec<Filter>,
}

impl Default for FilterList {
    fn default() -> Self {
        FilterList::new()
    }
}

impl FilterList {
    /// A list holding only the null filter
    pub fn new() -> Self {
        FilterList {
            filters: vec![Filter::null()],
        }
    }

    /// A list holding the null filter followed by `filters`
    pub fn with(filters: Vec<Filter>) -> Self {
        let mut list = FilterList::new();
        list.filters.extend(filters);
        list
    }

    pub fn push(&mut self, filter: Filter) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the chain: the first filter whose check passes converts the value.
    pub fn execute(&self, value: Value) -> Value {
        match self.filters.iter().find(|f| f.applies(&value)) {
            Some(filter) => filter.apply(value),
            None => value,
        }
    }
}

/// Filter lists keyed by type, with a mandatory fallback
#[derive(Clone, Debug)]
pub struct TypeMap<K: Eq + Hash> {
    entries: HashMap<K, FilterList>,
    default: FilterList,
}

impl<K: Eq + Hash> Default for TypeMap<K> {
    fn default() -> Self {
        TypeMap::empty()
    }
}

impl<K: Eq + Hash> TypeMap<K> {
    /// A map with no entries and a null-only default
    pub fn empty() -> Self {
        TypeMap {
            entries: HashMap::new(),
            default: FilterList::new(),
        }
    }

    pub fn insert(&mut self, key: K, list: FilterList) -> Option<FilterList> {
        self.entries.insert(key, list)
    }

    pub fn remove(&mut self, key: &K) -> Option<FilterList> {
        self.entries.remove(key)
    }

    pub fn set_default(&mut self, list: FilterList) {
        self.default = list;
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn default_list(&self) -> &FilterList {
        &self.default
    }

    /// The list registered for `key`, or the default list
    pub fn lookup(&self, key: &K) -> &FilterList {
        self.entries.get(key).unwrap_or(&self.default)
    }
}

/// Input (host -> database) map keyed by value kind
pub type InputTypeMap = TypeMap<ValueKind>;
/// Output (database -> host) map keyed by column host type
pub type OutputTypeMap = TypeMap<HostType>;

impl TypeMap<ValueKind> {
    /// Default input conversions: scalars become wire text.
    pub fn input_defaults() -> Self {
        let mut map = TypeMap::empty();
        map.insert(ValueKind::Integer, FilterList::with(vec![Filter::from_integer()]));
        map.insert(ValueKind::Float, FilterList::with(vec![Filter::from_float()]));
        map.insert(ValueKind::Decimal, FilterList::with(vec![Filter::from_decimal()]));
        map.insert(ValueKind::DateTime, FilterList::with(vec![Filter::from_datetime()]));
        map.insert(ValueKind::Boolean, FilterList::with(vec![Filter::from_boolean()]));
        map
    }
}

impl TypeMap<HostType> {
    /// Default output conversions keyed by column host type.
    pub fn output_defaults() -> Self {
        let mut map = TypeMap::empty();
        map.insert(HostType::Integer, FilterList::with(vec![Filter::str_to_integer()]));
        map.insert(HostType::Float, FilterList::with(vec![Filter::str_to_float()]));
        map.insert(
            HostType::Decimal,
            FilterList::with(vec![Filter::str_to_decimal(), Filter::number_to_decimal()]),
        );
        map.insert(
            HostType::DateTime,
            FilterList::with(vec![Filter::strptime(DEFAULT_DATETIME_FORMAT)]),
        );
        map.insert(
            HostType::Timestamp,
            FilterList::with(vec![Filter::strptime(DEFAULT_DATETIME_FORMAT)]),
        );
        map.insert(
            HostType::Boolean,
            FilterList::with(vec![Filter::str_to_boolean(), Filter::integer_to_boolean()]),
        );
        map
    }
}

/// Converts a bind value for the wire using the input map.
pub fn convert_in(value: Value, map: &InputTypeMap) -> Value {
    map.lookup(&value.kind()).execute(value)
}

/// Converts a fetched value for the host using the column's host type.
pub fn convert_out(value: Value, column: &Column, map: &OutputTypeMap) -> Value {
    map.lookup(&column.host_type).execute(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn tcc(host_type: HostType) -> Column {
        Column::new("test", host_type)
    }

    #[test]
    fn test_default_maps_have_expected_keys() {
        let out_types = OutputTypeMap::output_defaults();
        assert!(out_types.contains_key(&HostType::Integer));
        assert!(out_types.contains_key(&HostType::Decimal));
        assert!(out_types.contains_key(&HostType::DateTime));

        let in_types = InputTypeMap::input_defaults();
        assert!(in_types.contains_key(&ValueKind::Integer));
        assert!(in_types.contains_key(&ValueKind::Decimal));
        assert!(in_types.contains_key(&ValueKind::DateTime));
        assert_eq!(in_types.default_list().len(), 1);
    }

    #[test]
    fn test_out_basic_convert() {
        let out_types = OutputTypeMap::output_defaults();

        assert_eq!(
            convert_out(Value::from("1"), &tcc(HostType::Integer), &out_types),
            Value::Integer(1)
        );
        assert_eq!(convert_out(Value::Null, &tcc(HostType::Integer), &out_types), Value::Null);
        assert_eq!(
            convert_out(Value::from("1.0"), &tcc(HostType::Decimal), &out_types),
            Value::Decimal(Decimal::from_str("1.0").unwrap())
        );
        assert_eq!(convert_out(Value::Null, &tcc(HostType::Decimal), &out_types), Value::Null);
        assert_eq!(
            convert_out(Value::Float(1.0), &tcc(HostType::default()), &out_types),
            Value::Float(1.0)
        );
        // Unparseable text is left alone
        assert_eq!(
            convert_out(Value::from("abc"), &tcc(HostType::Integer), &out_types),
            Value::from("abc")
        );
    }

    #[test]
    fn test_out_boolean_convert() {
        let out_types = OutputTypeMap::output_defaults();
        let col = tcc(HostType::Boolean);

        for (input, expected) in [("t", true), ("TRUE", true), ("1", true), ("f", false), ("False", false), ("0", false)] {
            assert_eq!(convert_out(Value::from(input), &col, &out_types), Value::Boolean(expected));
        }
        assert_eq!(convert_out(Value::Integer(1), &col, &out_types), Value::Boolean(true));
        assert_eq!(convert_out(Value::from("yes"), &col, &out_types), Value::from("yes"));
    }

    #[test]
    fn test_datetime_round_trip() {
        let in_types = InputTypeMap::input_defaults();
        let out_types = OutputTypeMap::output_defaults();
        let dt = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 29, 13, 45, 10)
            .unwrap();

        let wire = convert_in(Value::DateTime(dt), &in_types);
        assert_eq!(wire, Value::from("2024-02-29 13:45:10 +0100"));

        let back = convert_out(wire, &tcc(HostType::DateTime), &out_types);
        assert_eq!(back, Value::DateTime(dt));
    }

    #[test]
    fn test_in_basic_convert() {
        let in_types = InputTypeMap::input_defaults();

        assert_eq!(convert_in(Value::Integer(1), &in_types), Value::from("1"));
        assert_eq!(convert_in(Value::Float(1.0), &in_types), Value::from("1.0"));
        assert_eq!(
            convert_in(Value::Decimal(Decimal::from_str("1.0").unwrap()), &in_types),
            Value::from("1.0")
        );
        assert_eq!(convert_in(Value::Boolean(false), &in_types), Value::from("FALSE"));
        assert_eq!(convert_in(Value::from("artsy"), &in_types), Value::from("artsy"));
        assert_eq!(convert_in(Value::Null, &in_types), Value::Null);
    }

    #[test]
    fn test_first_match_wins() {
        let mut list = FilterList::new();
        list.push(Filter::new(|v| v.as_i64().is_some(), |_| Value::from("first")));
        list.push(Filter::new(|v| v.as_i64().is_some(), |_| Value::from("second")));

        assert_eq!(list.execute(Value::Integer(3)), Value::from("first"));
        assert_eq!(list.execute(Value::Null), Value::Null);
        assert_eq!(list.execute(Value::from("x")), Value::from("x"));
    }

    #[test]
    fn test_missing_key_uses_default_list() {
        let mut map = OutputTypeMap::empty();
        map.set_default(FilterList::with(vec![Filter::str_to_integer()]));

        assert_eq!(
            convert_out(Value::from("12"), &tcc(HostType::String), &map),
            Value::Integer(12)
        );
    }
}
