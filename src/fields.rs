//! Field-value generators.
//!
//! Every mutable column is fed by a named generator. Profiles install
//! defaults per (table, column); operators override them with
//! `--field <table>.<column>=<fn>(args)`. Generators are instantiated per
//! worker and own their rng, so `generate` takes `&mut self`.

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::ConfigError;
use crate::driver::CqlValue;

/// A (table, column) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Field {
    pub table: String,
    pub column: String,
}

impl Field {
    pub fn new(table: &str, column: &str) -> Self {
        Self { table: table.to_string(), column: column.to_string() }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

pub trait FieldGenerator: Send {
    fn generate(&mut self) -> CqlValue;
}

/// A named generator plus its scalar arguments, before instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorCall {
    pub name: String,
    pub args: Vec<i64>,
}

impl GeneratorCall {
    pub fn new(name: &str, args: &[i64]) -> Self {
        Self { name: name.to_string(), args: args.to_vec() }
    }

    pub fn instantiate(&self) -> Result<Box<dyn FieldGenerator>, ConfigError> {
        build_generator(&self.name, &self.args)
    }
}

pub struct GeneratorSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// Every generator the registry knows, in listing order.
pub const GENERATORS: &[GeneratorSpec] = &[
    GeneratorSpec {
        name: "random",
        description: "random alphanumeric string, length uniform in [min, max]",
    },
    GeneratorSpec {
        name: "book",
        description: "space-joined prose words, count uniform in [min, max]",
    },
    GeneratorSpec { name: "names", description: "random first and last name" },
    GeneratorSpec { name: "cities", description: "random city name" },
    GeneratorSpec { name: "sequence", description: "monotonic 64-bit integer, optional start" },
];

fn build_generator(name: &str, args: &[i64]) -> Result<Box<dyn FieldGenerator>, ConfigError> {
    let bad_args = |reason: &str| ConfigError::InvalidFieldOverride {
        input: format!("{name}({args:?})"),
        reason: reason.to_string(),
    };
    let span = |args: &[i64], lo: i64, hi: i64| -> Result<(usize, usize), ConfigError> {
        let (min, max) = match args {
            [] => (lo, hi),
            [min, max] if min <= max && *min >= 0 => (*min, *max),
            _ => return Err(bad_args("expected (min, max) with 0 <= min <= max")),
        };
        Ok((min as usize, max as usize))
    };
    match name {
        "random" => {
            let (min, max) = span(args, 32, 128)?;
            Ok(Box::new(RandomString { min, max, rng: SmallRng::from_rng(&mut rand::rng()) }))
        }
        "book" => {
            let (min, max) = span(args, 5, 50)?;
            Ok(Box::new(BookWords { min, max, rng: SmallRng::from_rng(&mut rand::rng()) }))
        }
        "names" => {
            if !args.is_empty() {
                return Err(bad_args("names takes no arguments"));
            }
            Ok(Box::new(Names { rng: SmallRng::from_rng(&mut rand::rng()) }))
        }
        "cities" => {
            if !args.is_empty() {
                return Err(bad_args("cities takes no arguments"));
            }
            Ok(Box::new(Cities { rng: SmallRng::from_rng(&mut rand::rng()) }))
        }
        "sequence" => {
            let start = match args {
                [] => 0,
                [start] => *start,
                _ => return Err(bad_args("sequence takes at most a start value")),
            };
            Ok(Box::new(Sequence { next: start }))
        }
        other => Err(ConfigError::UnknownFieldGenerator(other.to_string())),
    }
}

/// Resolved generator assignments for a run: profile defaults overlaid with
/// user overrides.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    entries: BTreeMap<Field, GeneratorCall>,
}

impl FieldMap {
    pub fn from_defaults(defaults: Vec<(Field, GeneratorCall)>) -> Self {
        Self { entries: defaults.into_iter().collect() }
    }

    /// Applies `--field` overrides. Keys are `<table>.<column>`, values are
    /// `<fn>(args)`. Overrides for columns the profile never writes are
    /// rejected so typos surface before any thread starts.
    pub fn apply_overrides(
        &mut self,
        overrides: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        for (target, call) in overrides {
            let field = parse_field(target)?;
            let call = parse_call(call)?;
            // instantiate once to validate name and arguments eagerly
            call.instantiate()?;
            if !self.entries.contains_key(&field) {
                return Err(ConfigError::InvalidFieldOverride {
                    input: target.clone(),
                    reason: "profile has no such field".to_string(),
                });
            }
            self.entries.insert(field, call);
        }
        Ok(())
    }

    pub fn call_for(&self, field: &Field) -> Option<&GeneratorCall> {
        self.entries.get(field)
    }

    /// Fresh generator instance for one worker.
    pub fn instantiate(&self, field: &Field) -> Result<Box<dyn FieldGenerator>, ConfigError> {
        match self.entries.get(field) {
            Some(call) => call.instantiate(),
            None => Err(ConfigError::InvalidFieldOverride {
                input: field.to_string(),
                reason: "no generator bound".to_string(),
            }),
        }
    }
}

fn parse_field(input: &str) -> Result<Field, ConfigError> {
    match input.split_once('.') {
        Some((table, column)) if !table.is_empty() && !column.is_empty() => {
            Ok(Field::new(table, column))
        }
        _ => Err(ConfigError::InvalidFieldOverride {
            input: input.to_string(),
            reason: "expected <table>.<column>".to_string(),
        }),
    }
}

/// Parses `<fn>` or `<fn>(<int>,<int>,..)`.
fn parse_call(input: &str) -> Result<GeneratorCall, ConfigError> {
    let bad = |reason: &str| ConfigError::InvalidFieldOverride {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    let input = input.trim();
    let (name, args) = match input.split_once('(') {
        None => (input, Vec::new()),
        Some((name, rest)) => {
            let inner = rest.strip_suffix(')').ok_or_else(|| bad("missing closing paren"))?;
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner
                    .split(',')
                    .map(|a| a.trim().parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| bad("arguments must be integers"))?
            };
            (name, args)
        }
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(bad("bad generator name"));
    }
    Ok(GeneratorCall { name: name.to_string(), args })
}

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const WORDS: &[&str] = &[
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "river", "stone", "harbor",
    "window", "summer", "letter", "garden", "signal", "copper", "velvet", "anchor", "meadow",
    "lantern", "thunder", "quiet", "paper", "marble", "forest", "ember", "hollow", "crystal",
    "winter",
];

const FIRST_NAMES: &[&str] = &[
    "Ada", "Grace", "Alan", "Edsger", "Barbara", "Donald", "Leslie", "Radia", "Ken", "Dennis",
    "Margaret", "Tim", "Vint", "Frances", "John", "Jean",
];

const LAST_NAMES: &[&str] = &[
    "Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Knuth", "Lamport", "Perlman",
    "Thompson", "Ritchie", "Hamilton", "Berners-Lee", "Cerf", "Allen", "Backus", "Bartik",
];

const CITIES: &[&str] = &[
    "Amsterdam", "Austin", "Berlin", "Bogota", "Cape Town", "Copenhagen", "Dublin", "Helsinki",
    "Lisbon", "Melbourne", "Nairobi", "Osaka", "Porto", "Seoul", "Toronto", "Warsaw",
];

struct RandomString {
    min: usize,
    max: usize,
    rng: SmallRng,
}

impl FieldGenerator for RandomString {
    fn generate(&mut self) -> CqlValue {
        let len = self.rng.random_range(self.min..=self.max);
        let s: String = (0..len)
            .map(|_| ALPHANUMERIC[self.rng.random_range(0..ALPHANUMERIC.len())] as char)
            .collect();
        CqlValue::Text(s)
    }
}

struct BookWords {
    min: usize,
    max: usize,
    rng: SmallRng,
}

impl FieldGenerator for BookWords {
    fn generate(&mut self) -> CqlValue {
        let count = self.rng.random_range(self.min..=self.max);
        let words: Vec<&str> =
            (0..count).map(|_| WORDS[self.rng.random_range(0..WORDS.len())]).collect();
        CqlValue::Text(words.join(" "))
    }
}

struct Names {
    rng: SmallRng,
}

impl FieldGenerator for Names {
    fn generate(&mut self) -> CqlValue {
        let first = FIRST_NAMES[self.rng.random_range(0..FIRST_NAMES.len())];
        let last = LAST_NAMES[self.rng.random_range(0..LAST_NAMES.len())];
        CqlValue::Text(format!("{first} {last}"))
    }
}

struct Cities {
    rng: SmallRng,
}

impl FieldGenerator for Cities {
    fn generate(&mut self) -> CqlValue {
        CqlValue::Text(CITIES[self.rng.random_range(0..CITIES.len())].to_string())
    }
}

struct Sequence {
    next: i64,
}

impl FieldGenerator for Sequence {
    fn generate(&mut self) -> CqlValue {
        let value = self.next;
        self.next = self.next.wrapping_add(1);
        CqlValue::BigInt(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: CqlValue) -> String {
        match value {
            CqlValue::Text(s) => s,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn random_respects_length_span() {
        let mut generator = build_generator("random", &[4, 8]).unwrap();
        for _ in 0..100 {
            let len = text(generator.generate()).len();
            assert!((4..=8).contains(&len));
        }
    }

    #[test]
    fn book_joins_words() {
        let mut generator = build_generator("book", &[3, 3]).unwrap();
        let value = text(generator.generate());
        assert_eq!(value.split(' ').count(), 3);
    }

    #[test]
    fn sequence_is_monotonic() {
        let mut generator = build_generator("sequence", &[41]).unwrap();
        assert_eq!(generator.generate(), CqlValue::BigInt(41));
        assert_eq!(generator.generate(), CqlValue::BigInt(42));
    }

    #[test]
    fn call_grammar() {
        assert_eq!(parse_call("random(10,20)").unwrap(), GeneratorCall::new("random", &[10, 20]));
        assert_eq!(parse_call("names").unwrap(), GeneratorCall::new("names", &[]));
        assert_eq!(parse_call("book()").unwrap(), GeneratorCall::new("book", &[]));
        assert!(parse_call("random(10").is_err());
        assert!(parse_call("random(a,b)").is_err());
        assert!(parse_call("").is_err());
    }

    #[test]
    fn overrides_replace_defaults_and_reject_unknown_fields() {
        let mut map = FieldMap::from_defaults(vec![(
            Field::new("keyvalue", "value"),
            GeneratorCall::new("random", &[32, 64]),
        )]);

        let mut overrides = BTreeMap::new();
        overrides.insert("keyvalue.value".to_string(), "book(2,4)".to_string());
        map.apply_overrides(&overrides).unwrap();
        assert_eq!(
            map.call_for(&Field::new("keyvalue", "value")).unwrap().name,
            "book"
        );

        let mut unknown_field = BTreeMap::new();
        unknown_field.insert("keyvalue.nope".to_string(), "random".to_string());
        assert!(map.apply_overrides(&unknown_field).is_err());

        let mut unknown_generator = BTreeMap::new();
        unknown_generator.insert("keyvalue.value".to_string(), "lorem".to_string());
        assert!(matches!(
            map.apply_overrides(&unknown_generator),
            Err(ConfigError::UnknownFieldGenerator(_))
        ));
    }
}
