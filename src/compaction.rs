//! Compaction-option shortcuts.
//!
//! `--compaction` accepts either a full CQL map literal (passed through with
//! double quotes normalised to single quotes) or a shortcut of the form
//! `<strategy>(,<arg>)*` expanded to the strategy's option map.

use crate::config::ConfigError;

/// An expanded compaction strategy: class name plus option pairs, rendered
/// as a CQL map literal by [`CompactionOptions::to_cql`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOptions {
    Strategy { class: &'static str, options: Vec<(String, String)> },
    /// Input that matched no shortcut; emitted verbatim (quote-normalised).
    Raw(String),
}

impl CompactionOptions {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut parts = input.split(',');
        let head = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let invalid = |reason: &str| ConfigError::InvalidParameter {
            name: "compaction".to_string(),
            value: input.to_string(),
            reason: reason.to_string(),
        };
        match head {
            "stcs" => match args.as_slice() {
                [] => Ok(Self::strategy("SizeTieredCompactionStrategy", &[])),
                &[min, max] => Ok(Self::strategy(
                    "SizeTieredCompactionStrategy",
                    &[("min_threshold", min), ("max_threshold", max)],
                )),
                _ => Err(invalid("stcs takes zero or two arguments")),
            },
            "lcs" => match args.as_slice() {
                [] => Ok(Self::strategy("LeveledCompactionStrategy", &[])),
                &[size] => Ok(Self::strategy(
                    "LeveledCompactionStrategy",
                    &[("sstable_size_in_mb", size)],
                )),
                &[size, fanout] => Ok(Self::strategy(
                    "LeveledCompactionStrategy",
                    &[("sstable_size_in_mb", size), ("fanout_size", fanout)],
                )),
                _ => Err(invalid("lcs takes at most two arguments")),
            },
            "twcs" => match args.as_slice() {
                [] => Ok(Self::strategy("TimeWindowCompactionStrategy", &[])),
                &[size, unit] => {
                    let unit = unit.to_ascii_uppercase();
                    if !matches!(unit.as_str(), "MINUTES" | "HOURS" | "DAYS") {
                        return Err(invalid("window unit must be MINUTES, HOURS or DAYS"));
                    }
                    Ok(Self::strategy(
                        "TimeWindowCompactionStrategy",
                        &[
                            ("compaction_window_size", size),
                            ("compaction_window_unit", unit.as_str()),
                        ],
                    ))
                }
                _ => Err(invalid("twcs takes zero or two arguments")),
            },
            "ucs" => {
                let mut options = Vec::new();
                if !args.is_empty() {
                    options.push(("scaling_parameters".to_string(), args.join(",")));
                }
                Ok(Self::Strategy { class: "UnifiedCompactionStrategy", options })
            }
            _ => Ok(Self::Raw(input.replace('"', "'"))),
        }
    }

    fn strategy(class: &'static str, options: &[(&str, &str)]) -> Self {
        Self::Strategy {
            class,
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn to_cql(&self) -> String {
        match self {
            Self::Raw(raw) => raw.clone(),
            Self::Strategy { class, options } => {
                let mut out = format!("{{'class': '{class}'");
                for (key, value) in options {
                    out.push_str(&format!(", '{key}': '{value}'"));
                }
                out.push('}');
                out
            }
        }
    }
}
