use crate::error::{VelocityError, VelocityResult};
use anyhow::Context;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

// ── Column names ───────────────────────────────────────────────────

/// Physical column names of the transaction fields, shared by the
/// ingestion files, the historical store and the daily flag batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ColumnMap {
    pub reference_id: String,
    pub account_number: String,
    pub timestamp: String,
    pub amount: String,
    pub status: String,
    pub state: String,
    pub category: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            reference_id: "no_referensi".into(),
            account_number: "account_number".into(),
            timestamp: "transaction_date".into(),
            amount: "transaction_amount".into(),
            status: "transaction_status".into(),
            state: "transaction_state".into(),
            category: "transaction_category".into(),
        }
    }
}

impl ColumnMap {
    pub fn transaction_columns(&self) -> [&str; 7] {
        [
            &self.reference_id,
            &self.account_number,
            &self.timestamp,
            &self.amount,
            &self.status,
            &self.state,
            &self.category,
        ]
    }

    pub fn is_transaction_column(&self, name: &str) -> bool {
        self.transaction_columns().contains(&name)
    }
}

// ── Ingestion ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub input_folder: PathBuf,
    #[serde(default)]
    pub file_prefix: String,
    #[serde(default = "default_file_suffix")]
    pub file_suffix: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// How many daily files to look back over, today included.
    #[serde(default = "default_n_days")]
    pub n_days: u32,
    /// Positional names replacing the files' header row.
    pub usecols: Vec<String>,
    #[serde(default)]
    pub null_values: Vec<String>,
}

fn default_file_suffix() -> String {
    ".csv".into()
}

fn default_date_format() -> String {
    "%Y%m%d".into()
}

fn default_datetime_format() -> String {
    "%Y-%m-%d %H:%M:%S".into()
}

fn default_delimiter() -> char {
    '|'
}

fn default_n_days() -> u32 {
    1
}

/// Allow-lists applied to ingested rows. An empty list accepts everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub transaction_status: Vec<i64>,
    pub transaction_state: Vec<i64>,
    pub transaction_category: Vec<String>,
}

// ── Flags ──────────────────────────────────────────────────────────

/// A flag designator as written in configuration: a single column name
/// or a list of them. Resolved once by `PipelineConfig::validate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FlagDesignator {
    SingleFlag(String),
    MultiFlag(Vec<String>),
}

impl FlagDesignator {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::SingleFlag(name) => vec![name.as_str()],
            Self::MultiFlag(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// The single column this designator names. A list is rejected even
    /// when it has one entry; rules must say exactly which column they own.
    pub fn single(&self, context: &str) -> VelocityResult<&str> {
        match self {
            Self::SingleFlag(name) => Ok(name),
            Self::MultiFlag(names) => Err(VelocityError::Validation(format!(
                "{context}: expected a single flag column, got a list {names:?}"
            ))),
        }
    }
}

// ── Rules ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionConfig {
    Count {
        window_minutes: u32,
        threshold: usize,
        marking_span_minutes: u32,
    },
    ValueSum {
        lookback_hours: u32,
        threshold: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub flag: FlagDesignator,
    /// Where this rule's daily flag batch is written.
    pub batch_path: PathBuf,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    /// Inclusive hour-of-day range, e.g. `[0, 5]`.
    #[serde(default)]
    pub hour_range: Option<[u32; 2]>,
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalConfig {
    pub store_path: PathBuf,
    pub flag: FlagDesignator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub columns: ColumnMap,
    #[serde(default = "default_temp_date_column")]
    pub temp_date_column: String,
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    pub historical: HistoricalConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_temp_date_column() -> String {
    "transaction_day".into()
}

// ── Validated form ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Count {
        window: Duration,
        threshold: usize,
        marking_span: Duration,
    },
    ValueSum {
        lookback: Duration,
        threshold: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRule {
    pub name: String,
    pub flag_column: String,
    pub batch_path: PathBuf,
    pub lookback_days: Option<u32>,
    pub hour_range: Option<(u32, u32)>,
    pub detection: Detection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    MarkingSpanMismatch {
        rule: String,
        window_minutes: u32,
        marking_span_minutes: u32,
    },
    UndeclaredFlag {
        rule: String,
        flag_column: String,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkingSpanMismatch {
                rule,
                window_minutes,
                marking_span_minutes,
            } => write!(
                f,
                "rule '{rule}': marking span {marking_span_minutes}min differs from window {window_minutes}min"
            ),
            Self::UndeclaredFlag { rule, flag_column } => write!(
                f,
                "rule '{rule}': flag column '{flag_column}' is not declared by the historical store"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub rules: Vec<ValidatedRule>,
    /// Flag columns every store record must carry, in declaration order.
    pub declared_flags: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

impl ValidatedConfig {
    pub fn rule(&self, name: &str) -> VelocityResult<&ValidatedRule> {
        self.rules
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| VelocityError::Validation(format!("unknown rule '{name}'")))
    }
}

// ── Loading and validation ─────────────────────────────────────────

impl PipelineConfig {
    /// Load a rule-family configuration from a JSON file.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(path: &Path) -> VelocityResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        log::debug!("Loaded {} rules from {}", config.rules.len(), path.display());
        Ok(config)
    }

    /// Every column the store treats as a flag: the declared ones, then
    /// each rule's own column. Other Int8 columns pass through untouched.
    pub fn known_flag_columns(&self) -> Vec<String> {
        let mut known: Vec<String> = Vec::new();
        let declared = self.historical.flag.columns();
        let per_rule = self.rules.iter().flat_map(|r| r.flag.columns());
        for column in declared.into_iter().chain(per_rule) {
            if !known.iter().any(|k| k == column) {
                known.push(column.to_string());
            }
        }
        known
    }

    /// Resolve flag designators and check every rule once, up front.
    pub fn validate(&self) -> VelocityResult<ValidatedConfig> {
        let mut warnings = Vec::new();

        for column in self.columns.transaction_columns() {
            if column.is_empty() {
                return Err(VelocityError::Validation(
                    "column map contains an empty column name".into(),
                ));
            }
            if !self.ingestion.usecols.iter().any(|c| c == column) {
                return Err(VelocityError::Validation(format!(
                    "ingestion usecols does not include mapped column '{column}'"
                )));
            }
        }
        if self.temp_date_column.is_empty() || self.columns.is_transaction_column(&self.temp_date_column) {
            return Err(VelocityError::Validation(format!(
                "temp_date_column '{}' must be a distinct, non-empty column name",
                self.temp_date_column
            )));
        }
        if self.ingestion.n_days == 0 {
            return Err(VelocityError::Validation("ingestion n_days must be at least 1".into()));
        }
        let known_flags = self.known_flag_columns();
        for column in &self.ingestion.usecols {
            if *column == self.temp_date_column || known_flags.contains(column) {
                return Err(VelocityError::Validation(format!(
                    "ingestion usecols column '{column}' collides with a flag or the temp date column"
                )));
            }
        }

        let declared_flags: Vec<String> = self
            .historical
            .flag
            .columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        for flag in &declared_flags {
            self.check_flag_name(flag, "historical")?;
        }

        let mut names = HashSet::new();
        let mut rule_flags: HashMap<String, &str> = HashMap::new();
        let mut batch_paths: HashMap<&Path, &str> = HashMap::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(VelocityError::Validation("rule with an empty name".into()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(VelocityError::Validation(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            let context = format!("rule '{}'", rule.name);
            let flag_column = rule.flag.single(&context)?.to_string();
            self.check_flag_name(&flag_column, &context)?;
            if let Some(other) = rule_flags.insert(flag_column.clone(), &rule.name) {
                return Err(VelocityError::Validation(format!(
                    "{context}: flag column '{flag_column}' is already written by rule '{other}'"
                )));
            }
            if let Some(other) = batch_paths.insert(rule.batch_path.as_path(), &rule.name) {
                return Err(VelocityError::Validation(format!(
                    "{context}: batch_path {} is already written by rule '{other}'",
                    rule.batch_path.display()
                )));
            }
            if !declared_flags.contains(&flag_column) {
                warnings.push(ConfigWarning::UndeclaredFlag {
                    rule: rule.name.clone(),
                    flag_column: flag_column.clone(),
                });
            }

            let hour_range = match rule.hour_range {
                Some([start, end]) if start > end || end > 23 => {
                    return Err(VelocityError::Validation(format!(
                        "{context}: hour_range [{start}, {end}] must satisfy start <= end <= 23"
                    )));
                }
                Some([start, end]) => Some((start, end)),
                None => None,
            };

            let detection = match &rule.detection {
                DetectionConfig::Count {
                    window_minutes,
                    threshold,
                    marking_span_minutes,
                } => {
                    if *window_minutes == 0 || *threshold == 0 {
                        return Err(VelocityError::Validation(format!(
                            "{context}: window_minutes and threshold must be positive"
                        )));
                    }
                    if *marking_span_minutes != *window_minutes {
                        warnings.push(ConfigWarning::MarkingSpanMismatch {
                            rule: rule.name.clone(),
                            window_minutes: *window_minutes,
                            marking_span_minutes: *marking_span_minutes,
                        });
                    }
                    Detection::Count {
                        window: Duration::minutes(i64::from(*window_minutes)),
                        threshold: *threshold,
                        marking_span: Duration::minutes(i64::from(*marking_span_minutes)),
                    }
                }
                DetectionConfig::ValueSum {
                    lookback_hours,
                    threshold,
                } => {
                    if *lookback_hours == 0 || !threshold.is_finite() || *threshold <= 0.0 {
                        return Err(VelocityError::Validation(format!(
                            "{context}: lookback_hours and threshold must be positive"
                        )));
                    }
                    Detection::ValueSum {
                        lookback: Duration::hours(i64::from(*lookback_hours)),
                        threshold: *threshold,
                    }
                }
            };

            rules.push(ValidatedRule {
                name: rule.name.clone(),
                flag_column,
                batch_path: rule.batch_path.clone(),
                lookback_days: rule.lookback_days,
                hour_range,
                detection,
            });
        }

        for warning in &warnings {
            log::warn!("config: {warning}");
        }

        Ok(ValidatedConfig {
            rules,
            declared_flags,
            warnings,
        })
    }

    fn check_flag_name(&self, flag: &str, context: &str) -> VelocityResult<()> {
        if flag.is_empty() {
            return Err(VelocityError::Validation(format!("{context}: empty flag column name")));
        }
        if self.columns.is_transaction_column(flag) || flag == self.temp_date_column {
            return Err(VelocityError::Validation(format!(
                "{context}: flag column '{flag}' collides with a transaction column"
            )));
        }
        Ok(())
    }

    /// Minimal config for tests. All paths live under `root`.
    ///
    /// Rules: a 5-in-10-minutes count burst, a 50M-in-24h value burst
    /// and the same value burst restricted to 00:00–05:59.
    pub fn default_test(root: &Path) -> Self {
        let columns = ColumnMap::default();
        let usecols = columns
            .transaction_columns()
            .iter()
            .map(|c| c.to_string())
            .collect();

        Self {
            columns,
            temp_date_column: default_temp_date_column(),
            ingestion: IngestionConfig {
                input_folder: root.join("input"),
                file_prefix: "ibmb_".into(),
                file_suffix: default_file_suffix(),
                date_format: default_date_format(),
                datetime_format: default_datetime_format(),
                delimiter: default_delimiter(),
                n_days: 3,
                usecols,
                null_values: vec!["".into(), "NULL".into()],
            },
            filter: FilterConfig {
                transaction_status: vec![0],
                transaction_state: vec![1],
                transaction_category: vec!["TF_ONLINE".into()],
            },
            historical: HistoricalConfig {
                store_path: root.join("store").join("history.parquet"),
                flag: FlagDesignator::MultiFlag(vec![
                    "flag_10min".into(),
                    "flag_50mio".into(),
                    "flag_50mio_early".into(),
                ]),
            },
            rules: vec![
                RuleConfig {
                    name: "burst_10min".into(),
                    flag: FlagDesignator::SingleFlag("flag_10min".into()),
                    batch_path: root.join("daily").join("flag_10min.parquet"),
                    lookback_days: None,
                    hour_range: None,
                    detection: DetectionConfig::Count {
                        window_minutes: 10,
                        threshold: 5,
                        marking_span_minutes: 10,
                    },
                },
                RuleConfig {
                    name: "value_50mio".into(),
                    flag: FlagDesignator::SingleFlag("flag_50mio".into()),
                    batch_path: root.join("daily").join("flag_50mio.parquet"),
                    lookback_days: None,
                    hour_range: None,
                    detection: DetectionConfig::ValueSum {
                        lookback_hours: 24,
                        threshold: 50_000_000.0,
                    },
                },
                RuleConfig {
                    name: "value_50mio_early".into(),
                    flag: FlagDesignator::SingleFlag("flag_50mio_early".into()),
                    batch_path: root.join("daily").join("flag_50mio_early.parquet"),
                    lookback_days: None,
                    hour_range: Some([0, 5]),
                    detection: DetectionConfig::ValueSum {
                        lookback_hours: 24,
                        threshold: 50_000_000.0,
                    },
                },
            ],
        }
    }
}
