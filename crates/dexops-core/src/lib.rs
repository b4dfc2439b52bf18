//! Core domain model for dexops: stored Pokemon, the upstream catalog record
//! schema, and the value types shared by sync, storage and the web surface.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dexops-core";

pub const DEFAULT_TOP_LIMIT: u32 = 10;
pub const MAX_TOP_LIMIT: u32 = 50;
/// Batch reports keep at most this many failure samples.
pub const MAX_REPORTED_FAILURES: usize = 5;

/// The six base stats tracked per Pokemon, in upstream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    Hp,
    Attack,
    Defense,
    SpecialAttack,
    SpecialDefense,
    Speed,
}

impl StatField {
    pub const ALL: [StatField; 6] = [
        StatField::Hp,
        StatField::Attack,
        StatField::Defense,
        StatField::SpecialAttack,
        StatField::SpecialDefense,
        StatField::Speed,
    ];

    /// Column name in the `pokemon` table; also the public query name.
    pub fn column(self) -> &'static str {
        match self {
            StatField::Hp => "hp",
            StatField::Attack => "attack",
            StatField::Defense => "defense",
            StatField::SpecialAttack => "special_attack",
            StatField::SpecialDefense => "special_defense",
            StatField::Speed => "speed",
        }
    }

    /// Stat name as it appears in `stats[].stat.name` upstream.
    pub fn catalog_name(self) -> &'static str {
        match self {
            StatField::Hp => "hp",
            StatField::Attack => "attack",
            StatField::Defense => "defense",
            StatField::SpecialAttack => "special-attack",
            StatField::SpecialDefense => "special-defense",
            StatField::Speed => "speed",
        }
    }

    pub fn from_catalog_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.catalog_name() == name)
    }

    pub fn column_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|f| f.column()).collect()
    }
}

impl fmt::Display for StatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for StatField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.column().eq_ignore_ascii_case(needle))
            .ok_or_else(|| QueryError::InvalidStat {
                stat: s.to_string(),
            })
    }
}

/// Flattened base stats. `None` means upstream did not report the stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatBlock {
    pub hp: Option<i64>,
    pub attack: Option<i64>,
    pub defense: Option<i64>,
    pub special_attack: Option<i64>,
    pub special_defense: Option<i64>,
    pub speed: Option<i64>,
}

impl StatBlock {
    pub fn get(&self, field: StatField) -> Option<i64> {
        match field {
            StatField::Hp => self.hp,
            StatField::Attack => self.attack,
            StatField::Defense => self.defense,
            StatField::SpecialAttack => self.special_attack,
            StatField::SpecialDefense => self.special_defense,
            StatField::Speed => self.speed,
        }
    }

    pub fn slot_mut(&mut self, field: StatField) -> &mut Option<i64> {
        match field {
            StatField::Hp => &mut self.hp,
            StatField::Attack => &mut self.attack,
            StatField::Defense => &mut self.defense,
            StatField::SpecialAttack => &mut self.special_attack,
            StatField::SpecialDefense => &mut self.special_defense,
            StatField::Speed => &mut self.speed,
        }
    }
}

/// `{ "name": ..., "url": ... }` reference used throughout the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedResource {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStat {
    pub base_stat: i64,
    pub stat: NamedResource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTypeSlot {
    pub slot: Option<u32>,
    #[serde(rename = "type")]
    pub kind: NamedResource,
}

/// Typed view of `GET /pokemon/{idOrName}`. Fields we do not map are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: Option<i64>,
    pub name: String,
    pub height: Option<i64>,
    pub weight: Option<i64>,
    #[serde(default)]
    pub stats: Vec<CatalogStat>,
    #[serde(default)]
    pub types: Vec<CatalogTypeSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("upstream record has a blank name")]
    BlankName,
    #[error("upstream record {name} carries no id")]
    MissingId { name: String },
    #[error("upstream record {name} has non-positive id {id}")]
    InvalidId { name: String, id: i64 },
    #[error("requested id {requested} but upstream returned id {found}")]
    IdMismatch { requested: i64, found: i64 },
    #[error("upstream record {name} has negative {field}: {value}")]
    NegativeValue {
        name: String,
        field: &'static str,
        value: i64,
    },
    #[error("upstream record {name} lists a blank type name")]
    BlankTypeName { name: String },
}

/// Insert-ready Pokemon derived from one upstream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPokemon {
    pub id: i64,
    pub name: String,
    pub height: Option<i64>,
    pub weight: Option<i64>,
    pub stats: StatBlock,
    /// Type names in order of first appearance, without duplicates.
    pub types: Vec<String>,
}

impl NewPokemon {
    /// Map an upstream record onto the local shape.
    ///
    /// `requested_id` is the id the caller asked for; when present it must
    /// agree with the record's own id. Without it the record must carry one.
    /// Unknown stat names are dropped and missing stats stay `None`.
    pub fn from_record(record: &CatalogRecord, requested_id: Option<i64>) -> Result<Self, RecordError> {
        let name = record.name.trim();
        if name.is_empty() {
            return Err(RecordError::BlankName);
        }

        let id = match (requested_id, record.id) {
            (Some(requested), Some(found)) if requested != found => {
                return Err(RecordError::IdMismatch { requested, found });
            }
            (Some(requested), _) => requested,
            (None, Some(found)) => found,
            (None, None) => {
                return Err(RecordError::MissingId {
                    name: name.to_string(),
                });
            }
        };
        if id < 1 {
            return Err(RecordError::InvalidId {
                name: name.to_string(),
                id,
            });
        }

        let height = non_negative(name, "height", record.height)?;
        let weight = non_negative(name, "weight", record.weight)?;

        let mut stats = StatBlock::default();
        for entry in &record.stats {
            let Some(field) = StatField::from_catalog_name(entry.stat.name.trim()) else {
                continue;
            };
            *stats.slot_mut(field) = non_negative(name, field.column(), Some(entry.base_stat))?;
        }

        let mut types: Vec<String> = Vec::with_capacity(record.types.len());
        for slot in &record.types {
            let type_name = slot.kind.name.trim();
            if type_name.is_empty() {
                return Err(RecordError::BlankTypeName {
                    name: name.to_string(),
                });
            }
            if !types.iter().any(|t| t == type_name) {
                types.push(type_name.to_string());
            }
        }

        Ok(Self {
            id,
            name: name.to_string(),
            height,
            weight,
            stats,
            types,
        })
    }
}

fn non_negative(name: &str, field: &'static str, value: Option<i64>) -> Result<Option<i64>, RecordError> {
    match value {
        Some(v) if v < 0 => Err(RecordError::NegativeValue {
            name: name.to_string(),
            field,
            value: v,
        }),
        other => Ok(other),
    }
}

/// Persisted Pokemon row with its type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pokemon {
    pub id: i64,
    pub name: String,
    pub height: Option<i64>,
    pub weight: Option<i64>,
    #[serde(flatten)]
    pub stats: StatBlock,
    pub types: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokemonRef {
    pub id: i64,
    pub name: String,
}

/// Result of syncing a single id or name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Inserted {
        id: i64,
        name: String,
        types: Vec<String>,
        attack: Option<i64>,
    },
    AlreadyExists {
        id: i64,
        name: String,
    },
}

impl SyncOutcome {
    pub fn inserted(pokemon: &NewPokemon) -> Self {
        SyncOutcome::Inserted {
            id: pokemon.id,
            name: pokemon.name.clone(),
            types: pokemon.types.clone(),
            attack: pokemon.stats.attack,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            SyncOutcome::Inserted { id, .. } | SyncOutcome::AlreadyExists { id, .. } => *id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, SyncOutcome::Inserted { .. })
    }
}

impl From<PokemonRef> for SyncOutcome {
    fn from(existing: PokemonRef) -> Self {
        SyncOutcome::AlreadyExists {
            id: existing.id,
            name: existing.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("batch start must be >= 1, got {start}")]
    StartBelowOne { start: i64 },
    #[error("batch start {start} is greater than end {end}")]
    Inverted { start: i64, end: i64 },
}

/// Inclusive, ascending id range for batch sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchRange {
    start: i64,
    end: i64,
}

impl BatchRange {
    pub fn new(start: i64, end: i64) -> Result<Self, RangeError> {
        if start < 1 {
            return Err(RangeError::StartBelowOne { start });
        }
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64 + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn ids(&self) -> RangeInclusive<i64> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: i64,
    pub error: String,
}

/// Aggregated counts for one batch sync, with a bounded failure sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub start: i64,
    pub end: i64,
    pub total: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn new(range: BatchRange) -> Self {
        Self {
            start: range.start(),
            end: range.end(),
            total: range.len(),
            inserted: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &SyncOutcome) {
        if outcome.is_inserted() {
            self.inserted += 1;
        } else {
            self.skipped += 1;
        }
    }

    pub fn record_failure(&mut self, id: i64, error: impl Into<String>) {
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_FAILURES {
            self.errors.push(BatchFailure {
                id,
                error: error.into(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid stat '{stat}'; valid stats are: {}", StatField::column_names().join(", "))]
    InvalidStat { stat: String },
    #[error("limit must be between 1 and 50, got {limit}")]
    LimitOutOfRange { limit: i64 },
}

/// Validated parameters for a top-N-by-stat query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopQuery {
    pub stat: StatField,
    pub limit: u32,
}

impl TopQuery {
    /// Out-of-range limits are rejected rather than clamped.
    pub fn parse(stat: &str, limit: Option<i64>) -> Result<Self, QueryError> {
        let stat = stat.parse::<StatField>()?;
        let limit = match limit {
            None => DEFAULT_TOP_LIMIT,
            Some(l) if (1..=MAX_TOP_LIMIT as i64).contains(&l) => l as u32,
            Some(l) => return Err(QueryError::LimitOutOfRange { limit: l }),
        };
        Ok(Self { stat, limit })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRanking {
    pub rank: u32,
    pub id: i64,
    pub name: String,
    pub stat: StatField,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub name: String,
    pub count: i64,
}
