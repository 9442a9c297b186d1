//! Term generation strategies and their weights.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ExplorerError;

pub const STREET_SUFFIXES: &[&str] = &[
    "Blvd", "Ln", "Dr", "Ct", "Way", "Pl", "Ter", "Cir", "Pkwy", "Hwy", "Trl",
];

pub const STREET_NAMES: &[&str] = &[
    "Main", "Oak", "Maple", "Cedar", "Elm", "Pine", "Washington", "Lincoln", "Church", "Mill",
    "Spring", "Walnut", "Chestnut", "Highland", "Franklin", "Jackson", "Madison", "Jefferson",
];

pub const FIRST_NAMES: &[&str] = &[
    "James", "Mary", "John", "Patricia", "Robert", "Jennifer", "Michael", "Linda", "William",
    "Elizabeth", "David", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah",
    "Charles", "Karen", "Daniel", "Nancy", "Matthew", "Lisa", "Anthony", "Betty", "Mark",
    "Margaret", "Donald", "Sandra",
];

pub const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Miller", "Davis", "Wilson", "Anderson",
    "Taylor", "Thomas", "Moore", "Martin", "Thompson", "White", "Harris", "Clark", "Lewis",
    "Robinson", "Walker", "Young", "Allen", "King", "Wright", "Scott", "Hill", "Green", "Adams",
    "Baker", "Nelson",
];

pub const CULTURAL_SURNAMES: &[&str] = &[
    "Garcia", "Rodriguez", "Martinez", "Hernandez", "Lopez", "Gonzalez", "Nguyen", "Tran", "Le",
    "Pham", "Kim", "Lee", "Park", "Chen", "Wang", "Li", "Zhang", "Liu", "Patel", "Shah", "Singh",
    "Kumar", "Cohen", "Kowalski", "Nowak", "Murphy", "Kelly", "Okafor", "Mensah", "Yamamoto",
    "Tanaka", "Rossi", "Russo", "Ivanov", "Haddad",
];

pub const GEOGRAPHIC_TOKENS: &[&str] = &[
    "North", "South", "East", "West", "Lake", "Hill", "River", "Valley", "Ridge", "Creek", "Bay",
    "Harbor", "Forest", "Meadow", "Spring", "Summit", "Canyon", "Grove",
];

pub const NEIGHBORHOODS: &[&str] = &[
    "Downtown", "Midtown", "Uptown", "Riverside", "Westside", "Eastside", "Northside",
    "Southside", "Old Town", "Heights", "Village", "Park Place", "Lakeview", "Hillcrest",
    "Brookside", "Fairview",
];

pub const PROPERTY_TYPES: &[&str] = &[
    "Condo", "Apartment", "Duplex", "Townhouse", "Suite", "Lot", "Parcel", "Acreage",
];

/// Suffixes that mark a business-entity term.
pub const BUSINESS_SUFFIXES: &[&str] = &[
    "LLC", "Inc", "Corp", "Co", "Ltd", "LP", "LLP", "Trust", "Holdings", "Properties",
    "Partners", "Group",
];

/// A term generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    StreetSuffix,
    FirstName,
    LastName,
    CulturalSurname,
    GeographicToken,
    Neighborhood,
    PropertyType,
    BusinessEntity,
    PartialAddress,
}

impl Strategy {
    pub const ALL: [Strategy; 9] = [
        Strategy::StreetSuffix,
        Strategy::FirstName,
        Strategy::LastName,
        Strategy::CulturalSurname,
        Strategy::GeographicToken,
        Strategy::Neighborhood,
        Strategy::PropertyType,
        Strategy::BusinessEntity,
        Strategy::PartialAddress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreetSuffix => "street_suffix",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::CulturalSurname => "cultural_surname",
            Self::GeographicToken => "geographic_token",
            Self::Neighborhood => "neighborhood",
            Self::PropertyType => "property_type",
            Self::BusinessEntity => "business_entity",
            Self::PartialAddress => "partial_address",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Generate one candidate. Never returns an empty string.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self {
            Self::StreetSuffix => pick(rng, STREET_SUFFIXES).to_string(),
            Self::FirstName => pick(rng, FIRST_NAMES).to_string(),
            Self::LastName => pick(rng, LAST_NAMES).to_string(),
            Self::CulturalSurname => pick(rng, CULTURAL_SURNAMES).to_string(),
            Self::GeographicToken => pick(rng, GEOGRAPHIC_TOKENS).to_string(),
            Self::Neighborhood => pick(rng, NEIGHBORHOODS).to_string(),
            Self::PropertyType => pick(rng, PROPERTY_TYPES).to_string(),
            Self::BusinessEntity => {
                let base = if rng.random_bool(0.5) {
                    pick(rng, LAST_NAMES)
                } else {
                    pick(rng, CULTURAL_SURNAMES)
                };
                format!("{} {}", base, pick(rng, BUSINESS_SUFFIXES))
            }
            Self::PartialAddress => {
                let number: u32 = rng.random_range(1..=999);
                format!("{} {}", number, pick(rng, STREET_NAMES))
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, list: &[&'a str]) -> &'a str {
    list[rng.random_range(0..list.len())]
}

/// Sampling weights per strategy. Zero-weight strategies stay in the table
/// but are never sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    entries: Vec<(Strategy, f64)>,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::new(vec![
            (Strategy::StreetSuffix, 0.20),
            (Strategy::FirstName, 0.12),
            (Strategy::LastName, 0.20),
            (Strategy::CulturalSurname, 0.15),
            (Strategy::GeographicToken, 0.08),
            (Strategy::Neighborhood, 0.05),
            // Retired.
            (Strategy::PropertyType, 0.0),
            (Strategy::BusinessEntity, 0.12),
            (Strategy::PartialAddress, 0.08),
        ])
    }
}

impl WeightTable {
    /// Negative and non-finite weights are treated as zero.
    pub fn new(entries: Vec<(Strategy, f64)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(s, w)| (s, if w.is_finite() && w > 0.0 { w } else { 0.0 }))
            .collect();
        Self { entries }
    }

    /// Default table with named overrides applied.
    pub fn with_overrides(overrides: &HashMap<String, f64>) -> Result<Self, ExplorerError> {
        let mut table = Self::default();
        for (name, weight) in overrides {
            let strategy = Strategy::from_name(name)
                .ok_or_else(|| ExplorerError::UnknownStrategy(name.clone()))?;
            table.set(strategy, *weight);
        }
        Ok(table)
    }

    pub fn set(&mut self, strategy: Strategy, weight: f64) {
        let weight = if weight.is_finite() && weight > 0.0 { weight } else { 0.0 };
        match self.entries.iter_mut().find(|(s, _)| *s == strategy) {
            Some(entry) => entry.1 = weight,
            None => self.entries.push((strategy, weight)),
        }
    }

    pub fn weight(&self, strategy: Strategy) -> f64 {
        self.entries
            .iter()
            .find(|(s, _)| *s == strategy)
            .map_or(0.0, |(_, w)| *w)
    }

    pub fn entries(&self) -> &[(Strategy, f64)] {
        &self.entries
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    /// Weighted pick; `None` when every weight is zero.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Strategy> {
        let total = self.total();
        if total <= 0.0 {
            return None;
        }
        let mut point = rng.random_range(0.0..total);
        for (strategy, weight) in &self.entries {
            if *weight <= 0.0 {
                continue;
            }
            if point < *weight {
                return Some(*strategy);
            }
            point -= weight;
        }
        // Float rounding can leave `point` a hair past the last bucket.
        self.entries
            .iter()
            .rev()
            .find(|(_, w)| *w > 0.0)
            .map(|(s, _)| *s)
    }
}
