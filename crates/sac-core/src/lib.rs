use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const CODE_PREFIX: &str = "SAC";
pub const FALLBACK_BASE: u64 = 900;
pub const MAX_SPIRAL_OFFSET: u64 = 1_000_000;
pub const NEAR_DUPLICATE_HIGH: f64 = 0.9;
pub const NEAR_DUPLICATE_LOW: f64 = 0.8;
pub const SIMILAR_WARNING_THRESHOLD: f64 = 0.9;
pub const SEARCH_RESULT_LIMIT: usize = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SacError {
    #[error("code space exhausted: no free package number within +/-{max_offset} of {base}")]
    CodeSpaceExhausted { base: u64, max_offset: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Test {
    pub id: String,
    pub name: String,
}

impl Test {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
        }
    }
}

/// A laboratory test package ("SAC").
///
/// `test_names` is semantically a set. It is kept sorted for display but no
/// algorithm in this crate depends on its order, and a repeated name counts once.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Package {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preservation_notes: Option<String>,
    #[serde(default)]
    pub test_names: Vec<String>,
}

impl Package {
    #[must_use]
    pub fn test_set(&self) -> BTreeSet<&str> {
        self.test_names.iter().map(String::as_str).collect()
    }

    /// Numeric part of the package code, formed from every digit in the code.
    #[must_use]
    pub fn code_number(&self) -> Option<u64> {
        code_number(&self.code)
    }
}

impl Display for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.name)
    }
}

/// Test record as returned by the document store, before name collapse.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawTestRecord {
    pub record_id: String,
    pub test_id: String,
    pub name: String,
}

/// Package record as returned by the document store. `tests` holds raw test
/// record ids.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawPackageRecord {
    pub record_id: String,
    pub sac_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bottleware: Option<String>,
    #[serde(default)]
    pub tests: Vec<String>,
}

/// Normalized in-memory snapshot that every lookup and analysis reads.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Catalog {
    pub tests: Vec<Test>,
    pub packages: Vec<Package>,
}

impl Catalog {
    /// Collapse raw store records into a catalog keyed by test name.
    ///
    /// Two test records sharing a name become one test whose id is the name.
    /// Package test references that do not resolve to a known record are dropped.
    #[must_use]
    pub fn from_raw(tests: &[RawTestRecord], packages: &[RawPackageRecord]) -> Self {
        let names_by_record_id = tests
            .iter()
            .map(|record| (record.record_id.as_str(), record.name.as_str()))
            .collect::<BTreeMap<_, _>>();

        let unique_names = tests
            .iter()
            .map(|record| record.name.as_str())
            .collect::<BTreeSet<_>>();
        let collapsed_tests = unique_names
            .into_iter()
            .map(Test::named)
            .collect::<Vec<_>>();

        let mut collapsed = packages
            .iter()
            .map(|record| {
                let test_names = record
                    .tests
                    .iter()
                    .filter_map(|record_id| names_by_record_id.get(record_id.as_str()))
                    .map(|name| (*name).to_string())
                    .collect::<BTreeSet<_>>();
                Package {
                    code: record.sac_code.clone(),
                    name: record.name.clone(),
                    description: record.description.clone(),
                    preservation_notes: record
                        .bottleware
                        .clone()
                        .filter(|notes| !notes.trim().is_empty()),
                    test_names: test_names.into_iter().collect(),
                }
            })
            .collect::<Vec<_>>();
        collapsed.sort_by(|lhs, rhs| lhs.code.cmp(&rhs.code));

        tracing::debug!(
            raw_tests = tests.len(),
            tests = collapsed_tests.len(),
            packages = collapsed.len(),
            "normalized catalog snapshot"
        );

        Self {
            tests: collapsed_tests,
            packages: collapsed,
        }
    }
}

fn code_number(code: &str) -> Option<u64> {
    let digits = code
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    let numerator = f64::from(u32::try_from(numerator).unwrap_or(u32::MAX));
    let denominator = f64::from(u32::try_from(denominator).unwrap_or(u32::MAX));
    numerator / denominator
}

/// Jaccard similarity of two sets. Two empty sets are identical (1.0).
#[must_use]
pub fn similarity<T: Ord>(lhs: &BTreeSet<T>, rhs: &BTreeSet<T>) -> f64 {
    let union = lhs.union(rhs).count();
    if union == 0 {
        return 1.0;
    }
    ratio(lhs.intersection(rhs).count(), union)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityPair {
    pub first: Package,
    pub second: Package,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DuplicateReport {
    pub identical_groups: Vec<Vec<Package>>,
    pub near_90: Vec<SimilarityPair>,
    pub near_80: Vec<SimilarityPair>,
}

impl DuplicateReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.identical_groups.is_empty() && self.near_90.is_empty() && self.near_80.is_empty()
    }
}

/// Partition packages into identical-content groups and near-duplicate pairs.
///
/// Every unordered pair lands in at most one bucket. Pair lists are ordered by
/// score descending with ties kept in enumeration order.
#[must_use]
pub fn analyze(packages: &[Package]) -> DuplicateReport {
    let sets = packages.iter().map(Package::test_set).collect::<Vec<_>>();

    let mut group_index: BTreeMap<&BTreeSet<&str>, usize> = BTreeMap::new();
    let mut groups: Vec<Vec<Package>> = Vec::new();
    for (package, set) in packages.iter().zip(&sets) {
        let index = *group_index.entry(set).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[index].push(package.clone());
    }
    let identical_groups = groups
        .into_iter()
        .filter(|group| group.len() > 1)
        .collect::<Vec<_>>();

    let mut near_90 = Vec::new();
    let mut near_80 = Vec::new();
    for (i, (first, first_set)) in packages.iter().zip(&sets).enumerate() {
        for (second, second_set) in packages.iter().zip(&sets).skip(i + 1) {
            let score = similarity(first_set, second_set);
            if score >= 1.0 {
                continue;
            }
            let bucket = if score >= NEAR_DUPLICATE_HIGH {
                &mut near_90
            } else if score >= NEAR_DUPLICATE_LOW {
                &mut near_80
            } else {
                continue;
            };
            bucket.push(SimilarityPair {
                first: first.clone(),
                second: second.clone(),
                score,
            });
        }
    }
    near_90.sort_by(|lhs, rhs| rhs.score.total_cmp(&lhs.score));
    near_80.sort_by(|lhs, rhs| rhs.score.total_cmp(&lhs.score));

    tracing::debug!(
        packages = packages.len(),
        identical_groups = identical_groups.len(),
        near_90 = near_90.len(),
        near_80 = near_80.len(),
        "duplicate analysis complete"
    );

    DuplicateReport {
        identical_groups,
        near_90,
        near_80,
    }
}

/// Split comma separated search text into lowercase, trimmed, non-empty terms.
#[must_use]
pub fn parse_query_terms(text: &str) -> Vec<String> {
    text.split(',')
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankedPackage {
    pub package: Package,
    pub score: usize,
    pub matched_tests: Vec<String>,
    pub total_terms: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "results", rename_all = "snake_case")]
pub enum SearchOutcome {
    NotSearched,
    Searched(Vec<RankedPackage>),
}

impl SearchOutcome {
    #[must_use]
    pub fn results(&self) -> &[RankedPackage] {
        match self {
            Self::NotSearched => &[],
            Self::Searched(results) => results,
        }
    }
}

/// Rank packages by how many distinct query terms appear as a substring of
/// any of their test names.
///
/// Terms are lowercased and trimmed; blank terms are dropped. When no term
/// survives the result is [`SearchOutcome::NotSearched`].
#[must_use]
pub fn rank<S: AsRef<str>>(packages: &[Package], query_terms: &[S]) -> SearchOutcome {
    let mut terms: Vec<String> = Vec::new();
    for raw in query_terms {
        let term = raw.as_ref().trim().to_lowercase();
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    if terms.is_empty() {
        return SearchOutcome::NotSearched;
    }

    let mut ranked = Vec::new();
    for package in packages {
        let lowered = package
            .test_names
            .iter()
            .map(|name| (name.as_str(), name.to_lowercase()))
            .collect::<Vec<_>>();

        let mut score = 0_usize;
        let mut matched = BTreeSet::new();
        for term in &terms {
            let mut term_found = false;
            for (name, lowered_name) in &lowered {
                if lowered_name.contains(term.as_str()) {
                    term_found = true;
                    matched.insert((*name).to_string());
                }
            }
            if term_found {
                score += 1;
            }
        }

        if score > 0 {
            ranked.push(RankedPackage {
                package: package.clone(),
                score,
                matched_tests: matched.into_iter().collect(),
                total_terms: terms.len(),
            });
        }
    }

    ranked.sort_by(|lhs, rhs| rhs.score.cmp(&lhs.score));
    ranked.truncate(SEARCH_RESULT_LIMIT);
    tracing::debug!(
        terms = terms.len(),
        results = ranked.len(),
        "ranked packages by test query"
    );
    SearchOutcome::Searched(ranked)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarPackage {
    pub package: Package,
    pub score: f64,
    pub identical: bool,
}

impl SimilarPackage {
    #[must_use]
    pub fn percent(&self) -> u32 {
        // score is always within [0, 1]
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = (self.score * 100.0).round() as u32;
        percent
    }

    #[must_use]
    pub fn headline(&self) -> &'static str {
        if self.identical {
            "Identical SAC Found!"
        } else {
            "Highly Similar SAC Found!"
        }
    }

    #[must_use]
    pub fn warning(&self) -> String {
        let degree = if self.identical {
            "100% identical".to_string()
        } else {
            format!("{}% similar", self.percent())
        };
        format!(
            "Your selection is {degree} to {}. \
             You should probably use this existing package instead.",
            self.package
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildResult {
    pub new_code: String,
    pub selected_tests: Vec<String>,
    pub explanation: String,
    pub similar_package: Option<SimilarPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum BuildOutcome {
    NothingSelected,
    Built(BuildResult),
}

/// Find the nearest unused number to `base`, trying `base` itself, then
/// `base+1`, `base-1`, `base+2`, `base-2`, ... Downward candidates must stay
/// above zero.
///
/// # Errors
/// Returns [`SacError::CodeSpaceExhausted`] when every candidate within
/// `max_offset` of `base` is taken.
pub fn allocate_number(
    base: u64,
    taken: &BTreeSet<u64>,
    max_offset: u64,
) -> Result<u64, SacError> {
    if !taken.contains(&base) {
        return Ok(base);
    }

    for offset in 1..=max_offset {
        if let Some(up) = base.checked_add(offset) {
            if !taken.contains(&up) {
                return Ok(up);
            }
        }
        if let Some(down) = base.checked_sub(offset) {
            if down > 0 && !taken.contains(&down) {
                return Ok(down);
            }
        }
    }

    Err(SacError::CodeSpaceExhausted { base, max_offset })
}

/// Propose a new package for the selected tests.
///
/// The new code is numerically close to the most similar existing package so
/// related packages cluster together. An empty selection is
/// [`BuildOutcome::NothingSelected`]. Packages whose code carries no digits
/// still compete for "most similar" but never occupy a number.
///
/// # Errors
/// Returns [`SacError::CodeSpaceExhausted`] when no free number exists within
/// [`MAX_SPIRAL_OFFSET`] of the base number.
pub fn build<S: AsRef<str>>(
    packages: &[Package],
    selected: &[S],
) -> Result<BuildOutcome, SacError> {
    build_with_bound(packages, selected, MAX_SPIRAL_OFFSET)
}

/// [`build`] with an explicit bound on the spiral search distance.
///
/// # Errors
/// Returns [`SacError::CodeSpaceExhausted`] when no free number exists within
/// `max_offset` of the base number.
pub fn build_with_bound<S: AsRef<str>>(
    packages: &[Package],
    selected: &[S],
    max_offset: u64,
) -> Result<BuildOutcome, SacError> {
    let selected_set = selected
        .iter()
        .map(|name| name.as_ref())
        .collect::<BTreeSet<&str>>();
    if selected_set.is_empty() {
        return Ok(BuildOutcome::NothingSelected);
    }

    let mut most_similar: Option<(&Package, f64)> = None;
    for package in packages {
        let score = similarity(&selected_set, &package.test_set());
        let is_better = match most_similar {
            None => true,
            Some((_, best)) => score > best,
        };
        if is_better {
            most_similar = Some((package, score));
        }
    }

    let taken = packages
        .iter()
        .filter_map(Package::code_number)
        .collect::<BTreeSet<_>>();
    let similar_base = most_similar
        .and_then(|(package, _)| package.code_number().map(|number| (package, number)));
    let base = similar_base.map_or(FALLBACK_BASE, |(_, number)| number);
    let number = allocate_number(base, &taken, max_offset)?;
    let new_code = format!("{CODE_PREFIX}{number}");

    let explanation = match similar_base {
        Some((package, _)) => format!(
            "This code was chosen for being numerically close to {}, \
             which is the most similar existing package.",
            package.code
        ),
        None => "This code was chosen as no highly similar packages were found.".to_string(),
    };

    let similar_package = most_similar
        .filter(|(_, score)| *score >= SIMILAR_WARNING_THRESHOLD)
        .map(|(package, score)| SimilarPackage {
            package: package.clone(),
            score,
            identical: score >= 1.0,
        });

    tracing::debug!(
        selected = selected_set.len(),
        base,
        new_code = %new_code,
        similar = similar_package.is_some(),
        "allocated package code"
    );

    Ok(BuildOutcome::Built(BuildResult {
        new_code,
        selected_tests: selected_set.into_iter().map(str::to_string).collect(),
        explanation,
        similar_package,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "package", rename_all = "snake_case")]
pub enum LookupOutcome {
    NotSearched,
    Found(Package),
    NotFound,
}

fn normalize_code(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    lowered
        .strip_prefix("sac")
        .unwrap_or(&lowered)
        .trim()
        .to_string()
}

/// Find a package by code, ignoring case and an optional `SAC` prefix.
#[must_use]
pub fn find_by_code(packages: &[Package], query: &str) -> LookupOutcome {
    if query.trim().is_empty() {
        return LookupOutcome::NotSearched;
    }

    let wanted = normalize_code(query);
    packages
        .iter()
        .find(|package| normalize_code(&package.code) == wanted)
        .map_or(LookupOutcome::NotFound, |package| {
            LookupOutcome::Found(package.clone())
        })
}

/// Case-insensitive substring filter over test names. A blank filter keeps
/// every test.
#[must_use]
pub fn filter_tests<'a>(tests: &'a [Test], filter: &str) -> Vec<&'a Test> {
    let needle = filter.trim().to_lowercase();
    tests
        .iter()
        .filter(|test| needle.is_empty() || test.name.to_lowercase().contains(&needle))
        .collect()
}

/// Like [`filter_tests`] but also matches the store's natural `test_id`.
#[must_use]
pub fn filter_raw_tests<'a>(records: &'a [RawTestRecord], filter: &str) -> Vec<&'a RawTestRecord> {
    let needle = filter.trim().to_lowercase();
    records
        .iter()
        .filter(|record| {
            needle.is_empty()
                || record.name.to_lowercase().contains(&needle)
                || record.test_id.to_lowercase().contains(&needle)
        })
        .collect()
}
