//! Ranked multi-culture search and detail lookups
//!
//! A query runs through several match classes, each contributing candidates
//! `(policy, culture)` with a base score:
//!
//! | class            | base | source |
//! |------------------|------|--------|
//! | exact id         | 1000 | `policies.policy_name` / `ns:name` |
//! | exact registry   |  900 | `policies.reg_key[\reg_value]` |
//! | prefix id        |  800 | `policies.policy_name LIKE 'q%'` |
//! | phrase           |  600 | FTS phrase over the whole query |
//! | strict full-text |  400 | FTS per-segment substring phrases |
//! | loose full-text  |  300 | same over loose token streams |
//! | permissive       |  150 | FTS OR over single n-grams |
//!
//! Queries of two normalized characters or fewer only run the id and
//! registry classes. Precise queries (one long ASCII segment, or a CJK
//! segment of three or more characters) skip the permissive pass.
//!
//! Candidates are then filtered by culture. A candidate in the first or
//! second requested culture always survives; one in a later culture survives
//! only when the policy has no localization row in either of those two. Each
//! policy keeps its highest-priority surviving candidate. Survivors are
//! rescored against their stored text and sorted by score, then identifier.

use anyhow::{Context, Result};
use bitflags::bitflags;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::models::{
    dedupe_cultures, display_registry_path, unique_id, Hit, PolicyDetail, RegistryHive,
};
use crate::normalize::{
    contains_word, encode_gram, gram_overlap, grams, is_cjk, loose, strict, unique_grams,
};
use crate::store::Store;

bitflags! {
    /// Fields a query is matched against
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SearchFields: u8 {
        /// Display name
        const NAME = 0b0001;
        /// `namespace:policy_name`, value type and product hint
        const ID = 0b0010;
        /// Explanation text
        const DESCRIPTION = 0b0100;
        /// Registry key and value name
        const REGISTRY = 0b1000;
    }
}

impl Default for SearchFields {
    fn default() -> Self {
        SearchFields::NAME | SearchFields::ID | SearchFields::REGISTRY
    }
}

impl SearchFields {
    /// Default fields, plus descriptions when asked
    pub fn with_description(include: bool) -> Self {
        if include {
            SearchFields::default() | SearchFields::DESCRIPTION
        } else {
            SearchFields::default()
        }
    }
}

/// Canonical search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    /// Culture preference, highest priority first
    pub cultures: Vec<String>,
    pub fields: SearchFields,
    /// Every whitespace-separated segment must match some selected field
    pub and_mode: bool,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, cultures: Vec<String>) -> Self {
        Self {
            query: query.into(),
            cultures,
            fields: SearchFields::default(),
            and_mode: false,
            limit: 50,
        }
    }

    pub fn fields(mut self, fields: SearchFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn and_mode(mut self, and_mode: bool) -> Self {
        self.and_mode = and_mode;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Kind of match that produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchClass {
    Permissive,
    Loose,
    Strict,
    Phrase,
    PrefixId,
    ExactRegistry,
    ExactId,
}

impl MatchClass {
    fn base_score(self) -> f64 {
        match self {
            MatchClass::ExactId => 1000.0,
            MatchClass::ExactRegistry => 900.0,
            MatchClass::PrefixId => 800.0,
            MatchClass::Phrase => 600.0,
            MatchClass::Strict => 400.0,
            MatchClass::Loose => 300.0,
            MatchClass::Permissive => 150.0,
        }
    }

    /// Exact and prefix classes are trusted without text verification
    fn is_structural(self) -> bool {
        self >= MatchClass::PrefixId
    }
}

const WORD_BOUNDARY_TITLE: f64 = 120.0;
const WORD_BOUNDARY_DESC: f64 = 30.0;
const OVERLAP_TITLE: f64 = 80.0;
const OVERLAP_DESC: f64 = 30.0;
const PRECISE_ID_CONTAINS: f64 = 200.0;
const PRECISE_NAME_CONTAINS: f64 = 150.0;
const DESCRIPTION_ONLY_PENALTY: f64 = 250.0;
const PERMISSIVE_MIN_OVERLAP: f64 = 0.5;
const CANDIDATES_PER_RESULT: usize = 20;
const MIN_CANDIDATES: usize = 200;
/// Upper bound on n-grams in one permissive OR expression
const MAX_OR_GRAMS: usize = 64;

/// Query text in every form the passes need
#[derive(Debug, Clone, PartialEq)]
struct ParsedQuery {
    /// Trimmed query without surrounding quotes
    raw: String,
    strict: String,
    loose: String,
    /// Strict whitespace segments
    segments: Vec<String>,
    /// Loose form of each segment (may be empty)
    loose_segments: Vec<String>,
    phrase: bool,
    short: bool,
    precise: bool,
}

impl ParsedQuery {
    fn parse(query: &str) -> Self {
        let trimmed = query.trim();
        let quoted = trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"');
        let raw = if quoted {
            trimmed[1..trimmed.len() - 1].trim().to_string()
        } else {
            trimmed.to_string()
        };

        let strict_text = strict(&raw);
        let loose_text = loose(&raw);
        let segments: Vec<String> = strict_text.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect();
        let loose_segments = segments.iter().map(|s| loose(s)).collect();

        let chars = strict_text.chars().count();
        let precise = segments.len() == 1
            && ((strict_text.is_ascii() && chars >= 6)
                || (strict_text.chars().any(is_cjk) && chars >= 3));

        Self {
            phrase: quoted && raw.chars().any(char::is_whitespace),
            short: chars <= 2,
            precise,
            raw,
            strict: strict_text,
            loose: loose_text,
            segments,
            loose_segments,
        }
    }
}

/// Stored text of one candidate, normalized for rescoring
struct CandidateRow {
    policy_id: i64,
    namespace: String,
    policy_name: String,
    hive: String,
    registry_key: String,
    registry_value: Option<String>,
    value_type: String,
    product_hint: Option<String>,
    culture: String,
    display_name: String,
    explain_text: String,
}

struct FieldTexts {
    title_s: String,
    title_l: String,
    desc_s: String,
    desc_l: String,
    registry_s: String,
    id_s: String,
    name_l: String,
}

impl FieldTexts {
    fn from_row(row: &CandidateRow) -> Self {
        let registry = match &row.registry_value {
            Some(value) => format!("{}\\{}", row.registry_key, value),
            None => row.registry_key.clone(),
        };
        let mut id = unique_id(&row.namespace, &row.policy_name);
        id.push(' ');
        id.push_str(&row.value_type);
        if let Some(hint) = &row.product_hint {
            id.push(' ');
            id.push_str(hint);
        }

        Self {
            title_s: strict(&row.display_name),
            title_l: loose(&row.display_name),
            desc_s: strict(&row.explain_text),
            desc_l: loose(&row.explain_text),
            registry_s: strict(&registry),
            id_s: strict(&id),
            name_l: loose(&row.policy_name),
        }
    }

    /// Highest gram overlap of a query (or query segment) with any selected field
    fn best_overlap(&self, strict_query: &str, loose_query: &str, fields: SearchFields) -> f64 {
        let mut best: f64 = 0.0;
        if fields.contains(SearchFields::NAME) {
            best = best
                .max(gram_overlap(strict_query, &self.title_s))
                .max(gram_overlap(loose_query, &self.title_l));
        }
        if fields.contains(SearchFields::DESCRIPTION) {
            best = best
                .max(gram_overlap(strict_query, &self.desc_s))
                .max(gram_overlap(loose_query, &self.desc_l));
        }
        if fields.contains(SearchFields::REGISTRY) {
            best = best.max(gram_overlap(strict_query, &self.registry_s));
        }
        if fields.contains(SearchFields::ID) {
            best = best
                .max(gram_overlap(strict_query, &self.id_s))
                .max(gram_overlap(loose_query, &self.name_l));
        }
        best
    }

    /// Does one query segment occur in any selected field?
    fn segment_matches(&self, segment: &str, loose_segment: &str, fields: SearchFields) -> bool {
        let hit = |strict_text: &str, loose_text: &str| {
            strict_text.contains(segment) || (!loose_segment.is_empty() && loose_text.contains(loose_segment))
        };
        (fields.contains(SearchFields::NAME) && hit(&self.title_s, &self.title_l))
            || (fields.contains(SearchFields::DESCRIPTION) && hit(&self.desc_s, &self.desc_l))
            || (fields.contains(SearchFields::REGISTRY) && self.registry_s.contains(segment))
            || (fields.contains(SearchFields::ID) && hit(&self.id_s, &self.name_l))
    }
}

/// Read-only query side of the cache
#[derive(Debug, Clone)]
pub struct SearchEngine {
    store: Store,
}

impl SearchEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run a ranked search
    ///
    /// An empty culture list is an invalid argument; an empty query or a zero
    /// limit simply yields nothing.
    pub fn search(&self, request: &SearchRequest, cancel: &CancellationToken) -> Result<Vec<Hit>> {
        let cultures = dedupe_cultures(&request.cultures);
        if cultures.is_empty() {
            return Err(CacheError::InvalidArgument("at least one culture is required".to_string()).into());
        }
        if request.fields.is_empty() {
            return Err(CacheError::InvalidArgument("no search fields selected".to_string()).into());
        }

        let query = ParsedQuery::parse(&request.query);
        if query.strict.is_empty() || request.limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.store.open()?;
        let cap = candidate_cap(request.limit);
        let mut candidates: HashMap<(i64, String), MatchClass> = HashMap::new();

        if request.fields.contains(SearchFields::ID) {
            self.collect_id_matches(&conn, &query, &cultures, cap, &mut candidates)?;
        }
        if request.fields.contains(SearchFields::REGISTRY) {
            self.collect_registry_matches(&conn, &query, &cultures, &mut candidates)?;
        }
        check_cancel(cancel)?;

        if !query.short {
            for (class, expr) in fts_expressions(&query, request.fields, request.and_mode) {
                check_cancel(cancel)?;
                for key in fts_candidates(&conn, &expr, &cultures, cap)? {
                    record(&mut candidates, key, class);
                }
            }
        }
        check_cancel(cancel)?;

        let candidates = surviving_candidates(&conn, candidates, &cultures)?;

        let mut hits = Vec::with_capacity(candidates.len());
        {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.ns, p.policy_name, p.hive, p.reg_key, p.reg_value, p.value_type,
                        p.product_hint, i.culture, i.display_name, i.explain_text
                 FROM policies p
                 JOIN policy_i18n i ON i.policy_id = p.id
                 WHERE p.id = ?1 AND i.culture = ?2",
            )?;
            for ((policy_id, culture), class) in &candidates {
                check_cancel(cancel)?;
                let row = stmt
                    .query_row(rusqlite::params![policy_id, culture], |r| {
                        Ok(CandidateRow {
                            policy_id: r.get(0)?,
                            namespace: r.get(1)?,
                            policy_name: r.get(2)?,
                            hive: r.get(3)?,
                            registry_key: r.get(4)?,
                            registry_value: r.get(5)?,
                            value_type: r.get(6)?,
                            product_hint: r.get(7)?,
                            culture: r.get(8)?,
                            display_name: r.get(9)?,
                            explain_text: r.get(10)?,
                        })
                    })
                    .optional()?;
                let Some(row) = row else { continue };

                if let Some(score) = rescore(&query, &row, *class, request.fields, request.and_mode) {
                    hits.push(Hit {
                        policy_id: row.policy_id,
                        unique_id: unique_id(&row.namespace, &row.policy_name),
                        registry_path: display_registry_path(
                            &row.hive,
                            &row.registry_key,
                            row.registry_value.as_deref(),
                        ),
                        display_name: row.display_name,
                        product_hint: row.product_hint,
                        value_type: row.value_type,
                        culture: row.culture,
                        score,
                    });
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
                .then_with(|| a.culture.cmp(&b.culture))
        });
        hits.truncate(request.limit);

        log::debug!(
            "Search '{}' ({:?}, and={}) -> {} hit(s)",
            request.query,
            request.fields,
            request.and_mode,
            hits.len()
        );
        Ok(hits)
    }

    fn collect_id_matches(
        &self,
        conn: &Connection,
        query: &ParsedQuery,
        cultures: &[String],
        cap: usize,
        candidates: &mut HashMap<(i64, String), MatchClass>,
    ) -> Result<()> {
        if query.raw.is_empty() || query.raw.chars().any(char::is_whitespace) {
            return Ok(());
        }

        let (namespace, name) = match query.raw.split_once(':') {
            Some((ns, name)) if !ns.is_empty() => (Some(ns), name),
            _ => (None, query.raw.as_str()),
        };
        if name.is_empty() {
            return Ok(());
        }

        let ns_clause = if namespace.is_some() { "AND p.ns = ? COLLATE NOCASE" } else { "" };
        let in_clause = in_list(cultures.len());

        let exact_sql = format!(
            "SELECT p.id, i.culture FROM policies p
             JOIN policy_i18n i ON i.policy_id = p.id
             WHERE p.policy_name = ? COLLATE NOCASE {} AND i.culture IN ({})",
            ns_clause, in_clause
        );
        let prefix_sql = format!(
            "SELECT p.id, i.culture FROM policies p
             JOIN policy_i18n i ON i.policy_id = p.id
             WHERE p.policy_name LIKE ? ESCAPE '\\' {} AND i.culture IN ({})
             ORDER BY p.policy_name LIMIT {}",
            ns_clause, in_clause, cap
        );

        for (sql, pattern, class) in [
            (exact_sql, name.to_string(), MatchClass::ExactId),
            (prefix_sql, format!("{}%", escape_like(name)), MatchClass::PrefixId),
        ] {
            let mut values = vec![Value::Text(pattern)];
            if let Some(ns) = namespace {
                values.push(Value::Text(ns.to_string()));
            }
            values.extend(cultures.iter().map(|c| Value::Text(c.clone())));

            for key in query_keys(conn, &sql, values)? {
                record(candidates, key, class);
            }
        }
        Ok(())
    }

    fn collect_registry_matches(
        &self,
        conn: &Connection,
        query: &ParsedQuery,
        cultures: &[String],
        candidates: &mut HashMap<(i64, String), MatchClass>,
    ) -> Result<()> {
        if !query.raw.contains(['\\', '/']) {
            return Ok(());
        }
        let (hive, path) = parse_registry_path(&query.raw);
        if path.is_empty() {
            return Ok(());
        }

        let (sql, values) = registry_lookup_sql(hive, &path, cultures);
        for key in query_keys(conn, &sql, values)? {
            record(candidates, key, MatchClass::ExactRegistry);
        }
        Ok(())
    }

    /// Detail for `namespace:name` in the first culture that has it
    ///
    /// An empty namespace matches any namespace.
    pub fn get_by_policy_name(
        &self,
        namespace: &str,
        name: &str,
        cultures: &[String],
    ) -> Result<Option<PolicyDetail>> {
        let cultures = dedupe_cultures(cultures);
        if name.trim().is_empty() {
            return Err(CacheError::InvalidArgument("policy name is required".to_string()).into());
        }
        if cultures.is_empty() {
            return Err(CacheError::InvalidArgument("at least one culture is required".to_string()).into());
        }

        let conn = self.store.open()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE p.policy_name = ?1 COLLATE NOCASE
                AND (?2 = '' OR p.ns = ?2 COLLATE NOCASE)
                AND i.culture = ?3
              ORDER BY p.id LIMIT 1",
            DETAIL_SELECT
        ))?;

        for culture in &cultures {
            let detail = stmt
                .query_row(rusqlite::params![name.trim(), namespace.trim(), culture], detail_from_row)
                .optional()
                .context("Failed to look up policy by name")?;
            if detail.is_some() {
                return Ok(detail);
            }
        }
        Ok(None)
    }

    /// Detail for a registry key (optionally `key\value`) in the first culture that has it
    pub fn get_by_registry_path(&self, path: &str, cultures: &[String]) -> Result<Option<PolicyDetail>> {
        let cultures = dedupe_cultures(cultures);
        if path.trim().is_empty() {
            return Err(CacheError::InvalidArgument("registry path is required".to_string()).into());
        }
        if cultures.is_empty() {
            return Err(CacheError::InvalidArgument("at least one culture is required".to_string()).into());
        }

        let (hive, key) = parse_registry_path(path);
        if key.is_empty() {
            return Ok(None);
        }

        let conn = self.store.open()?;
        for culture in &cultures {
            let (filter, mut values) = registry_filter(hive, &key);
            values.push(Value::Text(culture.clone()));
            let sql = format!(
                "{} WHERE {} AND i.culture = ? ORDER BY p.id LIMIT 1",
                DETAIL_SELECT, filter
            );
            let detail = conn
                .query_row(&sql, params_from_iter(values.iter()), detail_from_row)
                .optional()
                .context("Failed to look up policy by registry path")?;
            if detail.is_some() {
                return Ok(detail);
            }
        }
        Ok(None)
    }
}

const DETAIL_SELECT: &str = "SELECT p.id, p.ns, p.policy_name, p.category_key, p.hive, p.reg_key,
        p.reg_value, p.value_type, p.product_hint, i.culture, i.display_name, i.explain_text,
        i.category_path, i.presentation_blob
    FROM policies p
    JOIN policy_i18n i ON i.policy_id = p.id";

fn detail_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PolicyDetail> {
    let namespace: String = row.get(1)?;
    let policy_name: String = row.get(2)?;
    Ok(PolicyDetail {
        policy_id: row.get(0)?,
        unique_id: unique_id(&namespace, &policy_name),
        namespace,
        policy_name,
        category_key: row.get(3)?,
        hive: row.get(4)?,
        registry_key: row.get(5)?,
        registry_value: row.get(6)?,
        value_type: row.get(7)?,
        product_hint: row.get(8)?,
        culture: row.get(9)?,
        display_name: row.get(10)?,
        explain_text: row.get(11)?,
        category_path: row.get(12)?,
        presentation: row.get(13)?,
    })
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled.into());
    }
    Ok(())
}

fn record(candidates: &mut HashMap<(i64, String), MatchClass>, key: (i64, String), class: MatchClass) {
    candidates
        .entry(key)
        .and_modify(|existing| *existing = (*existing).max(class))
        .or_insert(class);
}

fn in_list(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn query_keys(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Split an optional hive prefix off a registry path and normalize separators
///
/// `HKLM\Software\X`, `HKEY_LOCAL_MACHINE/Software/X` and
/// `Computer\HKLM\Software\X` all give `(Some(Machine), "Software\X")`.
pub fn parse_registry_path(path: &str) -> (Option<RegistryHive>, String) {
    let normalized = path.trim().replace('/', "\\");
    let mut parts: Vec<&str> = normalized.split('\\').filter(|p| !p.is_empty()).collect();

    if parts.first().is_some_and(|p| p.eq_ignore_ascii_case("computer")) {
        parts.remove(0);
    }

    let hive = parts.first().and_then(|first| match first.to_ascii_uppercase().as_str() {
        "HKLM" | "HKEY_LOCAL_MACHINE" => Some(RegistryHive::Machine),
        "HKCU" | "HKEY_CURRENT_USER" => Some(RegistryHive::User),
        _ => None,
    });
    if hive.is_some() {
        parts.remove(0);
    }

    (hive, parts.join("\\"))
}

/// WHERE fragment matching a registry key or key plus value name
fn registry_filter(hive: Option<RegistryHive>, path: &str) -> (String, Vec<Value>) {
    let mut filter = "(p.reg_key = ? COLLATE NOCASE
          OR (p.reg_value IS NOT NULL AND p.reg_key || '\\' || p.reg_value = ? COLLATE NOCASE))"
        .to_string();
    let mut values = vec![Value::Text(path.to_string()), Value::Text(path.to_string())];
    if let Some(hive) = hive {
        filter.push_str(" AND p.hive IN (?, ?)");
        values.push(Value::Text(hive.to_string()));
        values.push(Value::Text(RegistryHive::Both.to_string()));
    }
    (filter, values)
}

fn registry_lookup_sql(hive: Option<RegistryHive>, path: &str, cultures: &[String]) -> (String, Vec<Value>) {
    let (filter, mut values) = registry_filter(hive, path);
    values.extend(cultures.iter().map(|c| Value::Text(c.clone())));
    let sql = format!(
        "SELECT p.id, i.culture FROM policies p
         JOIN policy_i18n i ON i.policy_id = p.id
         WHERE {} AND i.culture IN ({})",
        filter,
        in_list(cultures.len())
    );
    (sql, values)
}

/// `{col col} : "g1 g2 ..."`, a substring match of `text` within the columns
fn phrase_expr(columns: &[&str], text: &str) -> Option<String> {
    let tokens: Vec<String> = grams(text).iter().map(|g| encode_gram(g)).collect();
    if tokens.is_empty() || columns.is_empty() {
        return None;
    }
    Some(format!("{{{}}} : \"{}\"", columns.join(" "), tokens.join(" ")))
}

/// Per-segment phrases joined with AND (all segments) or OR (any)
fn segments_expr(columns: &[&str], segments: &[String], and_mode: bool) -> Option<String> {
    let parts: Vec<String> = segments
        .iter()
        .filter_map(|s| phrase_expr(columns, s))
        .map(|p| format!("({})", p))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(if and_mode { " AND " } else { " OR " }))
}

/// Any single n-gram of the query
fn permissive_expr(columns: &[&str], texts: &[&str]) -> Option<String> {
    if columns.is_empty() {
        return None;
    }
    let mut tokens: Vec<String> = Vec::new();
    for text in texts {
        for gram in unique_grams(text) {
            let token = encode_gram(&gram);
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
    }
    tokens.truncate(MAX_OR_GRAMS);
    if tokens.is_empty() {
        return None;
    }
    let cols = columns.join(" ");
    Some(
        tokens
            .iter()
            .map(|t| format!("({{{}}} : {})", cols, t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Full-text expressions to run, strongest class first
fn fts_expressions(query: &ParsedQuery, fields: SearchFields, and_mode: bool) -> Vec<(MatchClass, String)> {
    let mut strict_cols = Vec::new();
    let mut loose_cols = Vec::new();
    if fields.contains(SearchFields::NAME) {
        strict_cols.push("title_norm");
        loose_cols.push("title_loose");
    }
    if fields.contains(SearchFields::DESCRIPTION) {
        strict_cols.push("desc_norm");
        loose_cols.push("desc_loose");
    }
    if fields.contains(SearchFields::REGISTRY) {
        strict_cols.push("registry_path");
    }
    if fields.contains(SearchFields::ID) {
        strict_cols.push("tags");
        loose_cols.push("tags");
    }

    let mut passes = Vec::new();

    if query.phrase {
        if let Some(expr) = phrase_expr(&strict_cols, &query.strict) {
            passes.push((MatchClass::Phrase, expr));
        }
        if let Some(expr) = phrase_expr(&loose_cols, &query.loose) {
            passes.push((MatchClass::Phrase, expr));
        }
    }

    if let Some(expr) = segments_expr(&strict_cols, &query.segments, and_mode) {
        passes.push((MatchClass::Strict, expr));
    }
    let loose_segments: Vec<String> = query.loose_segments.iter().filter(|s| !s.is_empty()).cloned().collect();
    if let Some(expr) = segments_expr(&loose_cols, &loose_segments, and_mode) {
        passes.push((MatchClass::Loose, expr));
    }

    if !query.precise && !and_mode {
        let mut all_cols = strict_cols.clone();
        for col in &loose_cols {
            if !all_cols.contains(col) {
                all_cols.push(col);
            }
        }
        if let Some(expr) = permissive_expr(&all_cols, &[&query.strict, &query.loose]) {
            passes.push((MatchClass::Permissive, expr));
        }
    }

    passes
}

/// Best-ranked index rows of the requested cultures; rows of other cultures never count against `cap`
fn fts_candidates(conn: &Connection, expr: &str, cultures: &[String], cap: usize) -> Result<Vec<(i64, String)>> {
    let sql = format!(
        "SELECT m.policy_id, m.culture
         FROM policy_fts
         JOIN policy_fts_map m ON m.rowid = policy_fts.rowid
         WHERE policy_fts MATCH ? AND m.culture IN ({})
         ORDER BY rank
         LIMIT ?",
        in_list(cultures.len())
    );
    let mut values = vec![Value::Text(expr.to_string())];
    values.extend(cultures.iter().map(|c| Value::Text(c.clone())));
    values.push(Value::Integer(i64::try_from(cap).unwrap_or(i64::MAX)));
    query_keys(conn, &sql, values).with_context(|| format!("Full-text query failed: {}", expr))
}

/// Candidate rows fetched per pass for a result limit
fn candidate_cap(limit: usize) -> usize {
    limit
        .saturating_mul(CANDIDATES_PER_RESULT)
        .clamp(MIN_CANDIDATES, i64::MAX as usize)
}

/// Culture fallback: a hit in the first or second requested culture always survives, a hit in a
/// later culture only when the policy has no row in either; one hit per policy remains, by priority
fn surviving_candidates(
    conn: &Connection,
    candidates: HashMap<(i64, String), MatchClass>,
    cultures: &[String],
) -> Result<HashMap<(i64, String), MatchClass>> {
    let explicit = &cultures[..cultures.len().min(2)];
    let mut has_explicit: HashMap<i64, bool> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT culture FROM policy_i18n WHERE policy_id = ?1")?;
        for (policy_id, _) in candidates.keys() {
            if has_explicit.contains_key(policy_id) {
                continue;
            }
            let present = stmt
                .query_map([policy_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            has_explicit.insert(*policy_id, present.iter().any(|c| explicit.contains(c)));
        }
    }

    let rank = |culture: &str| cultures.iter().position(|c| c == culture).unwrap_or(usize::MAX);
    let mut best: HashMap<i64, (usize, String, MatchClass)> = HashMap::new();
    for ((policy_id, culture), class) in candidates {
        // Later cultures only stand in for policies untranslated in both explicit ones
        let allowed = explicit.contains(&culture) || !has_explicit.get(&policy_id).copied().unwrap_or(false);
        if !allowed {
            continue;
        }
        let priority = rank(&culture);
        match best.get(&policy_id) {
            Some((current, _, _)) if *current <= priority => {}
            _ => {
                best.insert(policy_id, (priority, culture, class));
            }
        }
    }

    Ok(best
        .into_iter()
        .map(|(policy_id, (_, culture, class))| ((policy_id, culture), class))
        .collect())
}

/// Final score for one candidate, or `None` if it must be dropped
fn rescore(
    query: &ParsedQuery,
    row: &CandidateRow,
    class: MatchClass,
    fields: SearchFields,
    and_mode: bool,
) -> Option<f64> {
    let texts = FieldTexts::from_row(row);

    if and_mode && !class.is_structural() {
        let all_present = query
            .segments
            .iter()
            .zip(&query.loose_segments)
            .all(|(seg, loose_seg)| texts.segment_matches(seg, loose_seg, fields));
        if !all_present {
            return None;
        }
    }

    let use_title = fields.contains(SearchFields::NAME);
    let use_desc = fields.contains(SearchFields::DESCRIPTION);

    let title_overlap = if use_title {
        gram_overlap(&query.strict, &texts.title_s).max(gram_overlap(&query.loose, &texts.title_l))
    } else {
        0.0
    };
    let desc_overlap = if use_desc {
        gram_overlap(&query.strict, &texts.desc_s).max(gram_overlap(&query.loose, &texts.desc_l))
    } else {
        0.0
    };

    if class == MatchClass::Permissive {
        // Best of the whole query and each segment alone
        let best = query
            .segments
            .iter()
            .zip(&query.loose_segments)
            .map(|(seg, loose_seg)| texts.best_overlap(seg, loose_seg, fields))
            .fold(texts.best_overlap(&query.strict, &query.loose, fields), f64::max);
        if best < PERMISSIVE_MIN_OVERLAP {
            return None;
        }
    }

    let mut score = class.base_score();

    let title_word = use_title && contains_word(&texts.title_s, &query.strict);
    if title_word {
        score += WORD_BOUNDARY_TITLE;
    }
    if use_desc && contains_word(&texts.desc_s, &query.strict) {
        score += WORD_BOUNDARY_DESC;
    }
    score += title_overlap * OVERLAP_TITLE;
    score += desc_overlap * OVERLAP_DESC;

    if query.precise {
        let id_contains = texts.id_s.contains(&query.strict)
            || (!query.loose.is_empty() && texts.name_l.contains(&query.loose));
        let name_contains = use_title
            && (texts.title_s.contains(&query.strict)
                || (!query.loose.is_empty() && texts.title_l.contains(&query.loose)));

        if id_contains {
            score += PRECISE_ID_CONTAINS;
        }
        if name_contains {
            score += PRECISE_NAME_CONTAINS;
        }

        let registry_contains = fields.contains(SearchFields::REGISTRY)
            && texts.registry_s.contains(&query.strict);
        let only_description = desc_overlap > 0.0
            && title_overlap == 0.0
            && !title_word
            && !id_contains
            && !registry_contains;
        if only_description && !class.is_structural() {
            score -= DESCRIPTION_ONLY_PENALTY;
        }
    }

    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_query() {
        let q = ParsedQuery::parse("  Block  Pop-Ups ");
        assert_eq!(q.raw, "Block  Pop-Ups");
        assert_eq!(q.strict, "block pop-ups");
        assert_eq!(q.loose, "blockpopups");
        assert_eq!(q.segments, vec!["block", "pop-ups"]);
        assert_eq!(q.loose_segments, vec!["block", "popups"]);
        assert!(!q.phrase);
        assert!(!q.short);
        assert!(!q.precise);
    }

    #[test]
    fn test_parse_phrase_and_precise() {
        let phrase = ParsedQuery::parse("\"block pop\"");
        assert!(phrase.phrase);
        assert_eq!(phrase.raw, "block pop");

        // Quotes without a space are not a phrase
        assert!(!ParsedQuery::parse("\"popups\"").phrase);

        assert!(ParsedQuery::parse("SmartScreen").precise);
        assert!(!ParsedQuery::parse("popup").precise);
        assert!(ParsedQuery::parse("自動更新").precise);
        assert!(!ParsedQuery::parse("更新").precise);
        assert!(ParsedQuery::parse("ie").short);
    }

    #[test]
    fn test_parse_registry_path() {
        let (hive, path) = parse_registry_path("HKLM\\Software\\Policies\\Contoso");
        assert_eq!(hive, Some(RegistryHive::Machine));
        assert_eq!(path, "Software\\Policies\\Contoso");

        let (hive, path) = parse_registry_path("Computer/HKEY_CURRENT_USER/Software/X/");
        assert_eq!(hive, Some(RegistryHive::User));
        assert_eq!(path, "Software\\X");

        let (hive, path) = parse_registry_path("Software\\X\\Value");
        assert_eq!(hive, None);
        assert_eq!(path, "Software\\X\\Value");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }

    #[test]
    fn test_phrase_expr() {
        let expr = phrase_expr(&["title_norm", "tags"], "abcd").unwrap();
        assert_eq!(
            expr,
            format!("{{title_norm tags}} : \"{} {}\"", encode_gram("abc"), encode_gram("bcd"))
        );
        assert!(phrase_expr(&["title_norm"], "ab").is_none());
        assert!(phrase_expr(&[], "abcd").is_none());
    }

    #[test]
    fn test_segments_expr_joins() {
        let segs = vec!["abc".to_string(), "xyz".to_string()];
        let and = segments_expr(&["title_norm"], &segs, true).unwrap();
        assert!(and.contains(" AND "));
        let or = segments_expr(&["title_norm"], &segs, false).unwrap();
        assert!(or.contains(" OR "));
    }

    #[test]
    fn test_precise_query_skips_permissive_pass() {
        let precise = ParsedQuery::parse("smartscreen");
        let passes = fts_expressions(&precise, SearchFields::default(), false);
        assert!(passes.iter().all(|(class, _)| *class != MatchClass::Permissive));

        let broad = ParsedQuery::parse("popup");
        let passes = fts_expressions(&broad, SearchFields::default(), false);
        assert!(passes.iter().any(|(class, _)| *class == MatchClass::Permissive));
    }

    #[test]
    fn test_and_mode_skips_permissive_pass() {
        let q = ParsedQuery::parse("block popups");
        let passes = fts_expressions(&q, SearchFields::default(), true);
        assert!(passes.iter().all(|(class, _)| *class != MatchClass::Permissive));
    }

    #[test]
    fn test_default_fields() {
        let fields = SearchFields::default();
        assert!(fields.contains(SearchFields::NAME | SearchFields::ID | SearchFields::REGISTRY));
        assert!(!fields.contains(SearchFields::DESCRIPTION));
        assert!(SearchFields::with_description(true).contains(SearchFields::DESCRIPTION));
    }

    fn row(display: &str, explain: &str) -> CandidateRow {
        CandidateRow {
            policy_id: 1,
            namespace: "Contoso.Browser".to_string(),
            policy_name: "BlockPopups".to_string(),
            hive: "Machine".to_string(),
            registry_key: "Software\\Policies\\Contoso".to_string(),
            registry_value: Some("BlockPopups".to_string()),
            value_type: "Toggle".to_string(),
            product_hint: None,
            culture: "en-US".to_string(),
            display_name: display.to_string(),
            explain_text: explain.to_string(),
        }
    }

    #[test]
    fn test_rescore_and_mode_drops_missing_segment() {
        let q = ParsedQuery::parse("block zzzqqq");
        let r = row("Block pop-ups", "Stops windows");
        assert!(rescore(&q, &r, MatchClass::Strict, SearchFields::default(), true).is_none());
        assert!(rescore(&q, &r, MatchClass::Strict, SearchFields::default(), false).is_some());
    }

    #[test]
    fn test_rescore_word_boundary_beats_partial() {
        let q = ParsedQuery::parse("pop");
        let whole = rescore(&q, &row("Block pop ups", ""), MatchClass::Strict, SearchFields::default(), false).unwrap();
        let partial = rescore(&q, &row("Block popups", ""), MatchClass::Strict, SearchFields::default(), false).unwrap();
        assert!(whole > partial);
    }

    #[test]
    fn test_rescore_description_only_penalty() {
        let q = ParsedQuery::parse("telemetry");
        let fields = SearchFields::with_description(true);
        let in_title = rescore(&q, &row("Configure telemetry", ""), MatchClass::Strict, fields, false).unwrap();
        let in_desc = rescore(&q, &row("Configure data", "Controls telemetry upload"), MatchClass::Strict, fields, false)
            .unwrap();
        assert!(in_title > in_desc);
        assert!(in_desc < MatchClass::Strict.base_score());
    }

    #[test]
    fn test_rescore_permissive_ignores_absent_words() {
        let near = CandidateRow {
            policy_name: "ClockSync".to_string(),
            registry_value: Some("Sync".to_string()),
            ..row("Clock settings", "")
        };
        let single = ParsedQuery::parse("block");
        let with_noise = ParsedQuery::parse("block zzqxjv");
        let fields = SearchFields::default();
        assert!(rescore(&single, &near, MatchClass::Permissive, fields, false).is_some());
        assert!(rescore(&with_noise, &near, MatchClass::Permissive, fields, false).is_some());
        assert!(rescore(&with_noise, &near, MatchClass::Permissive, fields, true).is_none());
    }

    #[test]
    fn test_candidate_cap_saturates() {
        assert_eq!(candidate_cap(0), MIN_CANDIDATES);
        assert_eq!(candidate_cap(50), 1000);
        assert_eq!(candidate_cap(usize::MAX), i64::MAX as usize);
    }

    #[test]
    fn test_surviving_candidates_culture_rules() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE policy_i18n (policy_id INTEGER, culture TEXT);
             INSERT INTO policy_i18n VALUES
                (1, 'en-US'), (1, 'de-DE'), (1, 'fr-FR'),
                (2, 'fr-FR'),
                (3, 'en-US'), (3, 'fr-FR'),
                (4, 'en-US'), (4, 'de-DE');",
        )
        .unwrap();
        let cultures = vec!["en-US".to_string(), "de-DE".to_string(), "fr-FR".to_string()];
        let key = |id: i64, c: &str| (id, c.to_string());

        let candidates: HashMap<_, _> = [
            // Second culture matched while the primary row did not
            (key(1, "de-DE"), MatchClass::Strict),
            (key(1, "fr-FR"), MatchClass::Strict),
            // Untranslated in both explicit cultures
            (key(2, "fr-FR"), MatchClass::Loose),
            // Primary row exists, later culture is suppressed
            (key(3, "fr-FR"), MatchClass::Phrase),
            // Both explicit cultures matched, primary wins
            (key(4, "de-DE"), MatchClass::Phrase),
            (key(4, "en-US"), MatchClass::Permissive),
        ]
        .into_iter()
        .collect();

        let survivors = surviving_candidates(&conn, candidates, &cultures).unwrap();
        let mut keys: Vec<_> = survivors.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec![key(1, "de-DE"), key(2, "fr-FR"), key(4, "en-US")]);
        assert_eq!(survivors[&key(4, "en-US")], MatchClass::Permissive);
    }

    #[test]
    fn test_rescore_permissive_requires_overlap() {
        let q = ParsedQuery::parse("popcorn");
        let r = row("Block popups", "");
        assert!(rescore(&q, &r, MatchClass::Permissive, SearchFields::default(), false).is_none());
    }
}
