//! Relation-graph grouping of records.
//!
//! Records that share a relation value (a URL, artifact name, or page name)
//! are linked; [`GroupingEngine::group`] partitions the record set into the
//! connected components of that graph so related records are scored
//! together.
//!
//! The traversal is an explicit-stack depth-first search bounded by
//! independently tunable safeguards:
//!
//! | Safeguard | Effect when hit |
//! |-----------|-----------------|
//! | iteration cap | component closes with what it has |
//! | group-size cap | component stops accepting members |
//! | stack-size cap | newest stack entries are dropped (lossy, never corrupting) |
//! | component time-box | component closes with what it has |
//! | pre-emptive skip | record becomes a singleton without a search |
//! | pass time-box | whole result replaced by one singleton per record |
//!
//! Records left behind by a capped component stay unvisited and seed later
//! components, so the output is always a partition of the input.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GroupingConfig;
use crate::models::{Group, Record};

/// Bipartite adjacency between records and relation values.
///
/// Records are addressed by their index in the input slice, values by the
/// order in which they were first seen, so traversal order depends only on
/// the input order.
#[derive(Debug, Default)]
pub struct RelationGraph {
    values: Vec<String>,
    value_ids: HashMap<String, usize>,
    value_records: Vec<Vec<usize>>,
    record_values: Vec<Vec<usize>>,
}

impl RelationGraph {
    pub fn build(records: &[Record], config: &GroupingConfig) -> Self {
        let mut graph = RelationGraph {
            values: Vec::new(),
            value_ids: HashMap::new(),
            value_records: Vec::new(),
            record_values: Vec::with_capacity(records.len()),
        };

        for (index, record) in records.iter().enumerate() {
            let mut ids = Vec::new();
            for value in relation_values(record, config) {
                let id = *graph.value_ids.entry(value).or_insert_with_key(|v| {
                    graph.values.push(v.clone());
                    graph.value_records.push(Vec::new());
                    graph.values.len() - 1
                });
                ids.push(id);
                graph.value_records[id].push(index);
            }
            graph.record_values.push(ids);
        }

        graph
    }

    pub fn record_count(&self) -> usize {
        self.record_values.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Relation values attached to the record at `index`.
    pub fn values_of(&self, index: usize) -> Vec<&str> {
        self.record_values
            .get(index)
            .map(|ids| ids.iter().map(|&id| self.values[id].as_str()).collect())
            .unwrap_or_default()
    }

    /// Indexes of records carrying `value`.
    pub fn records_with(&self, value: &str) -> Option<&[usize]> {
        self.value_ids
            .get(value)
            .map(|&id| self.value_records[id].as_slice())
    }

    /// Upper bound on the component reachable in one hop from `index`.
    fn reach_estimate(&self, index: usize) -> usize {
        self.record_values[index]
            .iter()
            .map(|&id| self.value_records[id].len())
            .sum()
    }
}

/// Sanitized, per-record de-duplicated relation values, in field order.
pub fn relation_values(record: &Record, config: &GroupingConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for field in record.relation_fields().into_iter().flatten() {
        for value in sanitize_field(field, config) {
            if seen.insert(value.clone()) {
                out.push(value);
            }
        }
    }
    out
}

/// Split one raw relation field into normalized values.
///
/// Control characters are dropped (line breaks and tabs become spaces), the
/// field is cut to `max_field_chars`, split on `,` and `;`, whitespace is
/// collapsed, values are lower-cased, URL-shaped values are reduced to
/// their file stem (or domain), and at most `max_values_per_field`
/// distinct values are kept.
pub fn sanitize_field(raw: &str, config: &GroupingConfig) -> Vec<String> {
    let limit = if config.max_field_chars == 0 {
        usize::MAX
    } else {
        config.max_field_chars
    };
    let cleaned: String = raw
        .chars()
        .take(limit)
        .filter_map(|c| match c {
            '\n' | '\r' | '\t' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    let mut out: Vec<String> = Vec::new();
    for piece in cleaned.split([',', ';']) {
        if config.max_values_per_field > 0 && out.len() >= config.max_values_per_field {
            break;
        }
        let collapsed = piece.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        let value = if looks_like_url(&collapsed) {
            match url_token(&collapsed) {
                Some(token) => token,
                None => continue,
            }
        } else {
            collapsed
        };
        let value = value.to_lowercase();
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

fn looks_like_url(value: &str) -> bool {
    value.contains("://") || value.starts_with("www.")
}

/// `https://host/a/b/report.pdf?x=1` → `report`; `https://host/` → `host`.
fn url_token(value: &str) -> Option<String> {
    let rest = value.split_once("://").map(|(_, r)| r).unwrap_or(value);
    let rest = rest.split(['?', '#']).next().unwrap_or("");
    let (domain, path) = rest.split_once('/').unwrap_or((rest, ""));
    let basename = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let stem = match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => basename,
    };
    let token = if stem.is_empty() {
        domain.trim_start_matches("www.")
    } else {
        stem
    };
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// What happened during one grouping pass.
///
/// `fell_back` is set only when the pass time-box forced the singleton
/// fallback; the counters record every other safeguard trigger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupingReport {
    pub records: usize,
    pub relation_values: usize,
    pub groups: usize,
    pub singletons: usize,
    pub largest_group: usize,
    pub iteration_caps: usize,
    pub size_caps: usize,
    pub stack_trims: usize,
    pub trimmed_entries: usize,
    pub component_timeouts: usize,
    pub preemptive_skips: usize,
    pub fell_back: bool,
    pub elapsed_ms: u64,
}

impl GroupingReport {
    /// True when any safeguard degraded the result.
    pub fn degraded(&self) -> bool {
        self.fell_back
            || self.iteration_caps > 0
            || self.size_caps > 0
            || self.stack_trims > 0
            || self.component_timeouts > 0
            || self.preemptive_skips > 0
    }
}

#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub groups: Vec<Group>,
    pub report: GroupingReport,
}

enum Search {
    Component(Vec<usize>),
    PassExpired,
}

/// Time source for the time-boxes.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Partitions records into relation-connected groups under fixed limits.
pub struct GroupingEngine {
    config: GroupingConfig,
    clock: Clock,
}

impl GroupingEngine {
    pub fn new(config: GroupingConfig) -> Self {
        Self::with_clock(config, Arc::new(Instant::now))
    }

    pub fn with_clock(config: GroupingConfig, clock: Clock) -> Self {
        Self { config, clock }
    }

    fn elapsed(&self, since: Instant) -> Duration {
        (self.clock)().saturating_duration_since(since)
    }

    /// Partition `records`. Never fails; on pass time-out the result is one
    /// singleton group per record with `report.fell_back` set. Groups are
    /// sorted largest first; ties keep discovery order.
    pub fn group(&self, records: &[Record]) -> GroupingOutcome {
        let started = (self.clock)();
        let mut report = GroupingReport {
            records: records.len(),
            ..GroupingReport::default()
        };

        if records.is_empty() {
            return finish(Vec::new(), report, Duration::ZERO);
        }

        let graph = RelationGraph::build(records, &self.config);
        report.relation_values = graph.value_count();
        debug!(
            records = records.len(),
            values = graph.value_count(),
            "relation graph built"
        );

        let pass_limit = self.config.total_timeout();
        let mut visited = vec![false; records.len()];
        let mut components: Vec<Vec<usize>> = Vec::new();

        for start in 0..records.len() {
            if visited[start] {
                continue;
            }
            if self.elapsed(started) >= pass_limit {
                return fallback(records, report, self.elapsed(started));
            }

            if graph.record_values[start].is_empty() {
                visited[start] = true;
                components.push(vec![start]);
                continue;
            }

            if self.should_skip(&graph, start) {
                report.preemptive_skips += 1;
                visited[start] = true;
                components.push(vec![start]);
                continue;
            }

            match self.search(&graph, start, &mut visited, &mut report, started, pass_limit) {
                Search::Component(members) => components.push(members),
                Search::PassExpired => return fallback(records, report, self.elapsed(started)),
            }
        }

        components.sort_by_key(|c| std::cmp::Reverse(c.len()));
        let groups = components
            .into_iter()
            .map(|members| Group {
                keys: members.into_iter().map(|i| records[i].key.clone()).collect(),
            })
            .collect();

        finish(groups, report, self.elapsed(started))
    }

    fn should_skip(&self, graph: &RelationGraph, start: usize) -> bool {
        let cap = self.config.max_group_size;
        let factor = self.config.preemptive_skip_factor;
        cap > 0 && factor > 0 && graph.reach_estimate(start) > cap.saturating_mul(factor)
    }

    fn search(
        &self,
        graph: &RelationGraph,
        start: usize,
        visited: &mut [bool],
        report: &mut GroupingReport,
        pass_started: Instant,
        pass_limit: Duration,
    ) -> Search {
        let config = &self.config;
        let component_limit = config.component_timeout();
        let component_started = (self.clock)();

        let mut members = Vec::new();
        let mut stack = vec![start];
        // Cycle guard: a record is pushed at most once per component.
        let mut stacked: HashSet<usize> = HashSet::from([start]);
        // A value's record list only needs scanning once per component.
        let mut expanded: HashSet<usize> = HashSet::new();
        let mut iterations = 0usize;

        while let Some(current) = stack.pop() {
            iterations += 1;
            if config.max_iterations > 0 && iterations > config.max_iterations {
                report.iteration_caps += 1;
                break;
            }
            if let Some(limit) = component_limit {
                if self.elapsed(component_started) > limit {
                    report.component_timeouts += 1;
                    break;
                }
            }
            if iterations % 64 == 0 && self.elapsed(pass_started) >= pass_limit {
                return Search::PassExpired;
            }

            if visited[current] {
                continue;
            }
            if config.max_group_size > 0 && members.len() >= config.max_group_size {
                report.size_caps += 1;
                break;
            }
            visited[current] = true;
            members.push(current);

            for &value in &graph.record_values[current] {
                if !expanded.insert(value) {
                    continue;
                }
                for &neighbor in &graph.value_records[value] {
                    if !visited[neighbor] && stacked.insert(neighbor) {
                        stack.push(neighbor);
                    }
                }
            }

            if config.max_stack_size > 0 && stack.len() > config.max_stack_size {
                report.stack_trims += 1;
                report.trimmed_entries += stack.len() - config.max_stack_size;
                stack.truncate(config.max_stack_size);
            }
        }

        Search::Component(members)
    }
}

fn finish(groups: Vec<Group>, mut report: GroupingReport, elapsed: Duration) -> GroupingOutcome {
    report.groups = groups.len();
    report.singletons = groups.iter().filter(|g| g.len() == 1).count();
    report.largest_group = groups.iter().map(Group::len).max().unwrap_or(0);
    report.elapsed_ms = elapsed.as_millis() as u64;

    if report.degraded() && !report.fell_back {
        info!(
            iteration_caps = report.iteration_caps,
            size_caps = report.size_caps,
            stack_trims = report.stack_trims,
            component_timeouts = report.component_timeouts,
            preemptive_skips = report.preemptive_skips,
            "grouping safeguards triggered"
        );
    }

    GroupingOutcome { groups, report }
}

fn fallback(records: &[Record], mut report: GroupingReport, elapsed: Duration) -> GroupingOutcome {
    warn!(
        records = records.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "grouping pass timed out, falling back to singleton groups"
    );
    report.fell_back = true;
    let groups = records.iter().map(|r| Group::singleton(r.key.clone())).collect();
    finish(groups, report, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn generous() -> GroupingConfig {
        GroupingConfig {
            max_iterations: 0,
            max_group_size: 0,
            max_stack_size: 0,
            component_timeout_ms: 0,
            total_timeout_ms: 60_000,
            preemptive_skip_factor: 0,
            ..GroupingConfig::default()
        }
    }

    fn rec(key: &str, artifacts: Option<&str>) -> Record {
        let r = Record::new(key, format!("summary of {key}"));
        match artifacts {
            Some(a) => r.with_artifacts(a),
            None => r,
        }
    }

    fn key_sets(outcome: &GroupingOutcome) -> Vec<BTreeSet<String>> {
        outcome
            .groups
            .iter()
            .map(|g| g.keys.iter().cloned().collect())
            .collect()
    }

    fn assert_partition(records: &[Record], outcome: &GroupingOutcome) {
        let mut seen = HashSet::new();
        for group in &outcome.groups {
            assert!(!group.is_empty(), "empty group");
            for key in &group.keys {
                assert!(seen.insert(key.clone()), "duplicate key {key}");
            }
        }
        let expected: HashSet<String> = records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn shared_values_form_groups() {
        let records = vec![
            rec("A", Some("x")),
            rec("B", Some("x")),
            rec("C", Some("y")),
            rec("D", Some("y")),
            rec("E", None),
            rec("F", Some("x")),
        ];
        let outcome = GroupingEngine::new(generous()).group(&records);
        assert_partition(&records, &outcome);

        let sets = key_sets(&outcome);
        assert_eq!(sets.len(), 3);
        let set = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(sets[0], set(&["A", "B", "F"]));
        assert_eq!(sets[1], set(&["C", "D"]));
        assert_eq!(sets[2], set(&["E"]));
        assert!(!outcome.report.degraded());
    }

    #[test]
    fn empty_input_gives_empty_partition() {
        let outcome = GroupingEngine::new(GroupingConfig::default()).group(&[]);
        assert!(outcome.groups.is_empty());
        assert!(!outcome.report.fell_back);
    }

    #[test]
    fn transitive_links_across_fields() {
        let records = vec![
            Record::new("A", "a").with_urls("https://wiki.example.com/pages/Design.html"),
            Record::new("B", "b").with_pages("design; Release Notes"),
            Record::new("C", "c").with_artifacts("release notes"),
        ];
        let outcome = GroupingEngine::new(generous()).group(&records);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].len(), 3);
    }

    #[test]
    fn exhausted_pass_budget_falls_back_to_singletons() {
        let records: Vec<Record> = (0..50).map(|i| rec(&format!("K-{i}"), Some("hub"))).collect();
        let config = GroupingConfig {
            total_timeout_ms: 0,
            ..generous()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert!(outcome.report.fell_back);
        assert_eq!(outcome.groups.len(), records.len());
        assert!(outcome.groups.iter().all(|g| g.len() == 1));
        assert_partition(&records, &outcome);
    }

    #[test]
    fn hub_value_is_bounded_by_group_size() {
        let records: Vec<Record> = (0..10_000)
            .map(|i| rec(&format!("HUB-{i:05}"), Some("common-lib.jar")))
            .collect();
        let config = GroupingConfig {
            max_group_size: 500,
            preemptive_skip_factor: 0,
            total_timeout_ms: 60_000,
            ..GroupingConfig::default()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert_partition(&records, &outcome);
        assert!(!outcome.report.fell_back);
        assert!(outcome.groups.iter().all(|g| g.len() <= 500));
        assert_eq!(outcome.groups.len(), 20);
        assert!(outcome.report.size_caps > 0);
    }

    #[test]
    fn hub_value_is_skipped_preemptively() {
        let records: Vec<Record> = (0..10_000)
            .map(|i| rec(&format!("HUB-{i:05}"), Some("common-lib.jar")))
            .collect();
        let config = GroupingConfig {
            max_group_size: 500,
            total_timeout_ms: 60_000,
            ..GroupingConfig::default()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert_partition(&records, &outcome);
        assert!(outcome.groups.iter().all(|g| g.len() <= 500));
        assert!(outcome.report.preemptive_skips > 0);
    }

    #[test]
    fn iteration_cap_splits_chain() {
        // A-B share v1, B-C share v2, ... a chain of five.
        let records = vec![
            rec("A", Some("v1")),
            rec("B", Some("v1, v2")),
            rec("C", Some("v2; v3")),
            rec("D", Some("v3,v4")),
            rec("E", Some("v4")),
        ];
        let config = GroupingConfig {
            max_iterations: 2,
            ..generous()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert_partition(&records, &outcome);
        assert!(outcome.report.iteration_caps > 0);
        assert!(outcome.groups.iter().all(|g| g.len() <= 2));
    }

    /// A clock that moves forward one millisecond every time it is read.
    fn ticking_clock() -> Clock {
        let base = Instant::now();
        let ticks = Arc::new(std::sync::atomic::AtomicU64::new(0));
        Arc::new(move || {
            let n = ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            base + Duration::from_millis(n)
        })
    }

    #[test]
    fn component_time_box_closes_long_chain() {
        let records: Vec<Record> = (0..20)
            .map(|i| rec(&format!("L-{i:02}"), Some(&format!("c{i}, c{}", i + 1))))
            .collect();
        let config = GroupingConfig {
            component_timeout_ms: 3,
            ..generous()
        };
        let outcome = GroupingEngine::with_clock(config, ticking_clock()).group(&records);
        assert_partition(&records, &outcome);
        let report = &outcome.report;
        assert!(report.component_timeouts > 0);
        assert!(!report.fell_back);
        assert_eq!(report.iteration_caps, 0);
        assert_eq!(report.size_caps, 0);
        assert_eq!(report.stack_trims, 0);
        assert_eq!(report.preemptive_skips, 0);
        assert!(outcome.groups.len() > 1);
    }

    #[test]
    fn stack_trim_is_lossy_but_keeps_partition() {
        let mut records = vec![rec(
            "CENTER",
            Some("s1,s2,s3,s4,s5,s6,s7,s8,s9,s10"),
        )];
        for i in 1..=10 {
            records.push(rec(&format!("LEAF-{i}"), Some(&format!("s{i}"))));
        }
        let config = GroupingConfig {
            max_stack_size: 2,
            ..generous()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert_partition(&records, &outcome);
        assert!(outcome.report.stack_trims > 0);
        assert!(outcome.report.trimmed_entries > 0);
        assert!(outcome.groups.len() > 1);
    }

    #[test]
    fn every_safeguard_at_once_still_partitions() {
        let records: Vec<Record> = (0..300)
            .map(|i| {
                let values = format!("m{}, n{}; o{}", i % 7, i % 11, i % 13);
                rec(&format!("R-{i}"), Some(&values))
            })
            .collect();
        let config = GroupingConfig {
            max_iterations: 5,
            max_group_size: 4,
            max_stack_size: 3,
            component_timeout_ms: 1,
            total_timeout_ms: 60_000,
            preemptive_skip_factor: 25,
            ..GroupingConfig::default()
        };
        let outcome = GroupingEngine::new(config).group(&records);
        assert_partition(&records, &outcome);
        assert!(outcome.groups.iter().all(|g| g.len() <= 4));
        assert!(outcome.report.degraded());
    }

    #[test]
    fn grouping_is_deterministic() {
        let records: Vec<Record> = (0..200)
            .map(|i| rec(&format!("D-{i}"), Some(&format!("a{}, b{}", i % 9, i % 17))))
            .collect();
        let engine = GroupingEngine::new(generous());
        let first = engine.group(&records);
        let second = engine.group(&records);
        assert_eq!(first.groups, second.groups);
    }

    #[test]
    fn groups_are_sorted_largest_first() {
        let records = vec![
            rec("S", None),
            rec("P1", Some("p")),
            rec("P2", Some("p")),
            rec("Q1", Some("q")),
            rec("Q2", Some("q")),
            rec("Q3", Some("q")),
        ];
        let outcome = GroupingEngine::new(generous()).group(&records);
        let sizes: Vec<usize> = outcome.groups.iter().map(Group::len).collect();
        assert_eq!(sizes, vec![3, 2, 1]);
    }

    #[test]
    fn sanitize_strips_controls_and_collapses() {
        let config = GroupingConfig::default();
        let values = sanitize_field("  Build\u{7}Log ;\tRelease   Plan,,build log ", &config);
        assert_eq!(values, vec!["buildlog", "release plan", "build log"]);
    }

    #[test]
    fn sanitize_reduces_urls() {
        let config = GroupingConfig::default();
        let values = sanitize_field(
            "https://ci.example.com/job/42/artifact/report.pdf?x=1, https://www.example.org/, www.docs.io/guide/",
            &config,
        );
        assert_eq!(values, vec!["report", "example.org", "guide"]);
    }

    #[test]
    fn sanitize_applies_caps() {
        let config = GroupingConfig {
            max_values_per_field: 2,
            ..GroupingConfig::default()
        };
        assert_eq!(sanitize_field("a,b,c,d", &config), vec!["a", "b"]);

        let config = GroupingConfig {
            max_field_chars: 5,
            ..GroupingConfig::default()
        };
        assert_eq!(sanitize_field("abc,defgh", &config), vec!["abc", "d"]);
    }

    #[test]
    fn graph_maps_are_consistent() {
        let records = vec![
            rec("A", Some("x, y")),
            rec("B", Some("y")),
            rec("C", Some("x; x")),
        ];
        let graph = RelationGraph::build(&records, &GroupingConfig::default());
        assert_eq!(graph.record_count(), 3);
        assert_eq!(graph.value_count(), 2);
        assert_eq!(graph.values_of(2), vec!["x"]);
        assert_eq!(graph.records_with("x"), Some(&[0usize, 2][..]));

        for (record, ids) in graph.record_values.iter().enumerate() {
            for &id in ids {
                assert!(graph.value_records[id].contains(&record));
            }
        }
        for (id, members) in graph.value_records.iter().enumerate() {
            for &record in members {
                assert!(graph.record_values[record].contains(&id));
            }
        }
    }
}
