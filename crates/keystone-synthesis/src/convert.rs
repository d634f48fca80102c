//! Conversion of confirmed candidates into persisted systems, details and
//! dependencies.
//!
//! Expected problems (a discarded selection, a merge target from another
//! project, an edge whose slug does not resolve) are reported in
//! [`ConversionResult::skipped`] and never fail the batch. Store errors roll
//! back the whole batch.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use keystone_core::candidates::{DetailCandidate, SystemCandidate};
use keystone_core::ids::{OutputId, ProjectId, SystemId};
use keystone_core::models::{
    ContextSnapshot, Criticality, Dependency, DependencyType, GameSystem, NewSystem, SnapshotTrigger,
    SynthesisStatus, SystemDetail,
};
use keystone_store::{dependencies, outputs, projects, systems, Database, SnapshotLinks, StoreError};

use crate::error::SynthesisError;
use crate::snapshots::SnapshotService;

/// What to do with one system candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SelectionAction {
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slug_override: Option<String>,
    },
    Merge {
        existing_system_id: SystemId,
    },
    Discard,
}

/// A human-confirmed decision about one system candidate, with the detail
/// candidates that should be attached to the resulting system.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemSelection {
    pub candidate: SystemCandidate,
    pub action: SelectionAction,
    pub details: Vec<DetailCandidate>,
}

impl SystemSelection {
    pub fn create(candidate: SystemCandidate) -> Self {
        Self {
            candidate,
            action: SelectionAction::Create { slug_override: None },
            details: Vec::new(),
        }
    }

    pub fn merge(candidate: SystemCandidate, existing_system_id: SystemId) -> Self {
        Self {
            candidate,
            action: SelectionAction::Merge { existing_system_id },
            details: Vec::new(),
        }
    }

    pub fn discard(candidate: SystemCandidate) -> Self {
        Self {
            candidate,
            action: SelectionAction::Discard,
            details: Vec::new(),
        }
    }

    pub fn with_slug_override(mut self, slug: impl Into<String>) -> Self {
        if let SelectionAction::Create { slug_override } = &mut self.action {
            *slug_override = Some(slug.into());
        }
        self
    }

    pub fn with_details(mut self, details: Vec<DetailCandidate>) -> Self {
        self.details = details;
        self
    }
}

/// A directed edge between two systems, named by slug.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEdge {
    pub source_slug: String,
    pub target_slug: String,
    #[serde(default)]
    pub dependency_type: DependencyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProposedEdge {
    pub fn new(source_slug: impl Into<String>, target_slug: impl Into<String>) -> Self {
        Self {
            source_slug: source_slug.into(),
            target_slug: target_slug.into(),
            dependency_type: DependencyType::default(),
            description: None,
        }
    }

    pub fn with_type(mut self, dependency_type: DependencyType) -> Self {
        self.dependency_type = dependency_type;
        self
    }

    fn label(&self) -> String {
        format!("{} -[{}]-> {}", self.source_slug, self.dependency_type, self.target_slug)
    }
}

#[derive(Clone, Debug)]
pub struct ConversionRequest {
    pub project_id: ProjectId,
    /// Output the candidates came from; marked `converted` on success.
    pub output_id: Option<OutputId>,
    pub selections: Vec<SystemSelection>,
    pub edges: Vec<ProposedEdge>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Discarded,
    MergeTargetNotInProject,
    UnresolvedSlug,
    /// Source and target resolve to the same system. Longer cycles are
    /// accepted; a system depending on itself is not.
    SelfReference,
    DuplicateEdge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    /// Candidate name or edge label.
    pub item: String,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergedSystem {
    pub system_id: SystemId,
    pub details_added: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConversionResult {
    pub created_systems: Vec<GameSystem>,
    pub created_details: Vec<SystemDetail>,
    pub created_dependencies: Vec<Dependency>,
    pub merged: Vec<MergedSystem>,
    pub skipped: Vec<SkippedItem>,
    pub snapshot: Option<ContextSnapshot>,
    /// Cycles are permitted; these are never populated.
    pub cycle_error: Option<String>,
    pub cycle_edge: Option<ProposedEdge>,
}

impl ConversionResult {
    fn skip(&mut self, item: impl Into<String>, reason: SkipReason) {
        let item = item.into();
        debug!(item = %item, reason = ?reason, "conversion item skipped");
        self.skipped.push(SkippedItem { item, reason });
    }
}

/// Lowercase ASCII alphanumerics; runs of anything else become one `-`.
/// Empty input yields `system`.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "system".to_string()
    } else {
        slug
    }
}

/// Slug a candidate asks for: its `systemSlug` if present, else its name.
pub fn candidate_slug(candidate: &SystemCandidate) -> String {
    match candidate.system_slug.as_deref() {
        Some(slug) if !slug.trim().is_empty() => slugify(slug),
        _ => slugify(&candidate.name),
    }
}

/// Default edges from each candidate's `dependencies` list, deduplicated and
/// in first-seen order.
pub fn proposed_edges(candidates: &[SystemCandidate]) -> Vec<ProposedEdge> {
    let mut seen = HashSet::new();
    let mut edges = Vec::new();
    for candidate in candidates {
        let source = candidate_slug(candidate);
        for dep in &candidate.dependencies {
            let target = slugify(dep);
            if seen.insert((source.clone(), target.clone())) {
                edges.push(ProposedEdge::new(source.clone(), target));
            }
        }
    }
    edges
}

/// Detail candidates whose `targetSystemSlug` names this candidate.
pub fn details_for(candidate: &SystemCandidate, details: &[DetailCandidate]) -> Vec<DetailCandidate> {
    let slug = candidate_slug(candidate);
    details
        .iter()
        .filter(|d| d.target_system_slug.as_deref().map(slugify).as_deref() == Some(slug.as_str()))
        .cloned()
        .collect()
}

fn unique_slug(conn: &Connection, project_id: &ProjectId, base: &str) -> Result<String, StoreError> {
    if !systems::slug_exists(conn, project_id, base)? {
        return Ok(base.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !systems::slug_exists(conn, project_id, &candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn new_system(candidate: &SystemCandidate, slug: String) -> NewSystem {
    NewSystem {
        name: candidate.name.clone(),
        slug,
        purpose: candidate.purpose.clone(),
        version: candidate.version.clone(),
        status: None,
        mvp_criticality: candidate
            .mvp_criticality
            .as_deref()
            .and_then(Criticality::parse_loose),
        description: candidate.extra_str("description").map(str::to_string),
        mechanics: candidate.extra_str("mechanics").map(str::to_string),
        notes: candidate.extra_str("notes").map(str::to_string),
    }
}

/// Slug lookup for edge resolution. Existing systems are loaded first; names
/// from this batch then shadow them, but never another batch entry.
struct SlugMap {
    ids: HashMap<String, SystemId>,
    claimed: HashSet<String>,
}

impl SlugMap {
    fn new(existing: &[GameSystem]) -> Self {
        Self {
            ids: existing.iter().map(|s| (s.slug.clone(), s.id.clone())).collect(),
            claimed: HashSet::new(),
        }
    }

    fn claim(&mut self, slug: String, id: &SystemId) {
        self.ids.insert(slug.clone(), id.clone());
        self.claimed.insert(slug);
    }

    fn alias(&mut self, slug: String, id: &SystemId) {
        if !self.claimed.contains(&slug) {
            self.claim(slug, id);
        }
    }

    fn resolve(&self, slug: &str) -> Option<&SystemId> {
        self.ids.get(slug).or_else(|| self.ids.get(&slugify(slug)))
    }
}

#[derive(Clone)]
pub struct ConversionEngine {
    db: Database,
}

impl ConversionEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist the selections and edges in one transaction, then record a
    /// `conversion` snapshot. A snapshot failure after commit is logged and
    /// leaves `snapshot` empty; the committed result is still returned.
    #[instrument(skip(self, req), fields(project_id = %req.project_id, selections = req.selections.len(), edges = req.edges.len()))]
    pub fn convert(&self, req: ConversionRequest) -> Result<ConversionResult, SynthesisError> {
        let mut result = self.db.with_tx(|tx| {
            projects::get(tx, &req.project_id)?;
            if let Some(output_id) = &req.output_id {
                let output = outputs::get(tx, output_id)?;
                if output.project_id != req.project_id {
                    return Err(StoreError::NotFound(format!(
                        "synthesized output {output_id} in project {}",
                        req.project_id
                    )));
                }
            }

            let result = apply(tx, &req)?;

            if let Some(output_id) = &req.output_id {
                outputs::set_status(tx, output_id, SynthesisStatus::Converted)?;
            }
            Ok(result)
        })?;

        // Rows are committed at this point.
        match SnapshotService::new(self.db.clone()).capture(
            &req.project_id,
            SnapshotTrigger::Conversion,
            SnapshotLinks {
                synthesized_output_id: req.output_id.clone(),
                brainstorm_id: None,
            },
        ) {
            Ok(snapshot) => result.snapshot = Some(snapshot),
            Err(e) => warn!(error = %e, "conversion committed without a snapshot"),
        }

        info!(
            created = result.created_systems.len(),
            merged = result.merged.len(),
            dependencies = result.created_dependencies.len(),
            skipped = result.skipped.len(),
            "conversion committed"
        );
        Ok(result)
    }
}

fn apply(conn: &Connection, req: &ConversionRequest) -> Result<ConversionResult, StoreError> {
    let project_id = &req.project_id;
    let mut result = ConversionResult::default();
    let mut slugs = SlugMap::new(&systems::list_for_project(conn, project_id)?);

    for selection in &req.selections {
        let candidate = &selection.candidate;
        match &selection.action {
            SelectionAction::Discard => result.skip(candidate.name.clone(), SkipReason::Discarded),
            SelectionAction::Create { slug_override } => {
                let requested = match slug_override.as_deref() {
                    Some(slug) if !slug.trim().is_empty() => slugify(slug),
                    _ => candidate_slug(candidate),
                };
                let slug = unique_slug(conn, project_id, &requested)?;
                let system = systems::insert(conn, project_id, new_system(candidate, slug))?;

                slugs.claim(system.slug.clone(), &system.id);
                slugs.alias(requested, &system.id);
                slugs.alias(candidate_slug(candidate), &system.id);
                slugs.alias(slugify(&candidate.name), &system.id);

                for detail in &selection.details {
                    result.created_details.push(insert_detail(conn, &system.id, detail)?);
                }
                result.created_systems.push(system);
            }
            SelectionAction::Merge { existing_system_id } => {
                let target = systems::find(conn, existing_system_id)?
                    .filter(|s| &s.project_id == project_id);
                let Some(target) = target else {
                    result.skip(candidate.name.clone(), SkipReason::MergeTargetNotInProject);
                    continue;
                };

                slugs.alias(candidate_slug(candidate), &target.id);
                for detail in &selection.details {
                    result.created_details.push(insert_detail(conn, &target.id, detail)?);
                }
                result.merged.push(MergedSystem {
                    system_id: target.id,
                    details_added: selection.details.len(),
                });
            }
        }
    }

    for edge in &req.edges {
        let (Some(source), Some(target)) = (slugs.resolve(&edge.source_slug), slugs.resolve(&edge.target_slug))
        else {
            result.skip(edge.label(), SkipReason::UnresolvedSlug);
            continue;
        };
        if source == target {
            result.skip(edge.label(), SkipReason::SelfReference);
            continue;
        }
        if dependencies::exists(conn, source, target, edge.dependency_type)? {
            result.skip(edge.label(), SkipReason::DuplicateEdge);
            continue;
        }
        let dependency = dependencies::insert(
            conn,
            project_id,
            source,
            target,
            edge.dependency_type,
            edge.description.as_deref(),
        )?;
        result.created_dependencies.push(dependency);
    }

    Ok(result)
}

fn insert_detail(conn: &Connection, system_id: &SystemId, detail: &DetailCandidate) -> Result<SystemDetail, StoreError> {
    systems::insert_detail(
        conn,
        system_id,
        &detail.name,
        detail.detail_type.as_deref(),
        detail.spec.as_deref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::models::{DEFAULT_SYSTEM_VERSION, SystemStatus};
    use keystone_store::{DependencyRepo, ProjectRepo, SnapshotRepo, SystemRepo};

    fn setup() -> (Database, ProjectId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        (db, project.id)
    }

    fn request(project_id: &ProjectId, selections: Vec<SystemSelection>, edges: Vec<ProposedEdge>) -> ConversionRequest {
        ConversionRequest {
            project_id: project_id.clone(),
            output_id: None,
            selections,
            edges,
        }
    }

    #[test]
    fn slugify_rules() {
        assert_eq!(slugify("Combat System"), "combat-system");
        assert_eq!(slugify("  Health & Damage!! "), "health-damage");
        assert_eq!(slugify("Ärger"), "rger");
        assert_eq!(slugify("---"), "system");
        assert_eq!(slugify(""), "system");
        assert_eq!(slugify("v2_Loot"), "v2-loot");
    }

    #[test]
    fn proposed_edges_dedupe_in_order() {
        let mut combat = SystemCandidate::named("Combat").with_slug("combat");
        combat.dependencies = vec!["health".into(), "Health".into(), "Stamina".into()];
        let mut health = SystemCandidate::named("Health");
        health.dependencies = vec!["combat".into()];

        let edges = proposed_edges(&[combat, health]);
        assert_eq!(
            edges,
            vec![
                ProposedEdge::new("combat", "health"),
                ProposedEdge::new("combat", "stamina"),
                ProposedEdge::new("health", "combat"),
            ]
        );
    }

    #[test]
    fn details_for_matches_target_slug() {
        let combat = SystemCandidate::named("Combat");
        let mut hit = DetailCandidate::named("Damage");
        hit.target_system_slug = Some("Combat".into());
        let mut other = DetailCandidate::named("Regen");
        other.target_system_slug = Some("health".into());
        let loose = DetailCandidate::named("Unassigned");

        let matched = details_for(&combat, &[hit.clone(), other, loose]);
        assert_eq!(matched, vec![hit]);
    }

    #[test]
    fn create_applies_defaults_and_extras() {
        let (db, project_id) = setup();
        let mut candidate = SystemCandidate::named("Combat");
        candidate.mvp_criticality = Some("Core".into());
        candidate
            .extra
            .insert("mechanics".into(), serde_json::json!("Turn based"));

        let result = ConversionEngine::new(db)
            .convert(request(&project_id, vec![SystemSelection::create(candidate)], vec![]))
            .unwrap();

        let system = &result.created_systems[0];
        assert_eq!(system.slug, "combat");
        assert_eq!(system.version, DEFAULT_SYSTEM_VERSION);
        assert_eq!(system.status, SystemStatus::Draft);
        assert_eq!(system.mvp_criticality, Criticality::Core);
        assert_eq!(system.mechanics.as_deref(), Some("Turn based"));
        assert_eq!(result.snapshot.as_ref().unwrap().trigger, SnapshotTrigger::Conversion);
        assert!(result.cycle_error.is_none());
        assert!(result.cycle_edge.is_none());
    }

    #[test]
    fn slug_collisions_get_suffixes() {
        let (db, project_id) = setup();
        let engine = ConversionEngine::new(db.clone());

        let first = engine
            .convert(request(
                &project_id,
                vec![
                    SystemSelection::create(SystemCandidate::named("Foo")),
                    SystemSelection::create(SystemCandidate::named("foo")),
                ],
                vec![],
            ))
            .unwrap();
        let second = engine
            .convert(request(&project_id, vec![SystemSelection::create(SystemCandidate::named("Foo"))], vec![]))
            .unwrap();

        let slugs: Vec<_> = first.created_systems.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(slugs, vec!["foo", "foo-2"]);
        assert_eq!(second.created_systems[0].slug, "foo-3");
    }

    #[test]
    fn slug_override_wins() {
        let (db, project_id) = setup();
        let selection = SystemSelection::create(SystemCandidate::named("Combat").with_slug("fighting"))
            .with_slug_override("Melee Combat");
        let result = ConversionEngine::new(db)
            .convert(request(&project_id, vec![selection], vec![]))
            .unwrap();
        assert_eq!(result.created_systems[0].slug, "melee-combat");
    }

    #[test]
    fn discard_and_foreign_merge_write_nothing() {
        let (db, project_id) = setup();
        let other = ProjectRepo::new(db.clone()).create("Other", None).unwrap();
        let foreign = SystemRepo::new(db.clone())
            .create(
                &other.id,
                NewSystem {
                    name: "Foreign".into(),
                    slug: "foreign".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let merge = SystemSelection::merge(SystemCandidate::named("Foreign"), foreign.id.clone())
            .with_details(vec![DetailCandidate::named("Sneaky")]);
        let result = ConversionEngine::new(db.clone())
            .convert(request(
                &project_id,
                vec![SystemSelection::discard(SystemCandidate::named("Nope")), merge],
                vec![],
            ))
            .unwrap();

        assert!(result.created_systems.is_empty());
        assert!(result.created_details.is_empty());
        assert!(result.merged.is_empty());
        let reasons: Vec<_> = result.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(reasons, vec![SkipReason::Discarded, SkipReason::MergeTargetNotInProject]);
        assert!(SystemRepo::new(db).list_details(&foreign.id).unwrap().is_empty());
    }

    #[test]
    fn merge_attaches_details_and_resolves_edges() {
        let (db, project_id) = setup();
        let health = SystemRepo::new(db.clone())
            .create(
                &project_id,
                NewSystem {
                    name: "Health".into(),
                    slug: "hp".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let merge = SystemSelection::merge(SystemCandidate::named("Health").with_slug("health"), health.id.clone())
            .with_details(vec![DetailCandidate::named("Regeneration")]);
        let create = SystemSelection::create(SystemCandidate::named("Combat"));
        let result = ConversionEngine::new(db.clone())
            .convert(request(
                &project_id,
                vec![merge, create],
                vec![ProposedEdge::new("combat", "health")],
            ))
            .unwrap();

        assert_eq!(result.merged, vec![MergedSystem { system_id: health.id.clone(), details_added: 1 }]);
        assert_eq!(result.created_details[0].system_id, health.id);
        assert_eq!(result.created_dependencies.len(), 1);
        assert_eq!(result.created_dependencies[0].target_system_id, health.id);
    }

    #[test]
    fn edge_skips_are_reported() {
        let (db, project_id) = setup();
        let engine = ConversionEngine::new(db.clone());
        let result = engine
            .convert(request(
                &project_id,
                vec![
                    SystemSelection::create(SystemCandidate::named("Combat")),
                    SystemSelection::create(SystemCandidate::named("Health")),
                ],
                vec![
                    ProposedEdge::new("combat", "health"),
                    ProposedEdge::new("combat", "health"),
                    ProposedEdge::new("combat", "health").with_type(DependencyType::Triggers),
                    ProposedEdge::new("combat", "combat"),
                    ProposedEdge::new("combat", "mana"),
                ],
            ))
            .unwrap();

        assert_eq!(result.created_dependencies.len(), 2);
        let reasons: Vec<_> = result.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::DuplicateEdge, SkipReason::SelfReference, SkipReason::UnresolvedSlug]
        );
        assert_eq!(DependencyRepo::new(db).list_for_project(&project_id).unwrap().len(), 2);
    }

    #[test]
    fn cycles_are_allowed() {
        let (db, project_id) = setup();
        let result = ConversionEngine::new(db)
            .convert(request(
                &project_id,
                vec![
                    SystemSelection::create(SystemCandidate::named("A")),
                    SystemSelection::create(SystemCandidate::named("B")),
                ],
                vec![ProposedEdge::new("a", "b"), ProposedEdge::new("b", "a")],
            ))
            .unwrap();
        assert_eq!(result.created_dependencies.len(), 2);
        assert!(result.cycle_error.is_none());
    }

    #[test]
    fn renamed_duplicate_still_answers_to_its_own_slug() {
        let (db, project_id) = setup();
        let engine = ConversionEngine::new(db.clone());
        let existing = engine
            .convert(request(&project_id, vec![SystemSelection::create(SystemCandidate::named("Combat"))], vec![]))
            .unwrap()
            .created_systems
            .remove(0);

        let result = engine
            .convert(request(
                &project_id,
                vec![
                    SystemSelection::create(SystemCandidate::named("Combat")),
                    SystemSelection::create(SystemCandidate::named("Health")),
                ],
                vec![ProposedEdge::new("combat", "health")],
            ))
            .unwrap();

        let renamed = &result.created_systems[0];
        assert_eq!(renamed.slug, "combat-2");
        assert_eq!(result.created_dependencies[0].source_system_id, renamed.id);
        assert_ne!(result.created_dependencies[0].source_system_id, existing.id);
    }

    #[test]
    fn missing_output_is_not_found_and_writes_nothing() {
        let (db, project_id) = setup();
        let mut req = request(&project_id, vec![SystemSelection::create(SystemCandidate::named("Combat"))], vec![]);
        req.output_id = Some(OutputId::from_raw("syn_missing"));

        let err = ConversionEngine::new(db.clone()).convert(req).unwrap_err();
        assert!(err.is_not_found());
        assert!(SystemRepo::new(db.clone()).list_for_project(&project_id).unwrap().is_empty());
        assert!(SnapshotRepo::new(db).latest(&project_id).unwrap().is_none());
    }

    #[test]
    fn snapshot_failure_after_commit_still_returns_result() {
        let (db, project_id) = setup();
        db.with_conn(|conn| Ok(conn.execute_batch("DROP TABLE context_snapshots")?))
            .unwrap();

        let result = ConversionEngine::new(db.clone())
            .convert(request(
                &project_id,
                vec![
                    SystemSelection::create(SystemCandidate::named("Combat")),
                    SystemSelection::create(SystemCandidate::named("Health")),
                ],
                vec![ProposedEdge::new("combat", "health")],
            ))
            .unwrap();

        assert!(result.snapshot.is_none());
        assert_eq!(result.created_systems.len(), 2);
        assert_eq!(result.created_dependencies.len(), 1);
        assert_eq!(SystemRepo::new(db).list_for_project(&project_id).unwrap().len(), 2);
    }
}
