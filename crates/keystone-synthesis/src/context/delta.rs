use std::collections::{HashMap, HashSet};

use serde::Serialize;

use keystone_core::ids::{BrainstormId, SystemId};
use keystone_core::models::{BrainstormSession, ContextSnapshot, Dependency, DependencyType, GameSystem};

use super::excerpt;

/// One structural change between a snapshot and the current project state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeRecord {
    SystemAdded {
        slug: String,
        name: String,
    },
    SystemUpdated {
        slug: String,
        name: String,
    },
    SystemRemoved {
        slug: String,
        name: String,
    },
    DependencyAdded {
        source_slug: String,
        target_slug: String,
        dependency_type: DependencyType,
    },
    DependencyRemoved {
        source_slug: String,
        target_slug: String,
        dependency_type: DependencyType,
    },
    BrainstormAdded {
        brainstorm_id: BrainstormId,
        title: String,
        excerpt: String,
    },
}

impl ChangeRecord {
    fn rank(&self) -> u8 {
        match self {
            Self::SystemAdded { .. } => 0,
            Self::SystemUpdated { .. } => 1,
            Self::SystemRemoved { .. } => 2,
            Self::DependencyAdded { .. } => 3,
            Self::DependencyRemoved { .. } => 4,
            Self::BrainstormAdded { .. } => 5,
        }
    }

    fn sort_key(&self) -> (u8, String, String) {
        match self {
            Self::SystemAdded { slug, .. }
            | Self::SystemUpdated { slug, .. }
            | Self::SystemRemoved { slug, .. } => (self.rank(), slug.clone(), String::new()),
            Self::DependencyAdded {
                source_slug,
                target_slug,
                dependency_type,
            }
            | Self::DependencyRemoved {
                source_slug,
                target_slug,
                dependency_type,
            } => (
                self.rank(),
                format!("{source_slug}\u{0}{target_slug}"),
                dependency_type.as_str().to_string(),
            ),
            Self::BrainstormAdded {
                brainstorm_id, title, ..
            } => (self.rank(), title.clone(), brainstorm_id.to_string()),
        }
    }

    /// One-line description used in prompts.
    pub fn describe(&self) -> String {
        match self {
            Self::SystemAdded { slug, name } => format!("+ system added: {name} ({slug})"),
            Self::SystemUpdated { slug, name } => format!("~ system updated: {name} ({slug})"),
            Self::SystemRemoved { slug, name } => format!("- system removed: {name} ({slug})"),
            Self::DependencyAdded {
                source_slug,
                target_slug,
                dependency_type,
            } => format!("+ dependency added: {source_slug} -[{dependency_type}]-> {target_slug}"),
            Self::DependencyRemoved {
                source_slug,
                target_slug,
                dependency_type,
            } => format!("- dependency removed: {source_slug} -[{dependency_type}]-> {target_slug}"),
            Self::BrainstormAdded { title, excerpt, .. } => {
                format!("+ brainstorm added: {title}: {excerpt}")
            }
        }
    }
}

/// Compare a snapshot against current rows using creation/update timestamps.
///
/// Timestamps are RFC 3339 strings with fixed precision, so string order is
/// time order. The result is sorted by change kind, then slug or title.
pub fn compute_delta(
    snapshot: &ContextSnapshot,
    systems: &[GameSystem],
    dependencies: &[Dependency],
    brainstorms: &[BrainstormSession],
) -> Vec<ChangeRecord> {
    let since = snapshot.created_at.as_str();
    let mut changes = Vec::new();

    let current_system_ids: HashSet<&SystemId> = systems.iter().map(|s| &s.id).collect();
    for system in systems {
        if system.created_at.as_str() > since {
            changes.push(ChangeRecord::SystemAdded {
                slug: system.slug.clone(),
                name: system.name.clone(),
            });
        } else if system.updated_at.as_str() > since {
            changes.push(ChangeRecord::SystemUpdated {
                slug: system.slug.clone(),
                name: system.name.clone(),
            });
        }
    }
    for old in &snapshot.content.systems {
        if !current_system_ids.contains(&old.id) {
            changes.push(ChangeRecord::SystemRemoved {
                slug: old.slug.clone(),
                name: old.name.clone(),
            });
        }
    }

    let slug_of: HashMap<&SystemId, &str> =
        systems.iter().map(|s| (&s.id, s.slug.as_str())).collect();
    for dep in dependencies {
        if dep.created_at.as_str() <= since {
            continue;
        }
        let (Some(source), Some(target)) = (
            slug_of.get(&dep.source_system_id),
            slug_of.get(&dep.target_system_id),
        ) else {
            continue;
        };
        changes.push(ChangeRecord::DependencyAdded {
            source_slug: source.to_string(),
            target_slug: target.to_string(),
            dependency_type: dep.dependency_type,
        });
    }
    let current_dep_ids: HashSet<_> = dependencies.iter().map(|d| &d.id).collect();
    for old in &snapshot.content.dependencies {
        if !current_dep_ids.contains(&old.id) {
            changes.push(ChangeRecord::DependencyRemoved {
                source_slug: old.source_slug.clone(),
                target_slug: old.target_slug.clone(),
                dependency_type: old.dependency_type,
            });
        }
    }

    for session in brainstorms {
        if session.created_at.as_str() > since {
            changes.push(ChangeRecord::BrainstormAdded {
                brainstorm_id: session.id.clone(),
                title: session.title.clone(),
                excerpt: excerpt(&session.content),
            });
        }
    }

    changes.sort_by_cached_key(ChangeRecord::sort_key);
    changes
}
