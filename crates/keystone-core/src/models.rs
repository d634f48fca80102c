//! Persisted records of the planning domain.

use serde::{Deserialize, Serialize};

use crate::candidates::{DetailCandidate, SystemCandidate};
use crate::ids::{
    BrainstormId, DependencyId, DetailId, MessageId, OutputId, ProjectId, SnapshotId, SystemId,
};
use crate::tokens::TokenUsage;

/// Declares a snake_case string enum with `Display`/`FromStr` matching its
/// serde representation, so stored text columns and JSON agree.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

text_enum!(BrainstormSource {
    Manual => "manual",
    Discord => "discord",
    Upload => "upload",
});

text_enum!(
    /// Why a context snapshot was recorded.
    SnapshotTrigger {
        Initial => "initial",
        UpdateContext => "update_context",
        Synthesis => "synthesis",
        Conversion => "conversion",
        Manual => "manual",
    }
);

text_enum!(SynthesisStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Converted => "converted",
});

text_enum!(SystemStatus {
    Draft => "draft",
    Active => "active",
    Deprecated => "deprecated",
});

text_enum!(Criticality {
    Core => "core",
    Important => "important",
    NiceToHave => "nice_to_have",
});

text_enum!(DependencyType {
    Requires => "requires",
    Enhances => "enhances",
    Triggers => "triggers",
    SharesData => "shares_data",
});

text_enum!(MessageRole {
    User => "user",
    Assistant => "assistant",
});

impl Default for SystemStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl Default for Criticality {
    fn default() -> Self {
        Self::Important
    }
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::Requires
    }
}

impl Criticality {
    /// Lenient parse for model-written values such as "Nice to have" or "critical".
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "core" | "critical" | "essential" | "must_have" => Some(Self::Core),
            "important" | "should_have" => Some(Self::Important),
            "nice_to_have" | "optional" | "could_have" => Some(Self::NiceToHave),
            _ => None,
        }
    }
}

impl SystemStatus {
    pub fn parse_loose(raw: &str) -> Option<Self> {
        raw.trim().to_ascii_lowercase().parse().ok()
    }
}

impl DependencyType {
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        normalized.parse().ok()
    }
}

pub const DEFAULT_SYSTEM_VERSION: &str = "v0.1";
pub const DEFAULT_DETAIL_TYPE: &str = "mechanic";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// Raw design notes. Never updated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrainstormSession {
    pub id: BrainstormId,
    pub project_id: ProjectId,
    pub title: String,
    pub source: BrainstormSource,
    pub content: String,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub source_thread_refs: Vec<String>,
    pub created_at: String,
}

/// Fields accepted when capturing a new brainstorm.
#[derive(Clone, Debug, Default)]
pub struct NewBrainstorm {
    pub title: String,
    pub source: Option<BrainstormSource>,
    pub content: String,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub source_thread_refs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub id: SystemId,
    pub slug: String,
    pub name: String,
    pub purpose: Option<String>,
    pub version: String,
    pub status: SystemStatus,
    pub mvp_criticality: Criticality,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySummary {
    pub id: DependencyId,
    pub source_slug: String,
    pub target_slug: String,
    pub dependency_type: DependencyType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrainstormSummary {
    pub id: BrainstormId,
    pub title: String,
    pub source: BrainstormSource,
    pub created_at: String,
    pub excerpt: String,
}

/// Serialized point-in-time view of a project, stored as JSON in a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotContent {
    pub systems: Vec<SystemSummary>,
    pub dependencies: Vec<DependencySummary>,
    pub brainstorms: Vec<BrainstormSummary>,
}

/// Append-only. Newer snapshots supersede older ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: SnapshotId,
    pub project_id: ProjectId,
    pub trigger: SnapshotTrigger,
    pub content: SnapshotContent,
    pub synthesized_output_id: Option<OutputId>,
    pub brainstorm_id: Option<BrainstormId>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedOutput {
    pub id: OutputId,
    pub project_id: ProjectId,
    pub brainstorm_id: Option<BrainstormId>,
    pub content: String,
    pub extracted_systems: Vec<SystemCandidate>,
    pub extracted_system_details: Vec<DetailCandidate>,
    pub suggested_systems: Vec<SystemCandidate>,
    pub suggested_system_details: Vec<DetailCandidate>,
    pub status: SynthesisStatus,
    pub error_message: Option<String>,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameSystem {
    pub id: SystemId,
    pub project_id: ProjectId,
    pub name: String,
    /// Unique within the project.
    pub slug: String,
    pub purpose: Option<String>,
    pub version: String,
    pub status: SystemStatus,
    pub mvp_criticality: Criticality,
    pub description: Option<String>,
    pub mechanics: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GameSystem {
    pub fn summary(&self) -> SystemSummary {
        SystemSummary {
            id: self.id.clone(),
            slug: self.slug.clone(),
            name: self.name.clone(),
            purpose: self.purpose.clone(),
            version: self.version.clone(),
            status: self.status,
            mvp_criticality: self.mvp_criticality,
        }
    }
}

/// Fields for inserting a game system. The slug must already be unique.
#[derive(Clone, Debug, Default)]
pub struct NewSystem {
    pub name: String,
    pub slug: String,
    pub purpose: Option<String>,
    pub version: Option<String>,
    pub status: Option<SystemStatus>,
    pub mvp_criticality: Option<Criticality>,
    pub description: Option<String>,
    pub mechanics: Option<String>,
    pub notes: Option<String>,
}

/// Partial update applied by the evolve flow. `None` leaves a field alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemUpdate {
    pub name: Option<String>,
    pub purpose: Option<String>,
    pub version: Option<String>,
    pub status: Option<SystemStatus>,
    pub mvp_criticality: Option<Criticality>,
    pub description: Option<String>,
    pub mechanics: Option<String>,
    pub notes: Option<String>,
}

impl SystemUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemDetail {
    pub id: DetailId,
    pub system_id: SystemId,
    pub name: String,
    pub detail_type: String,
    pub spec: Option<String>,
    pub created_at: String,
}

/// Directed edge between two systems. Cycles are permitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: DependencyId,
    pub project_id: ProjectId,
    pub source_system_id: SystemId,
    pub target_system_id: SystemId,
    pub dependency_type: DependencyType,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}
