//! # keystone-synthesis
//!
//! Brainstorm synthesis pipeline for a game-design planner.
//!
//! - **Context**: full project snapshots and deltas since a prior snapshot
//! - **Prompt**: snapshot + delta + brainstorm text assembled under a size budget
//! - **Runner**: streams a provider reply, parses it, persists the output
//! - **Parse**: tiered recovery of candidate JSON from model output
//! - **Convert**: confirmed candidates into systems, details and dependencies
//! - **Promote / refine / evolve**: follow-up operations on outputs and systems
//!
//! ## Crate Position
//!
//! Depends on: keystone-core, keystone-store.
//! Depended on by: the `keystone` binary.

#![deny(unsafe_code)]

pub mod context;
pub mod convert;
pub mod error;
pub mod events;
pub mod evolve;
pub mod parse;
pub mod promote;
pub mod prompt;
pub mod refine;
pub mod runner;
pub mod snapshots;

pub use context::{ChangeRecord, ContextBuilder};
pub use convert::{
    proposed_edges, slugify, ConversionEngine, ConversionRequest, ConversionResult, ProposedEdge,
    SelectionAction, SkipReason, SystemSelection,
};
pub use error::SynthesisError;
pub use events::SynthesisEvent;
pub use evolve::{EvolveOutcome, EvolveSession};
pub use parse::{extract_json_object, parse_response, ParseTier, ParsedResponse};
pub use promote::PromotionService;
pub use prompt::{AssembledPrompt, AssemblyMode, PromptAssembler, PromptBudget, PromptInput};
pub use refine::{RefinementOutcome, RefinementSession};
pub use runner::{RunnerConfig, SynthesisOutcome, SynthesisRequest, SynthesisRunner};
pub use snapshots::SnapshotService;
