use std::collections::HashSet;

use tracing::{info, instrument};

use keystone_core::ids::OutputId;
use keystone_core::models::SynthesizedOutput;
use keystone_store::{CandidateSet, Database, OutputRepo};

use crate::error::SynthesisError;

/// Move the suggested candidates at the given indices into the extracted
/// lists. Relative order is kept; out-of-range and repeated indices are
/// ignored. Returns the number of candidates moved.
pub fn promote_candidates(set: &mut CandidateSet, system_indices: &[usize], detail_indices: &[usize]) -> usize {
    let moved_systems = move_selected(
        &mut set.suggested_systems,
        &mut set.extracted_systems,
        system_indices,
    );
    let moved_details = move_selected(
        &mut set.suggested_system_details,
        &mut set.extracted_system_details,
        detail_indices,
    );
    moved_systems + moved_details
}

fn move_selected<T>(from: &mut Vec<T>, to: &mut Vec<T>, indices: &[usize]) -> usize {
    let selected: HashSet<usize> = indices.iter().copied().filter(|i| *i < from.len()).collect();
    if selected.is_empty() {
        return 0;
    }
    let mut kept = Vec::with_capacity(from.len() - selected.len());
    for (i, item) in std::mem::take(from).into_iter().enumerate() {
        if selected.contains(&i) {
            to.push(item);
        } else {
            kept.push(item);
        }
    }
    *from = kept;
    selected.len()
}

#[derive(Clone)]
pub struct PromotionService {
    db: Database,
}

impl PromotionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, system_indices, detail_indices), fields(output_id = %output_id))]
    pub fn promote(
        &self,
        output_id: &OutputId,
        system_indices: &[usize],
        detail_indices: &[usize],
    ) -> Result<SynthesizedOutput, SynthesisError> {
        let repo = OutputRepo::new(self.db.clone());
        let output = repo.get(output_id)?;

        let mut set = CandidateSet::from_output(&output);
        let moved = promote_candidates(&mut set, system_indices, detail_indices);
        if moved == 0 {
            return Ok(output);
        }
        info!(moved, "suggested candidates promoted");
        Ok(repo.update_candidates(output_id, &set)?)
    }
}
