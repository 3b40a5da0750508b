//! Per-variant slot view for the composer grid.
//!
//! A generation request asks for N variants; the UI shows one slot per
//! variant. Slots are derived from a [`JobState`] snapshot and are never
//! stored on their own.

use serde::Serialize;

use crate::job::{JobPhase, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VariantSlot {
    Pending,
    Ready { url: String },
    Failed { message: String },
}

/// Map a job snapshot onto `variant_count` slots.
///
/// Delivered artifacts fill their slot by index. When the job is terminal,
/// slots still waiting are failed: with the job's failure message, or with
/// a generic message when the job completed or was cancelled without
/// producing that variant.
pub fn variant_slots(state: &JobState, variant_count: u8) -> Vec<VariantSlot> {
    (0..u32::from(variant_count))
        .map(|index| {
            if let Some(artifact) = state.artifacts.iter().find(|a| a.index == index) {
                return VariantSlot::Ready {
                    url: artifact.url.clone(),
                };
            }
            match &state.phase {
                JobPhase::Submitted | JobPhase::Running => VariantSlot::Pending,
                JobPhase::Failed { reason } => VariantSlot::Failed {
                    message: reason.message().to_string(),
                },
                JobPhase::Cancelled => VariantSlot::Failed {
                    message: "Generation cancelled".to_string(),
                },
                JobPhase::Completed => VariantSlot::Failed {
                    message: "No output was produced for this variant".to_string(),
                },
            }
        })
        .collect()
}
