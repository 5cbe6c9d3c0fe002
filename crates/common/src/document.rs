// Canonical test document model + patch merge (the aggregator).
//
// One document exists per conversation. The AI provider proposes edits as
// partial `TestPatch` fragments; `apply_patch` merges them with upsert
// semantics:
//   - sections are matched by exact name; a non-empty question list
//     replaces the section's questions wholesale (the provider sends a
//     complete list per edited section, not a diff)
//   - section edits with no questions are dropped, not applied
//   - remaining top-level fields overwrite flatly
//
// The merge never fails: question shapes the provider invents fall into
// `Question::Unknown` and survive the round trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Document ────────────────────────────────────────────────────────

/// The single authoritative test structure maintained per conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TestDocument {
    pub title: Option<String>,
    pub description: Option<String>,
    pub test_type: Option<String>,
    /// Total duration in minutes.
    pub duration: Option<u32>,
    pub sections: Vec<Section>,
    /// Top-level scalar fields this model doesn't know about. Patches
    /// merge into these flatly, same as the typed fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestDocument {
    /// Look up a section by exact (case-sensitive) name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// A question of any kind. Untagged: variants are tried in order of
/// decreasing specificity, with a raw-value fallback so partial or
/// unexpected provider shapes never crash the merge step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Question {
    Msq(MsqQuestion),
    Mcq(McqQuestion),
    Theoretical(TheoreticalQuestion),
    Unknown(Value),
}

/// Multiple-select: several options are correct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MsqQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// Single-select multiple choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McqQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// Free-text / essay question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TheoreticalQuestion {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

// ── Patch ───────────────────────────────────────────────────────────

/// A partial document fragment proposed by the AI provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TestPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub test_type: Option<String>,
    pub duration: Option<u32>,
    pub sections: Option<Vec<SectionPatch>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestPatch {
    /// True when the patch carries any top-level field besides `sections`.
    pub fn has_scalar_fields(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.test_type.is_some()
            || self.duration.is_some()
            || !self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SectionPatch {
    pub name: String,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub questions: Option<Vec<Question>>,
}

// ── Merge ───────────────────────────────────────────────────────────

/// Merge a patch into a document. `None` is a no-op. Re-applying the same
/// patch converges: section replacement is idempotent and flat-field
/// overwrites of equal values change nothing.
pub fn apply_patch(document: &TestDocument, patch: Option<&TestPatch>) -> TestDocument {
    let Some(patch) = patch else {
        return document.clone();
    };

    let mut merged = document.clone();

    if let Some(section_patches) = &patch.sections {
        for section_patch in section_patches {
            apply_section_patch(&mut merged.sections, section_patch);
        }
    }

    // Residual flat merge: skipped entirely when no field besides
    // `sections` is present.
    if patch.has_scalar_fields() {
        if let Some(title) = &patch.title {
            merged.title = Some(title.clone());
        }
        if let Some(description) = &patch.description {
            merged.description = Some(description.clone());
        }
        if let Some(test_type) = &patch.test_type {
            merged.test_type = Some(test_type.clone());
        }
        if let Some(duration) = patch.duration {
            merged.duration = Some(duration);
        }
        for (key, value) in &patch.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
    }

    merged
}

fn apply_section_patch(sections: &mut Vec<Section>, patch: &SectionPatch) {
    // A section edit without questions is dropped wholesale: the provider
    // occasionally emits empty question lists for sections it did not
    // actually edit, and applying those would wipe real content.
    let questions = match &patch.questions {
        Some(questions) if !questions.is_empty() => questions.clone(),
        _ => return,
    };

    match sections.iter_mut().find(|s| s.name == patch.name) {
        Some(existing) => {
            if patch.duration.is_some() {
                existing.duration = patch.duration;
            }
            existing.questions = questions;
        }
        None => sections.push(Section {
            name: patch.name.clone(),
            duration: patch.duration,
            questions,
        }),
    }
}
