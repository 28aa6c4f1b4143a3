//! Choosing the channel to segment.
//!
//! Acquisitions do not always name the nuclear stain exactly as
//! configured ("Dapi-stain", "DAPI 405"). When no channel carries the
//! configured name, [`ReferenceMatch`] decides whether and how a
//! substitute is picked. Every substitution is logged and recorded in a
//! [`ReferenceSelection`] so the caller can see it after the run.

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Rule for picking a reference channel when the configured name is
/// absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferenceMatch {
    /// First channel whose name contains the configured name,
    /// case-insensitively; otherwise the first channel.
    #[default]
    SubstringThenFirst,
    /// The first channel.
    FirstChannel,
    /// No substitution: a missing name is an error.
    ExactOnly,
}

/// Why a particular channel became the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionReason {
    /// A channel carries exactly the configured name.
    Exact,
    /// A channel name contains the configured name (ignoring case).
    Substring,
    /// Nothing matched, the first channel was used.
    FirstChannel,
}

/// Outcome of reference channel selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSelection {
    /// Name the configuration asked for.
    pub requested: String,
    /// Name of the chosen channel.
    pub name: String,
    /// Index of the chosen channel.
    pub index: usize,
    /// How the channel was chosen.
    pub reason: SelectionReason,
}

impl ReferenceSelection {
    /// Whether a channel other than the requested one is used.
    #[must_use]
    pub fn is_substitute(&self) -> bool {
        self.reason != SelectionReason::Exact
    }
}

/// Pick the reference channel among `channel_names`.
///
/// # Errors
///
/// Returns [`PipelineError::ReferenceChannelMissing`] when there are no
/// channels, or when `rule` is [`ReferenceMatch::ExactOnly`] and no name
/// matches exactly.
pub fn select_reference(
    channel_names: &[String],
    requested: &str,
    rule: ReferenceMatch,
) -> Result<ReferenceSelection, PipelineError> {
    let pick = |index: usize, reason| ReferenceSelection {
        requested: requested.to_string(),
        name: channel_names[index].clone(),
        index,
        reason,
    };

    if channel_names.is_empty() {
        return Err(PipelineError::ReferenceChannelMissing(requested.to_string()));
    }
    if let Some(index) = channel_names.iter().position(|n| n == requested) {
        return Ok(pick(index, SelectionReason::Exact));
    }

    let selection = match rule {
        ReferenceMatch::ExactOnly => {
            return Err(PipelineError::ReferenceChannelMissing(requested.to_string()));
        }
        ReferenceMatch::SubstringThenFirst => {
            let needle = requested.to_lowercase();
            channel_names
                .iter()
                .position(|n| n.to_lowercase().contains(&needle))
                .map_or_else(
                    || pick(0, SelectionReason::FirstChannel),
                    |index| pick(index, SelectionReason::Substring),
                )
        }
        ReferenceMatch::FirstChannel => pick(0, SelectionReason::FirstChannel),
    };

    tracing::warn!(
        requested,
        substitute = %selection.name,
        index = selection.index,
        reason = ?selection.reason,
        "reference channel not found, substituting",
    );
    Ok(selection)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn exact_name_wins() {
        let sel = select_reference(&names(&["GFP", "DAPI"]), "DAPI", ReferenceMatch::default()).unwrap();
        assert_eq!(sel.index, 1);
        assert_eq!(sel.reason, SelectionReason::Exact);
        assert!(!sel.is_substitute());
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let sel = select_reference(
            &names(&["GFP", "Dapi-stain"]),
            "DAPI",
            ReferenceMatch::SubstringThenFirst,
        )
        .unwrap();
        assert_eq!(sel.name, "Dapi-stain");
        assert_eq!(sel.reason, SelectionReason::Substring);
        assert!(sel.is_substitute());
    }

    #[test]
    fn falls_back_to_first_channel() {
        let sel = select_reference(
            &names(&["GFP", "mCherry"]),
            "DAPI",
            ReferenceMatch::SubstringThenFirst,
        )
        .unwrap();
        assert_eq!(sel.index, 0);
        assert_eq!(sel.reason, SelectionReason::FirstChannel);
    }

    #[test]
    fn first_channel_rule_skips_substring_search() {
        let sel = select_reference(
            &names(&["GFP", "Dapi-stain"]),
            "DAPI",
            ReferenceMatch::FirstChannel,
        )
        .unwrap();
        assert_eq!(sel.name, "GFP");
    }

    #[test]
    fn exact_only_rule_reports_missing() {
        let result = select_reference(
            &names(&["GFP", "Dapi-stain"]),
            "DAPI",
            ReferenceMatch::ExactOnly,
        );
        assert!(matches!(
            result,
            Err(PipelineError::ReferenceChannelMissing(name)) if name == "DAPI"
        ));
    }

    #[test]
    fn empty_channel_list_is_missing() {
        assert!(matches!(
            select_reference(&[], "DAPI", ReferenceMatch::SubstringThenFirst),
            Err(PipelineError::ReferenceChannelMissing(_))
        ));
    }
}
