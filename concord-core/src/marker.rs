//! Ownership markers embedded in downstream free-text fields.
//!
//! A downstream record written by the operator carries
//! `[managed-by:<kind>/<namespace>/<name>]` in a description-like field. The
//! marker is the only way to tell, from the downstream side alone, which
//! entries the operator may rewrite or delete and which belong to a human or
//! another tool and must be kept verbatim during teardown.

use std::fmt;

use crate::types::OwnerRef;

const MARKER_TAG: &str = "managed-by:";

/// `managed-by:<kind>/<namespace>/<name>` for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipMarker {
    owner: OwnerRef,
}

impl OwnershipMarker {
    pub fn new(owner: OwnerRef) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &OwnerRef {
        &self.owner
    }

    /// `text` with ` [marker]` appended, or just `[marker]` when empty.
    pub fn append_to_description(&self, text: &str) -> String {
        if text.is_empty() {
            format!("[{self}]")
        } else {
            format!("{text} [{self}]")
        }
    }

    /// Whether `text` carries this exact owner's bracketed marker.
    pub fn is_owned_by(&self, text: &str) -> bool {
        text.contains(&format!("[{self}]"))
    }

    /// Whether `text` carries any operator marker at all.
    pub fn is_managed_by_operator(text: &str) -> bool {
        text.contains(&format!("[{MARKER_TAG}"))
    }

    /// Decode the first marker found in `text`.
    pub fn parse(text: &str) -> Option<OwnerRef> {
        let start = text.find(&format!("[{MARKER_TAG}"))? + 1 + MARKER_TAG.len();
        let rest = &text[start..];
        let body = &rest[..rest.find(']')?];
        let mut parts = body.splitn(3, '/');
        let kind = parts.next().filter(|p| !p.is_empty())?;
        let namespace = parts.next()?;
        let name = parts.next().filter(|p| !p.is_empty())?;
        Some(OwnerRef::new(kind, namespace, name))
    }

    /// Remove every operator marker (and the space before it) from `text`.
    pub fn strip(text: &str) -> String {
        let mut out = text.to_string();
        let open = format!("[{MARKER_TAG}");
        while let Some(start) = out.find(&open) {
            let Some(len) = out[start..].find(']') else {
                break;
            };
            let trim_from = if out[..start].ends_with(' ') {
                start - 1
            } else {
                start
            };
            out.replace_range(trim_from..start + len + 1, "");
        }
        out
    }
}

impl fmt::Display for OwnershipMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MARKER_TAG}{}", self.owner)
    }
}

/// Build the downstream entry list for a teardown: every externally-owned
/// entry read back from downstream, followed by the remaining managed ones.
///
/// `describe` extracts the free-text field that carries the marker.
pub fn merge_preserving_external<T, F>(
    remaining_managed: Vec<T>,
    downstream: Vec<T>,
    describe: F,
) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut merged: Vec<T> = downstream
        .into_iter()
        .filter(|entry| !OwnershipMarker::is_managed_by_operator(describe(entry)))
        .collect();
    merged.extend(remaining_managed);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> OwnerRef {
        OwnerRef::new("AccessRule", "prod", name)
    }

    #[test]
    fn marker_string_format() {
        let marker = OwnershipMarker::new(owner("web"));
        assert_eq!(marker.to_string(), "managed-by:AccessRule/prod/web");
    }

    #[test]
    fn append_to_empty_and_non_empty_text() {
        let marker = OwnershipMarker::new(owner("web"));
        assert_eq!(
            marker.append_to_description(""),
            "[managed-by:AccessRule/prod/web]"
        );
        assert_eq!(
            marker.append_to_description("allow office"),
            "allow office [managed-by:AccessRule/prod/web]"
        );
    }

    #[test]
    fn ownership_roundtrip_distinguishes_owners() {
        let marker = OwnershipMarker::new(owner("web"));
        let other = OwnershipMarker::new(owner("api"));
        let text = marker.append_to_description("x");

        assert!(marker.is_owned_by(&text));
        assert!(!other.is_owned_by(&text));
        assert!(OwnershipMarker::is_managed_by_operator(&text));
        assert!(!OwnershipMarker::is_managed_by_operator("x"));
    }

    #[test]
    fn owner_prefix_is_not_a_match() {
        let long = OwnershipMarker::new(owner("web-2"));
        let short = OwnershipMarker::new(owner("web"));
        let text = long.append_to_description("rule");
        assert!(!short.is_owned_by(&text));
    }

    #[test]
    fn parse_decodes_owner() {
        let marker = OwnershipMarker::new(owner("web"));
        let text = marker.append_to_description("allow office");
        assert_eq!(OwnershipMarker::parse(&text), Some(owner("web")));
        assert_eq!(OwnershipMarker::parse("allow office"), None);
        assert_eq!(OwnershipMarker::parse("[managed-by:broken"), None);
    }

    #[test]
    fn strip_removes_marker_and_separator() {
        let marker = OwnershipMarker::new(owner("web"));
        assert_eq!(
            OwnershipMarker::strip(&marker.append_to_description("allow office")),
            "allow office"
        );
        assert_eq!(OwnershipMarker::strip(&marker.append_to_description("")), "");
    }

    #[test]
    fn merge_keeps_external_entries_and_drops_stale_managed_ones() {
        let marker = OwnershipMarker::new(owner("web"));
        let downstream = vec![
            "hand-written rule".to_string(),
            marker.append_to_description("old managed rule"),
        ];
        let remaining = vec![OwnershipMarker::new(owner("api")).append_to_description("new")];

        let merged = merge_preserving_external(remaining, downstream, |s| s.as_str());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], "hand-written rule");
        assert!(merged[1].contains("AccessRule/prod/api"));
    }
}
