//! Error Enricher (C6, §4.6). Extracts candidate symbol names out of raw
//! validator error text and asks the Symbol Index which files relate to
//! them, so the next prompt gets cross-file context without spending an
//! extra iteration on a read/search the model would otherwise issue.
//!
//! Has no direct teacher analogue; grounded on C1's `find_related` contract
//! and the general "enrich before it re-enters history" idiom the teacher
//! applies when summarizing tool output for the conversation transcript.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::RelationshipKind;
use crate::symbol_index::SymbolIndex;

const RELATION_SET: &[RelationshipKind] = &[
    RelationshipKind::Inheritance,
    RelationshipKind::Instantiation,
    RelationshipKind::MethodCall,
    RelationshipKind::TypeReference,
];

/// §4.6 step 1: generic phrasings across compiler/linter families that name
/// the offending symbol in a capture group.
fn symbol_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            vec![
                Regex::new(r"cannot find (?:value |function |type |struct |trait )?`?([A-Za-z_][A-Za-z0-9_]*)`?").unwrap(),
                Regex::new(r"unresolved identifier `?([A-Za-z_][A-Za-z0-9_]*)`?").unwrap(),
                Regex::new(r"type `?([A-Za-z_][A-Za-z0-9_]*)`? has no (?:member|field|method)").unwrap(),
                Regex::new(r"value of type `?([A-Za-z_][A-Za-z0-9_]*)`? has no (?:member|field|method)").unwrap(),
                Regex::new(r"no method named `?([A-Za-z_][A-Za-z0-9_]*)`? found").unwrap(),
                Regex::new(r"undefined (?:variable|reference|symbol)[: ]+`?([A-Za-z_][A-Za-z0-9_]*)`?").unwrap(),
            ]
        })
        .as_slice()
}

/// `enrich(errors, file, project) → enriched_message` (§4.6).
pub fn enrich(errors: &[String], file: &Path, project: &Path) -> String {
    let raw = errors.join("\n");

    let mut symbols: Vec<String> = Vec::new();
    for err in errors {
        for pattern in symbol_patterns() {
            for caps in pattern.captures_iter(err) {
                let name = caps.get(1).unwrap().as_str().to_string();
                if !symbols.contains(&name) {
                    symbols.push(name);
                }
            }
        }
    }

    if symbols.is_empty() {
        return raw;
    }

    let index = SymbolIndex::new();
    let mut sections = Vec::new();
    for symbol in &symbols {
        let related = index.find_related(symbol, project, RELATION_SET);
        let related: Vec<_> = related
            .into_iter()
            .filter(|r| r.source_file != file)
            .collect();
        if related.is_empty() {
            continue;
        }

        // file name -> distinct relationship kinds observed against it
        let mut by_file: BTreeMap<String, Vec<RelationshipKind>> = BTreeMap::new();
        for rel in related {
            let name = rel
                .source_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| rel.source_file.display().to_string());
            let kinds = by_file.entry(name).or_default();
            if !kinds.contains(&rel.relationship_kind) {
                kinds.push(rel.relationship_kind);
            }
        }

        if by_file.is_empty() {
            continue;
        }

        let mut lines = vec![format!("`{symbol}` relates to:")];
        for (file_name, kinds) in by_file {
            let kind_names: Vec<&str> = kinds.iter().map(relationship_label).collect();
            lines.push(format!("  - {file_name} ({})", kind_names.join(", ")));
        }
        sections.push(lines.join("\n"));
    }

    if sections.is_empty() {
        return raw;
    }

    format!("{raw}\n\n{}", sections.join("\n\n"))
}

fn relationship_label(kind: &RelationshipKind) -> &'static str {
    match kind {
        RelationshipKind::Inheritance => "inheritance",
        RelationshipKind::Instantiation => "instantiation",
        RelationshipKind::MethodCall => "method call",
        RelationshipKind::TypeReference => "type reference",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_raw_errors_when_no_symbol_extractable() {
        let errors = vec!["something went sideways".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let out = enrich(&errors, &dir.path().join("a.rs"), dir.path());
        assert_eq!(out, "something went sideways");
    }

    #[test]
    fn extracts_symbol_and_appends_related_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.rs"),
            "struct Widget;\nfn make(source: Widget) -> Widget { source }\n",
        )
        .unwrap();
        let a_path = dir.path().join("a.rs");
        std::fs::write(&a_path, "fn use_widget(w: Widget) {}\n").unwrap();

        let errors = vec!["error: cannot find type `Widget` in this scope".to_string()];
        let out = enrich(&errors, &a_path, dir.path());

        assert!(out.contains("cannot find type"));
        assert!(out.contains("Widget"));
        assert!(out.contains("b.rs"));
    }

    #[test]
    fn extracts_no_method_named_phrasing() {
        let errors = vec!["error[E0599]: no method named `frobnicate` found for struct".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let out = enrich(&errors, &dir.path().join("a.rs"), dir.path());
        // no related files exist in the empty project, so output is unchanged
        assert_eq!(out, errors[0]);
    }
}
