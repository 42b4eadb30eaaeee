//! Per-extension symbol extraction. Regex-based (§9: "a legitimate
//! fallback"). Range end is the closing structural boundary of the
//! declaration: brace balance for brace languages, dedent for
//! indentation-based languages. Parent/child containment is derived from
//! the nesting stack built while scanning.

use regex::Regex;
use std::sync::OnceLock;

use crate::model::{RelationshipKind, Symbol, SymbolKind};

pub fn extract_symbols(content: &str, extension: &str) -> Vec<Symbol> {
    match extension {
        "rs" => extract_brace_language(content, rust_patterns()),
        "go" => extract_brace_language(content, go_patterns()),
        "js" | "jsx" | "ts" | "tsx" => extract_brace_language(content, js_patterns()),
        "swift" => extract_brace_language(content, swift_patterns()),
        "py" => extract_python(content),
        _ => Vec::new(),
    }
}

struct Pattern {
    regex: Regex,
    kind: SymbolKind,
    /// capture group index for the symbol name
    name_group: usize,
}

fn rust_patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                regex: Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(\w+)").unwrap(),
                kind: SymbolKind::Function,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+(\w+)").unwrap(),
                kind: SymbolKind::Struct,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+(\w+)").unwrap(),
                kind: SymbolKind::Enum,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?trait\s+(\w+)").unwrap(),
                kind: SymbolKind::Protocol,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*impl(?:<[^>]*>)?\s+(?:\w+\s+for\s+)?(\w+)").unwrap(),
                kind: SymbolKind::Class,
                name_group: 1,
            },
        ]
    })
}

fn go_patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                regex: Regex::new(r"^\s*func\s+(?:\([^)]*\)\s*)?(\w+)").unwrap(),
                kind: SymbolKind::Function,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*type\s+(\w+)\s+struct").unwrap(),
                kind: SymbolKind::Struct,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*type\s+(\w+)\s+interface").unwrap(),
                kind: SymbolKind::Protocol,
                name_group: 1,
            },
        ]
    })
}

fn js_patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                regex: Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s+(\w+)").unwrap(),
                kind: SymbolKind::Function,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?class\s+(\w+)").unwrap(),
                kind: SymbolKind::Class,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:export\s+)?(?:const|let)\s+(\w+)\s*=\s*(?:async\s*)?\(").unwrap(),
                kind: SymbolKind::Function,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(\w+)\s*\([^)]*\)\s*\{").unwrap(),
                kind: SymbolKind::Method,
                name_group: 1,
            },
        ]
    })
}

fn swift_patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                regex: Regex::new(r"^\s*(?:public\s+|private\s+|internal\s+|fileprivate\s+)?func\s+(\w+)").unwrap(),
                kind: SymbolKind::Function,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:public\s+|private\s+|internal\s+)?class\s+(\w+)").unwrap(),
                kind: SymbolKind::Class,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:public\s+|private\s+|internal\s+)?struct\s+(\w+)").unwrap(),
                kind: SymbolKind::Struct,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:public\s+|private\s+|internal\s+)?enum\s+(\w+)").unwrap(),
                kind: SymbolKind::Enum,
                name_group: 1,
            },
            Pattern {
                regex: Regex::new(r"^\s*(?:public\s+|private\s+|internal\s+)?protocol\s+(\w+)").unwrap(),
                kind: SymbolKind::Protocol,
                name_group: 1,
            },
        ]
    })
}

/// Scans `content` line by line. Each matched declaration opens a symbol
/// whose range closes when brace depth returns to the depth it had when
/// the symbol was opened. Symbols opened while another symbol is on the
/// stack become its children (parent containment, §3's invariant).
fn extract_brace_language(content: &str, patterns: &[Pattern]) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    // (name, kind, start_line, depth_at_open, stack index at push time)
    struct Open {
        idx: usize,
        depth_at_open: i32,
    }
    let mut stack: Vec<Open> = Vec::new();
    let mut depth: i32 = 0;

    for (line_no, line) in content.lines().enumerate() {
        let line_number = line_no + 1;

        if let Some(p) = patterns.iter().find(|p| p.regex.is_match(line)) {
            if let Some(caps) = p.regex.captures(line) {
                if let Some(name) = caps.get(p.name_group) {
                    let parent = stack.last().map(|o| symbols[o.idx].name.clone());
                    symbols.push(Symbol {
                        name: name.as_str().to_string(),
                        kind: p.kind,
                        parent,
                        start_line: line_number,
                        end_line: line_number,
                        signature: Some(line.trim().to_string()),
                    });
                    stack.push(Open {
                        idx: symbols.len() - 1,
                        depth_at_open: depth,
                    });
                }
            }
        }

        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    while let Some(top) = stack.last() {
                        if depth <= top.depth_at_open {
                            let closed = stack.pop().unwrap();
                            symbols[closed.idx].end_line = line_number;
                        } else {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Anything left open (malformed input) closes at EOF rather than panicking.
    let last_line = content.lines().count().max(1);
    for open in stack {
        symbols[open.idx].end_line = last_line;
    }

    symbols
}

fn extract_python(content: &str) -> Vec<Symbol> {
    let def_re = Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)").unwrap();
    let class_re = Regex::new(r"^(\s*)class\s+(\w+)").unwrap();

    struct Open {
        idx: usize,
        indent: usize,
    }
    let mut symbols: Vec<Symbol> = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let lines: Vec<&str> = content.lines().collect();
    // Tracks the last non-blank line seen so a dedent closes a range at the
    // declaration's actual last line of code, not at an intervening blank.
    let mut last_nonblank_line = 0usize;

    for (line_no, line) in lines.iter().enumerate() {
        let line_number = line_no + 1;
        if line.trim().is_empty() {
            continue;
        }
        let indent = line.len() - line.trim_start().len();

        while let Some(top) = stack.last() {
            if indent <= top.indent {
                let closed = stack.pop().unwrap();
                symbols[closed.idx].end_line = last_nonblank_line.max(symbols[closed.idx].start_line);
            } else {
                break;
            }
        }

        let (kind, caps) = if let Some(c) = class_re.captures(line) {
            (SymbolKind::Class, Some(c))
        } else if let Some(c) = def_re.captures(line) {
            (SymbolKind::Function, Some(c))
        } else {
            (SymbolKind::Function, None)
        };

        if let Some(caps) = caps {
            let name = caps.get(2).unwrap().as_str().to_string();
            let parent = stack.last().map(|o| symbols[o.idx].name.clone());
            symbols.push(Symbol {
                name,
                kind,
                parent,
                start_line: line_number,
                end_line: line_number,
                signature: Some(line.trim().to_string()),
            });
            stack.push(Open {
                idx: symbols.len() - 1,
                indent,
            });
        }

        last_nonblank_line = line_number;
    }

    let last_line = lines.len().max(1);
    for open in stack {
        symbols[open.idx].end_line = last_line;
    }

    symbols
}

/// Best-effort relationship detection for `find_related` (§4.1, §4.6). Each
/// kind maps to a distinct textual pattern; a file can match more than one.
pub fn matches_relationship(content: &str, symbol_name: &str, kind: RelationshipKind) -> bool {
    let escaped = regex::escape(symbol_name);
    let pattern = match kind {
        RelationshipKind::Inheritance => format!(r":\s*{escaped}\b|extends\s+{escaped}\b"),
        RelationshipKind::Instantiation => format!(r"{escaped}\s*\(|{escaped}\s*::new|new\s+{escaped}\b"),
        RelationshipKind::MethodCall => format!(r"\.{escaped}\s*\("),
        RelationshipKind::TypeReference => format!(r":\s*{escaped}\b|<\s*{escaped}\s*>|{escaped}\s*<"),
    };
    Regex::new(&pattern)
        .map(|re| re.is_match(content))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_function_range_closes_at_matching_brace() {
        let src = "fn one() {\n    let x = 1;\n}\n\nfn two() {\n}\n";
        let symbols = extract_symbols(src, "rs");
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "one");
        assert_eq!(symbols[0].start_line, 1);
        assert_eq!(symbols[0].end_line, 3);
        assert_eq!(symbols[1].name, "two");
    }

    #[test]
    fn rust_impl_block_contains_its_methods() {
        let src = "struct Foo;\n\nimpl Foo {\n    fn bar(&self) {\n        1;\n    }\n}\n";
        let symbols = extract_symbols(src, "rs");
        let bar = symbols.iter().find(|s| s.name == "bar").unwrap();
        assert_eq!(bar.parent.as_deref(), Some("Foo"));
        let foo_impl = symbols.iter().find(|s| s.kind == SymbolKind::Class).unwrap();
        assert!(foo_impl.start_line < bar.start_line && bar.end_line <= foo_impl.end_line);
    }

    #[test]
    fn python_dedent_closes_function_range() {
        let src = "def one():\n    return 1\n\ndef two():\n    return 2\n";
        let symbols = extract_symbols(src, "py");
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "one");
        assert_eq!(symbols[0].end_line, 2);
    }

    #[test]
    fn unknown_extension_yields_no_symbols() {
        assert!(extract_symbols("whatever", "xyz").is_empty());
    }
}
