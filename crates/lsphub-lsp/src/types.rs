use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationLink {
    #[serde(default)]
    pub origin_selection_range: Option<Range>,
    pub target_uri: String,
    pub target_range: Range,
    pub target_selection_range: Range,
}

/// `textDocument/definition` is polymorphic: servers return `Location`,
/// `Location[]` or `LocationLink[]`. The discriminator is `targetUri` vs
/// `uri`; downstream tools want the original shape, so no coercion happens
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocationOrLink {
    Link(LocationLink),
    Location(Location),
}

impl LocationOrLink {
    pub fn uri(&self) -> &str {
        match self {
            LocationOrLink::Link(l) => &l.target_uri,
            LocationOrLink::Location(l) => &l.uri,
        }
    }

    pub fn range(&self) -> &Range {
        match self {
            LocationOrLink::Link(l) => &l.target_selection_range,
            LocationOrLink::Location(l) => &l.range,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbol {
    pub name: String,
    pub kind: u32,
    pub range: Range,
    pub selection_range: Range,
    #[serde(default)]
    pub children: Vec<DocumentSymbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInformation {
    pub name: String,
    pub kind: u32,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default)]
    pub severity: Option<u32>,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHierarchyItem {
    pub name: String,
    pub kind: u32,
    pub uri: String,
    pub range: Range,
    pub selection_range: Range,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHierarchyIncomingCall {
    pub from: CallHierarchyItem,
    #[serde(default)]
    pub from_ranges: Vec<Range>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHierarchyOutgoingCall {
    pub to: CallHierarchyItem,
    #[serde(default)]
    pub from_ranges: Vec<Range>,
}

/// LSP SymbolKind numbers to readable names.
pub fn symbol_kind_name(kind: u32) -> &'static str {
    match kind {
        1 => "file",
        2 => "module",
        3 => "namespace",
        4 => "package",
        5 => "class",
        6 => "method",
        7 => "property",
        8 => "field",
        9 => "constructor",
        10 => "enum",
        11 => "interface",
        12 => "function",
        13 => "variable",
        14 => "constant",
        15 => "string",
        16 => "number",
        17 => "boolean",
        18 => "array",
        19 => "object",
        20 => "key",
        21 => "null",
        22 => "enum_member",
        23 => "struct",
        24 => "event",
        25 => "operator",
        26 => "type_parameter",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_decodes_location_links() {
        let raw = serde_json::json!([{
            "targetUri": "file:///src/module.bsl",
            "targetRange": { "start": { "line": 1, "character": 0 }, "end": { "line": 9, "character": 0 } },
            "targetSelectionRange": { "start": { "line": 1, "character": 10 }, "end": { "line": 1, "character": 20 } }
        }]);
        let parsed: Vec<LocationOrLink> = serde_json::from_value(raw).unwrap();
        assert!(matches!(parsed[0], LocationOrLink::Link(_)));
        assert_eq!(parsed[0].uri(), "file:///src/module.bsl");
        assert_eq!(parsed[0].range().start.line, 1);
    }

    #[test]
    fn definition_decodes_plain_locations() {
        let raw = serde_json::json!([{
            "uri": "file:///src/module.bsl",
            "range": { "start": { "line": 4, "character": 2 }, "end": { "line": 4, "character": 12 } }
        }]);
        let parsed: Vec<LocationOrLink> = serde_json::from_value(raw).unwrap();
        assert!(matches!(parsed[0], LocationOrLink::Location(_)));
        assert_eq!(parsed[0].range().start.line, 4);
    }

    #[test]
    fn symbol_kind_names_cover_the_lsp_table() {
        assert_eq!(symbol_kind_name(6), "method");
        assert_eq!(symbol_kind_name(12), "function");
        assert_eq!(symbol_kind_name(99), "unknown");
    }
}
