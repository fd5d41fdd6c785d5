//! Contract extraction from edited source files: REST endpoints, function
//! signatures, type definitions, SQL schemas, GraphQL schemas.
//!
//! Extraction is regex-based and intentionally shallow: the goal is a durable
//! record of externally observable surface, not a parse tree.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Kind of extracted contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    ApiEndpoint,
    FunctionSignature,
    TypeDefinition,
    SqlSchema,
    GraphqlSchema,
}

/// One extracted contract. `topic` keys the duplicate check; `detail` is the
/// decision text persisted to memory.
#[derive(Debug, Clone, Serialize)]
pub struct Contract {
    pub kind: ContractKind,
    pub topic: String,
    pub detail: String,
    pub file: String,
    pub line: usize,
    /// In `[0, 1]`.
    pub confidence: f64,
}

const MAX_TYPE_FIELDS: usize = 5;
const MAX_SQL_COLUMNS: usize = 10;
const MAX_GRAPHQL_FIELDS: usize = 10;

static EXPRESS_ROUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)\b(?:app|router|server)\.(get|post|put|delete|patch)\s*\(\s*['"`]([^'"`]+)['"`]"#)
        .unwrap()
});
static SPRING_MAPPING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@(Get|Post|Put|Delete|Patch|Request)Mapping\s*\(\s*(?:value\s*=\s*)?"([^"]+)""#)
        .unwrap()
});
static JS_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+(\w+)\s*\(([^)]*)\)(?:\s*:\s*([^\{\n]+))?")
        .unwrap()
});
static JS_ARROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?\(([^)]*)\)(?:\s*:\s*([^=\n]+))?\s*=>")
        .unwrap()
});
static PY_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    // Only type-hinted defs are contract-worthy.
    Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(\w+)\s*\(([^)]*)\)\s*->\s*([^:]+):").unwrap()
});
static GO_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*func\s+(?:\([^)]*\)\s*)?(\w+)\s*\(([^)]*)\)\s*([^\{\n]*)").unwrap()
});
static RUST_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(\w+)\s*(?:<[^>]*>)?\s*\(([^)]*)\)(?:\s*->\s*([^\{\n]+))?")
        .unwrap()
});
static TS_INTERFACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\binterface\s+(\w+)(?:\s+extends\s+[\w,\s]+)?\s*\{(.*?)\}").unwrap()
});
static TS_TYPE_ALIAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\btype\s+(\w+)\s*=\s*\{(.*?)\}").unwrap());
static SQL_CREATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?[`"]?(\w+)[`"]?\s*\((.*?)\)\s*;"#)
        .unwrap()
});
static SQL_ALTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)\bALTER\s+TABLE\s+[`\x22]?(\w+)[`\x22]?\s+ADD\s+(?:COLUMN\s+)?(\w+)\s+(\w+[^,;\n]*)")
        .unwrap()
});
static GRAPHQL_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\b(type|input|interface|enum)\s+(\w+)(?:\s+implements\s+[\w&\s]+)?\s*\{(.*?)\}")
        .unwrap()
});

const SQL_CONSTRAINT_PREFIXES: [&str; 7] = [
    "primary", "foreign", "constraint", "unique", "check", "key", "index",
];

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn looks_like_graphql(content: &str) -> bool {
    // Avoid mistaking TS interfaces for GraphQL: require schema-only syntax.
    content.contains("type Query")
        || content.contains("type Mutation")
        || content.contains("input ")
        || content.contains("enum ")
}

/// Extracts all contracts from one file's content.
pub fn extract_contracts(file: &str, content: &str) -> Vec<Contract> {
    let mut out = Vec::new();
    extract_endpoints(file, content, &mut out);
    extract_functions(file, content, &mut out);
    extract_types(file, content, &mut out);
    extract_sql(file, content, &mut out);
    extract_graphql(file, content, &mut out);
    out
}

fn extract_endpoints(file: &str, content: &str, out: &mut Vec<Contract>) {
    for caps in EXPRESS_ROUTE.captures_iter(content) {
        let method = caps[1].to_uppercase();
        let path = &caps[2];
        out.push(Contract {
            kind: ContractKind::ApiEndpoint,
            topic: format!("API: {method} {path}"),
            detail: format!("{method} {path} endpoint"),
            file: file.to_string(),
            line: line_of(content, caps.get(0).unwrap().start()),
            confidence: 0.9,
        });
    }
    for caps in SPRING_MAPPING.captures_iter(content) {
        let method = caps[1].to_uppercase();
        let path = &caps[2];
        out.push(Contract {
            kind: ContractKind::ApiEndpoint,
            topic: format!("API: {method} {path}"),
            detail: format!("{method} {path} endpoint (annotation mapping)"),
            file: file.to_string(),
            line: line_of(content, caps.get(0).unwrap().start()),
            confidence: 0.85,
        });
    }
}

fn extract_functions(file: &str, content: &str, out: &mut Vec<Contract>) {
    let ext = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let sources: &[(&Lazy<Regex>, bool)] = match ext {
        "js" | "jsx" | "ts" | "tsx" | "mjs" => &[(&JS_FUNCTION, true), (&JS_ARROW, true)],
        "py" => &[(&PY_FUNCTION, true)],
        "go" => &[(&GO_FUNCTION, false)],
        "rs" => &[(&RUST_FUNCTION, false)],
        _ => &[],
    };
    for (regex, _typed) in sources {
        for caps in regex.captures_iter(content) {
            let name = caps[1].to_string();
            if name.starts_with('_') {
                continue;
            }
            let params = caps[2].trim().to_string();
            let return_type = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty());
            let signature = match &return_type {
                Some(ret) => format!("{name}({params}) -> {ret}"),
                None => format!("{name}({params})"),
            };
            out.push(Contract {
                kind: ContractKind::FunctionSignature,
                topic: format!("Function: {name}"),
                detail: signature,
                file: file.to_string(),
                line: line_of(content, caps.get(0).unwrap().start()),
                confidence: 0.7,
            });
        }
    }
}

fn extract_types(file: &str, content: &str, out: &mut Vec<Contract>) {
    let ext = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if !matches!(ext, "ts" | "tsx" | "d.ts") {
        return;
    }
    for regex in [&TS_INTERFACE, &TS_TYPE_ALIAS] {
        for caps in regex.captures_iter(content) {
            let name = caps[1].to_string();
            let fields: Vec<String> = caps[2]
                .split(['\n', ';'])
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with("//"))
                .take(MAX_TYPE_FIELDS)
                .map(|l| l.trim_end_matches(',').to_string())
                .collect();
            out.push(Contract {
                kind: ContractKind::TypeDefinition,
                topic: format!("Type: {name}"),
                detail: format!("{name} {{ {} }}", fields.join("; ")),
                file: file.to_string(),
                line: line_of(content, caps.get(0).unwrap().start()),
                confidence: 0.75,
            });
        }
    }
}

fn extract_sql(file: &str, content: &str, out: &mut Vec<Contract>) {
    for caps in SQL_CREATE.captures_iter(content) {
        let table = caps[1].to_string();
        let columns: Vec<String> = caps[2]
            .split(',')
            .map(str::trim)
            .filter(|line| {
                let lower = line.to_lowercase();
                !line.is_empty()
                    && !SQL_CONSTRAINT_PREFIXES
                        .iter()
                        .any(|prefix| lower.starts_with(prefix))
            })
            .take(MAX_SQL_COLUMNS)
            .map(|line| line.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
            .collect();
        out.push(Contract {
            kind: ContractKind::SqlSchema,
            topic: format!("SQL table: {table}"),
            detail: format!("{table} ({})", columns.join(", ")),
            file: file.to_string(),
            line: line_of(content, caps.get(0).unwrap().start()),
            confidence: 0.85,
        });
    }
    for caps in SQL_ALTER.captures_iter(content) {
        let table = caps[1].to_string();
        let column = caps[2].to_string();
        out.push(Contract {
            kind: ContractKind::SqlSchema,
            topic: format!("SQL table: {table}"),
            detail: format!("{table} gains column {column} {}", caps[3].trim()),
            file: file.to_string(),
            line: line_of(content, caps.get(0).unwrap().start()),
            confidence: 0.8,
        });
    }
}

fn extract_graphql(file: &str, content: &str, out: &mut Vec<Contract>) {
    let ext = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if !matches!(ext, "graphql" | "gql") && !looks_like_graphql(content) {
        return;
    }
    for caps in GRAPHQL_TYPE.captures_iter(content) {
        let keyword = caps[1].to_string();
        let name = caps[2].to_string();
        let fields: Vec<String> = caps[3]
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .take(MAX_GRAPHQL_FIELDS)
            .map(str::to_string)
            .collect();
        out.push(Contract {
            kind: ContractKind::GraphqlSchema,
            topic: format!("GraphQL {keyword}: {name}"),
            detail: format!("{keyword} {name} {{ {} }}", fields.join("; ")),
            file: file.to_string(),
            line: line_of(content, caps.get(0).unwrap().start()),
            confidence: 0.8,
        });
    }
}
