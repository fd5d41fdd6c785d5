//! Prompt enhancement: activation keywords, `AGENTS.md` discovery, rule
//! collection.
//!
//! Keyword scanning ignores code: fenced blocks and inline backtick spans are
//! stripped before matching. Discovery walks from the workspace upward to the
//! project root (max depth 5); the root-level `AGENTS.md` is deliberately
//! excluded so repo-wide instructions don't leak into every subtree agent.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::prompt::dedup::ContentDeduplicator;
use crate::prompt::frontmatter::{matches_context, parse_frontmatter, RuleContext};

const AGENTS_MD_FILE: &str = "AGENTS.md";
const COPILOT_INSTRUCTIONS: &str = ".copilot-instructions";
const RULES_SUBDIR: &str = ".claude/rules";
const MAX_WALK_DEPTH: usize = 5;
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Files that mark a project root.
const ROOT_MARKERS: [&str; 4] = [".git", "package.json", "Cargo.toml", "pyproject.toml"];

struct ModeSpec {
    patterns: &'static [&'static str],
    instructions: &'static str,
}

/// Activation keyword families. Patterns are matched case-insensitively
/// against code-stripped text; each family carries English, Korean, Japanese,
/// Chinese, and Vietnamese forms plus the bracketed variants.
static MODES: Lazy<[ModeSpec; 3]> = Lazy::new(|| {
    [
        ModeSpec {
            patterns: &[
                "ultrawork",
                "[ultrawork]",
                "ultra work",
                "울트라워크",
                "울트라 워크",
                "ウルトラワーク",
                "超级工作",
                "超級工作",
                "siêu làm việc",
            ],
            instructions: "ULTRAWORK MODE ACTIVATED\n\
                Work the task end to end before replying. Decompose it, execute every \
                subtask, verify the result against the original request, and only then \
                answer. Do not stop at a plan.",
        },
        ModeSpec {
            patterns: &[
                "search mode",
                "search-mode",
                "[search-mode]",
                "검색 모드",
                "검색모드",
                "検索モード",
                "搜索模式",
                "搜尋模式",
                "chế độ tìm kiếm",
            ],
            instructions: "SEARCH MODE ACTIVATED\n\
                Prioritize retrieval over recall: consult memory, files, and available \
                search tools before answering, and cite where each fact came from.",
        },
        ModeSpec {
            patterns: &[
                "analysis mode",
                "analysis-mode",
                "[analysis-mode]",
                "분석 모드",
                "분석모드",
                "分析モード",
                "分析模式",
                "chế độ phân tích",
            ],
            instructions: "ANALYSIS MODE ACTIVATED\n\
                Slow down and reason explicitly: enumerate assumptions, compare at least \
                two alternatives, and state the tradeoffs before recommending one.",
        },
    ]
});

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]*`").unwrap());

/// Result of [`PromptEnhancer::enhance`].
#[derive(Debug, Clone, Default)]
pub struct Enhancement {
    pub keyword_instructions: String,
    pub agents_content: Option<String>,
    pub rules_content: Option<String>,
}

struct CacheSlot {
    at: Instant,
    value: Option<String>,
}

/// Keyword detection plus upward discovery of `AGENTS.md` and rules, with a
/// 60-second TTL cache keyed by absolute workspace path.
#[derive(Default)]
pub struct PromptEnhancer {
    agents_cache: DashMap<PathBuf, CacheSlot>,
}

impl PromptEnhancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the joined instruction blocks for every activated mode, `""`
    /// when nothing matches. Keyword occurrences inside fenced or inline code
    /// do not activate.
    pub fn detect_keywords(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }
        let fence_stripped = FENCE_RE.replace_all(text, "");
        let stripped = INLINE_CODE_RE.replace_all(&fence_stripped, "");
        let haystack = stripped.to_lowercase();
        let mut blocks = Vec::new();
        for mode in MODES.iter() {
            if mode.patterns.iter().any(|p| haystack.contains(p)) {
                blocks.push(mode.instructions);
            }
        }
        blocks.join("\n---\n")
    }

    /// Full enhancement for one inbound message.
    pub fn enhance(
        &self,
        message: &str,
        workspace: &Path,
        ctx: Option<&RuleContext>,
    ) -> Enhancement {
        Enhancement {
            keyword_instructions: self.detect_keywords(message),
            agents_content: self.find_agents_md(workspace),
            rules_content: self.collect_rules(workspace, ctx),
        }
    }

    /// First non-root `AGENTS.md` walking upward from `workspace`. The one at
    /// the project root is never included. Results are cached for 60 seconds.
    pub fn find_agents_md(&self, workspace: &Path) -> Option<String> {
        let key = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        if let Some(slot) = self.agents_cache.get(&key) {
            if slot.at.elapsed() < CACHE_TTL {
                return slot.value.clone();
            }
        }
        let value = self.find_agents_md_uncached(&key);
        self.agents_cache.insert(
            key,
            CacheSlot {
                at: Instant::now(),
                value: value.clone(),
            },
        );
        value
    }

    fn find_agents_md_uncached(&self, workspace: &Path) -> Option<String> {
        let levels = walk_levels(workspace);
        let root = levels.last()?.clone();
        for level in &levels {
            if *level == root {
                continue;
            }
            let candidate = level.join(AGENTS_MD_FILE);
            if let Ok(content) = std::fs::read_to_string(&candidate) {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        None
    }

    /// Collects rule content: `.copilot-instructions` and `.claude/rules/*.md`
    /// at the project root, plus nested `.claude/rules/*.md` on the way up.
    /// Files are frontmatter-filtered against `ctx` and deduplicated; closer
    /// files win. Joined with `---`.
    pub fn collect_rules(&self, workspace: &Path, ctx: Option<&RuleContext>) -> Option<String> {
        let levels = walk_levels(workspace);
        let root = levels.last()?.clone();
        let mut dedup = ContentDeduplicator::new();

        for (depth, level) in levels.iter().enumerate() {
            self.add_rules_dir(&mut dedup, &level.join(RULES_SUBDIR), depth as f64, ctx);
        }
        // Root-level plain instruction file, no frontmatter handling.
        let instructions = root.join(COPILOT_INSTRUCTIONS);
        if let Ok(content) = std::fs::read_to_string(&instructions) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                dedup.add(
                    &instructions.to_string_lossy(),
                    trimmed,
                    (levels.len() - 1) as f64,
                );
            }
        }

        if dedup.is_empty() {
            return None;
        }
        let joined = dedup
            .entries()
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        Some(joined)
    }

    fn add_rules_dir(
        &self,
        dedup: &mut ContentDeduplicator,
        dir: &Path,
        distance: f64,
        ctx: Option<&RuleContext>,
    ) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(content) = std::fs::read_to_string(&path) else { continue };
            let (applies, body) = parse_frontmatter(&content);
            if !matches_context(applies.as_ref(), ctx) {
                continue;
            }
            let body = body.trim();
            if body.is_empty() {
                continue;
            }
            dedup.add(&path.to_string_lossy(), body, distance);
        }
    }
}

/// Levels from `start` up to the project root, inclusive, capped at
/// [`MAX_WALK_DEPTH`]. The last element is treated as the root.
fn walk_levels(start: &Path) -> Vec<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    let mut levels = Vec::new();
    let mut current = start;
    for _ in 0..=MAX_WALK_DEPTH {
        levels.push(current.clone());
        if is_project_root(&current) {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    levels
}

fn is_project_root(dir: &Path) -> bool {
    ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(dir: &Path) {
        std::fs::create_dir_all(dir.join(".git")).unwrap();
    }

    #[test]
    fn detects_modes_and_joins_blocks() {
        let enhancer = PromptEnhancer::new();
        let out = enhancer.detect_keywords("ultrawork: fix bug");
        assert!(out.contains("ULTRAWORK MODE ACTIVATED"));

        let multi = enhancer.detect_keywords("[ultrawork] then [search-mode] please");
        assert!(multi.contains("ULTRAWORK MODE ACTIVATED"));
        assert!(multi.contains("SEARCH MODE ACTIVATED"));
        assert!(multi.contains("\n---\n"));
    }

    #[test]
    fn multilingual_patterns_activate() {
        let enhancer = PromptEnhancer::new();
        assert!(enhancer.detect_keywords("울트라워크로 해줘").contains("ULTRAWORK"));
        assert!(enhancer.detect_keywords("検索モードでお願い").contains("SEARCH"));
        assert!(enhancer.detect_keywords("请用分析模式").contains("ANALYSIS"));
    }

    #[test]
    fn keywords_inside_code_do_not_activate() {
        let enhancer = PromptEnhancer::new();
        assert_eq!(enhancer.detect_keywords("```\nultrawork\n```"), "");
        assert_eq!(enhancer.detect_keywords("run `ultrawork` literally"), "");
        assert_eq!(
            enhancer.detect_keywords("```rust\nsearch mode\n``` and `analysis mode`"),
            ""
        );
        assert_eq!(enhancer.detect_keywords(""), "");
    }

    #[test]
    fn root_agents_md_is_never_included() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let workspace = root.join("packages");
        std::fs::create_dir_all(&workspace).unwrap();
        project(&root);
        std::fs::write(root.join("AGENTS.md"), "root instructions").unwrap();

        let enhancer = PromptEnhancer::new();
        assert_eq!(enhancer.find_agents_md(&workspace), None);
    }

    #[test]
    fn first_non_root_agents_md_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let mid = root.join("packages");
        let workspace = mid.join("app");
        std::fs::create_dir_all(&workspace).unwrap();
        project(&root);
        std::fs::write(root.join("AGENTS.md"), "root").unwrap();
        std::fs::write(mid.join("AGENTS.md"), "pkg").unwrap();

        let enhancer = PromptEnhancer::new();
        assert_eq!(enhancer.find_agents_md(&workspace).as_deref(), Some("pkg"));
    }

    #[test]
    fn cache_serves_stale_until_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let workspace = root.join("packages");
        std::fs::create_dir_all(&workspace).unwrap();
        project(&root);
        std::fs::write(workspace.join("AGENTS.md"), "v1").unwrap();

        let enhancer = PromptEnhancer::new();
        assert_eq!(enhancer.find_agents_md(&workspace).as_deref(), Some("v1"));
        std::fs::write(workspace.join("AGENTS.md"), "v2").unwrap();
        // Within the TTL the cached content is still observed.
        assert_eq!(enhancer.find_agents_md(&workspace).as_deref(), Some("v1"));
    }

    #[test]
    fn rules_from_root_and_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let workspace = root.join("packages");
        std::fs::create_dir_all(workspace.join(".claude/rules")).unwrap();
        std::fs::create_dir_all(root.join(".claude/rules")).unwrap();
        project(&root);
        std::fs::write(root.join(".claude/rules/style.md"), "rule").unwrap();
        std::fs::write(root.join(".claude/rules/notes.txt"), "not markdown").unwrap();
        std::fs::write(root.join(".claude/rules/empty.md"), "  \n").unwrap();
        std::fs::write(root.join(".copilot-instructions"), "copilot says").unwrap();
        std::fs::write(workspace.join(".claude/rules/local.md"), "nested rule").unwrap();

        let enhancer = PromptEnhancer::new();
        let rules = enhancer.collect_rules(&workspace, None).unwrap();
        assert!(rules.contains("rule"));
        assert!(rules.contains("nested rule"));
        assert!(rules.contains("copilot says"));
        assert!(!rules.contains("not markdown"));
        // Nested (closer) content sorts before root content.
        assert!(rules.find("nested rule").unwrap() < rules.find("copilot says").unwrap());
    }

    #[test]
    fn rules_respect_frontmatter_context() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        std::fs::create_dir_all(root.join(".claude/rules")).unwrap();
        project(&root);
        std::fs::write(
            root.join(".claude/rules/tiered.md"),
            "---\napplies_to:\n  tier: [\"3\"]\n---\ntier three only\n",
        )
        .unwrap();

        let enhancer = PromptEnhancer::new();
        let tier3 = RuleContext {
            tier: Some("3".into()),
            ..Default::default()
        };
        let tier1 = RuleContext {
            tier: Some("1".into()),
            ..Default::default()
        };
        assert!(enhancer
            .collect_rules(&root, Some(&tier3))
            .unwrap()
            .contains("tier three only"));
        assert!(enhancer.collect_rules(&root, Some(&tier1)).is_none());
    }

    #[test]
    fn scenario_keyword_plus_rules_injection() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let workspace = root.join("packages");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(root.join(".claude/rules")).unwrap();
        project(&root);
        std::fs::write(workspace.join(AGENTS_MD_FILE), "pkg").unwrap();
        std::fs::write(root.join(".claude/rules/style.md"), "rule").unwrap();

        let enhancer = PromptEnhancer::new();
        let out = enhancer.enhance("ultrawork: fix bug", &workspace, None);
        assert!(out.keyword_instructions.contains("ULTRAWORK MODE ACTIVATED"));
        assert_eq!(out.agents_content.as_deref(), Some("pkg"));
        assert!(out.rules_content.unwrap().contains("rule"));
    }
}
