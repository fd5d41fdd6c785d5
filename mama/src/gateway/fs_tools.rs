//! Filesystem and shell tool backends: Read, Write, Glob, Grep, Bash.
//!
//! Read output is cat -n style with line numbers; long lines are truncated.
//! Grep uses the ripgrep library stack and respects ignore files.

use std::path::Path;
use std::time::Duration;

use grep_regex::RegexMatcher;
use grep_searcher::sinks::UTF8;
use grep_searcher::Searcher;
use ignore::WalkBuilder;

use crate::error::AgentError;

const DEFAULT_READ_LIMIT: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;
const DEFAULT_GREP_LIMIT: usize = 100;
const DEFAULT_GLOB_LIMIT: usize = 500;
const DEFAULT_BASH_TIMEOUT: Duration = Duration::from_secs(120);

/// Reads a file with offset/limit, formatted as "  {line}\t{content}".
pub fn read_file(path: &Path, offset: usize, limit: Option<usize>) -> Result<String, AgentError> {
    if !path.exists() {
        return Err(AgentError::Validation(format!(
            "file not found: {}",
            path.display()
        )));
    }
    if path.is_dir() {
        return Err(AgentError::Validation(format!(
            "is a directory, not a file: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Transport(format!("failed to read file: {e}")))?;

    let limit = limit.unwrap_or(DEFAULT_READ_LIMIT);
    let lines: Vec<&str> = content.split('\n').collect();
    let total = lines.len();
    let start = offset.min(total);
    let end = (start + limit).min(total);

    let mut out = String::new();
    for (i, line) in lines[start..end].iter().enumerate() {
        let line_num = start + i + 1;
        let truncated = if line.len() > MAX_LINE_LENGTH {
            format!("{}...", &line[..MAX_LINE_LENGTH])
        } else {
            (*line).to_string()
        };
        out.push_str(&format!("  {line_num}\t{truncated}\n"));
    }
    Ok(out)
}

/// Writes content, creating parent directories. Returns a short summary.
pub fn write_file(path: &Path, content: &str) -> Result<String, AgentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::Transport(format!("failed to create directories: {e}")))?;
    }
    std::fs::write(path, content)
        .map_err(|e| AgentError::Transport(format!("failed to write file: {e}")))?;
    Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
}

/// Lists files under `root` matching a glob pattern (relative to `root`).
pub fn glob_files(root: &Path, pattern: &str, limit: Option<usize>) -> Result<Vec<String>, AgentError> {
    let compiled = glob::Pattern::new(pattern)
        .map_err(|e| AgentError::Validation(format!("bad glob pattern: {e}")))?;
    let limit = limit.unwrap_or(DEFAULT_GLOB_LIMIT);
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if compiled.matches(&rel) {
            out.push(rel);
            if out.len() >= limit {
                break;
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Searches file contents under `root`. Respects .gitignore via the ignore
/// walker. Output lines: `path:line_number:content`.
pub fn grep_files(root: &Path, pattern: &str, limit: Option<usize>) -> Result<Vec<String>, AgentError> {
    let matcher = RegexMatcher::new(pattern)
        .map_err(|e| AgentError::Validation(format!("bad regex: {e}")))?;
    let limit = limit.unwrap_or(DEFAULT_GREP_LIMIT);
    let mut results: Vec<String> = Vec::new();
    for entry in WalkBuilder::new(root).build().flatten() {
        if results.len() >= limit {
            break;
        }
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path().to_path_buf();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        let mut searcher = Searcher::new();
        let sink_results = &mut results;
        let _ = searcher.search_path(
            &matcher,
            &path,
            UTF8(|line_number, line| {
                sink_results.push(format!("{rel}:{line_number}:{}", line.trim_end()));
                Ok(sink_results.len() < limit)
            }),
        );
    }
    Ok(results)
}

/// Runs a shell command with a timeout, capturing stdout and stderr.
pub async fn run_bash(command: &str, timeout: Option<Duration>) -> Result<String, AgentError> {
    let timeout = timeout.unwrap_or(DEFAULT_BASH_TIMEOUT);
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Transport(format!("failed to spawn shell: {e}")))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| AgentError::Transport(format!("command timed out after {timeout:?}")))?
        .map_err(|e| AgentError::Transport(format!("command failed: {e}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        text.push_str("\n[stderr]\n");
        text.push_str(stderr.trim_end());
    }
    if !output.status.success() {
        text.push_str(&format!(
            "\n[exit code: {}]",
            output.status.code().unwrap_or(-1)
        ));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_formats_with_line_numbers_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();
        let all = read_file(&path, 0, None).unwrap();
        assert!(all.starts_with("  1\talpha\n"));
        let tail = read_file(&path, 1, Some(1)).unwrap();
        assert_eq!(tail, "  2\tbeta\n");
    }

    #[test]
    fn read_rejects_missing_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_file(&dir.path().join("nope"), 0, None).is_err());
        assert!(read_file(dir.path(), 0, None).is_err());
    }

    #[test]
    fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        write_file(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn glob_matches_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();
        let hits = glob_files(dir.path(), "**/*.rs", None).unwrap();
        assert_eq!(hits, vec!["src/main.rs"]);
    }

    #[test]
    fn grep_reports_path_line_and_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "first\nneedle here\n").unwrap();
        let hits = grep_files(dir.path(), "needle", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].ends_with("notes.txt:2:needle here"));
    }

    #[tokio::test]
    async fn bash_captures_output_and_exit_code() {
        let out = run_bash("echo hi && echo err >&2", None).await.unwrap();
        assert!(out.contains("hi"));
        assert!(out.contains("[stderr]"));

        let failed = run_bash("exit 3", None).await.unwrap();
        assert!(failed.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn bash_times_out() {
        let result = run_bash("sleep 5", Some(Duration::from_millis(100))).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }
}
