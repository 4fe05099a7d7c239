//! The `check` and `complete` commands.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use quill_lsp::{LspConfig, LspEvent, LspManager, path_to_file_uri, rank_candidates, word_start};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Language id for `path`, falling back to the configured one.
fn language_id_for<'a>(path: &Path, default: &'a str) -> &'a str {
    match path.extension().and_then(OsStr::to_str) {
        Some("c") => "c",
        Some("cc" | "cpp" | "cxx" | "hh" | "hpp" | "hxx") => "cpp",
        Some("m") => "objc",
        Some("mm") => "objcpp",
        _ => default,
    }
}

struct SourceFile {
    path: PathBuf,
    uri: String,
    text: String,
}

async fn read_source(path: &Path) -> Result<SourceFile> {
    let path = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("resolving {}", path.display()))?;
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let uri = path_to_file_uri(&path)?.to_string();
    Ok(SourceFile { path, uri, text })
}

/// Open every file, wait for diagnostics and print them.
///
/// Fails (exit code 1) when any error-level diagnostic was reported.
pub async fn check(
    config: LspConfig,
    root: &Path,
    files: &[PathBuf],
    wait_ms: u64,
) -> Result<ExitCode> {
    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        sources.push(read_source(file).await?);
    }

    let default_language = config.language_id.clone();
    let mut manager = LspManager::start(config, root)
        .await
        .context("starting language server")?;

    for source in &sources {
        let language_id = language_id_for(&source.path, &default_language);
        manager
            .open(&source.uri, &source.text, language_id)
            .await
            .with_context(|| format!("opening {}", source.path.display()))?;
    }

    let mut reported: HashSet<String> = HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
    while reported.len() < sources.len() && tokio::time::Instant::now() < deadline {
        if let Err(e) = manager.poll().await {
            tracing::warn!("Poll failed: {e}");
        }
        for event in manager.take_events() {
            match event {
                LspEvent::Diagnostics { uri, .. } => {
                    reported.insert(uri);
                }
                LspEvent::Status(state) => eprintln!("quill: {}", state.describe()),
                LspEvent::ServerRequest { .. } => {}
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let mut errors = 0;
    for source in &sources {
        if !reported.contains(&source.uri) {
            tracing::info!(uri = %source.uri, "No diagnostics reported before deadline");
        }
        let Some(index) = manager.diagnostics(&source.uri).await else {
            continue;
        };
        for (_, items) in index.lines() {
            for diag in items {
                println!("{}", diag.display_with_path(&source.path));
            }
        }
        if !index.is_empty() {
            eprintln!("{}: {}", source.path.display(), index.status_string());
        }
        errors += index.error_count();
    }

    manager.stop().await;
    Ok(if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Print ranked completion candidates at a 1-based position.
pub async fn complete(
    config: LspConfig,
    root: &Path,
    file: &Path,
    line: u32,
    column: u32,
) -> Result<ExitCode> {
    if line == 0 || column == 0 {
        bail!("line and column are 1-based");
    }
    let source = read_source(file).await?;
    let line_text = source
        .text
        .lines()
        .nth((line - 1) as usize)
        .with_context(|| format!("{} has no line {line}", source.path.display()))?;
    let (_, prefix) = word_start(line_text, (column - 1) as usize);
    let prefix = prefix.to_string();

    let language_id = language_id_for(&source.path, &config.language_id).to_string();
    let mut manager = LspManager::start(config, root)
        .await
        .context("starting language server")?;
    manager
        .open(&source.uri, &source.text, &language_id)
        .await
        .context("opening document")?;

    let items = manager
        .completion(&source.uri, line - 1, column - 1)
        .await
        .map_err(|e| anyhow::anyhow!(e.summary(120)))?;
    for item in rank_candidates(items, &prefix) {
        let kind = item.effective_kind().abbreviation();
        println!("{kind} {}\t{}", item.label, item.info());
    }

    manager.stop().await;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_ids_by_extension() {
        assert_eq!(language_id_for(Path::new("a.c"), "cpp"), "c");
        assert_eq!(language_id_for(Path::new("a.hpp"), "c"), "cpp");
        assert_eq!(language_id_for(Path::new("a.mm"), "c"), "objcpp");
        assert_eq!(language_id_for(Path::new("a.h"), "cpp"), "cpp");
        assert_eq!(language_id_for(Path::new("Makefile"), "c"), "c");
    }

    #[tokio::test]
    async fn read_source_builds_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.c");
        std::fs::write(&path, "int x;\n").unwrap();
        let source = read_source(&path).await.unwrap();
        assert!(source.uri.starts_with("file:///"));
        assert!(source.uri.ends_with("/x.c"));
        assert_eq!(source.text, "int x;\n");
    }

    #[tokio::test]
    async fn read_source_reports_missing_file() {
        let err = read_source(Path::new("/definitely/not/here.c"))
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("resolving"));
    }
}
