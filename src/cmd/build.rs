//! One-shot inline build (`buildforge build`).
//!
//! Events go to stdout as JSON lines (`{"event": ..., "data": ...}`); logs
//! stay on stderr.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use buildforge::config::Config;
use buildforge::orchestrator::{self, AdmitMode, BuildEvent, BuildRequest, EventSink, RunOutcome};
use buildforge::runtime::Services;
use buildforge::store::{BuildStatus, GeneratedFile, language_for_path};

pub struct BuildArgs {
    pub prompt: String,
    pub user: String,
    pub build_id: Option<String>,
    pub project_id: Option<String>,
    pub model: Option<String>,
    pub strict: bool,
    pub max_fix_iterations: Option<u32>,
    pub context: Vec<PathBuf>,
    pub chunks: bool,
}

struct JsonLinesSink {
    chunks: bool,
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: BuildEvent) {
        println!("{}", event.to_json_line());
    }

    fn wants_chunks(&self) -> bool {
        self.chunks
    }
}

fn read_context(project_dir: &Path, paths: &[PathBuf]) -> Result<Vec<GeneratedFile>> {
    paths
        .iter()
        .map(|path| {
            let full = if path.is_absolute() {
                path.clone()
            } else {
                project_dir.join(path)
            };
            let content = std::fs::read_to_string(&full)
                .with_context(|| format!("Failed to read context file {}", full.display()))?;
            let name = path.to_string_lossy().replace('\\', "/");
            Ok(GeneratedFile::new(&name, &content, language_for_path(&name)))
        })
        .collect()
}

pub async fn cmd_build(config: Config, project_dir: &Path, args: BuildArgs) -> Result<()> {
    let context = read_context(project_dir, &args.context)?;
    let services = Services::open(config)?;

    let request = BuildRequest {
        prompt: args.prompt,
        project_id: args.project_id,
        build_id: args.build_id,
        model: args.model,
        strict_mode: args.strict.then_some(true),
        max_fix_iterations: args.max_fix_iterations,
        context,
        provider: None,
    };
    let admission = services
        .admission
        .admit(&args.user, request, AdmitMode::Inline)
        .await?;
    let build_id = admission.build.id.clone();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let sink = JsonLinesSink { chunks: args.chunks };
    let outcome = orchestrator::run_inline(&services.orchestrator, admission, cancel, &sink).await?;
    services.close().await;

    match outcome {
        RunOutcome::Finished(BuildStatus::Failed) => bail!("Build {} failed", build_id),
        RunOutcome::Finished(status) => {
            eprintln!("Build {} finished: {}", build_id, status.as_str());
            Ok(())
        }
        RunOutcome::Retry { error } => bail!("Build {} was not finished: {}", build_id, error),
        RunOutcome::LeaseLost => bail!("Build {} was taken over by another owner", build_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_context_keeps_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/App.tsx"), "export default function App() {}\n").unwrap();

        let files = read_context(dir.path(), &[PathBuf::from("src/App.tsx")]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/App.tsx");
        assert!(files[0].content.contains("App"));
    }

    #[test]
    fn test_read_context_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_context(dir.path(), &[PathBuf::from("nope.ts")]).unwrap_err();
        assert!(err.to_string().contains("nope.ts"));
    }
}
