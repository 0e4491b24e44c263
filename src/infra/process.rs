//! Rendering capability backed by an external renderer executable.
//!
//! The renderer follows the platelet CLI contract: it receives the entry
//! template path as its last argument, reads the JSON context from stdin,
//! resolves includes relative to the template, and prints the rendered
//! output on stdout.

use std::{
    collections::BTreeMap,
    env,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, warn};

use crate::application::render::{CapabilityLoader, LoadError, RenderCapability, RenderFailure};
use crate::config::CapabilitySettings;

#[derive(Debug, Error)]
enum ProcessRenderError {
    #[error("invalid files payload: {0}")]
    Files(serde_json::Error),
    #[error("template `{0}` not found in files")]
    MissingRoot(String),
    #[error("file path `{0}` must be relative and stay inside the template tree")]
    UnsafePath(String),
    #[error("failed to stage template files: {0}")]
    Stage(io::Error),
    #[error("failed to run renderer `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed to pass context to renderer: {0}")]
    Context(io::Error),
    #[error("{0}")]
    Renderer(String),
    #[error("renderer produced output that is not valid UTF-8")]
    Output,
}

impl ProcessRenderError {
    fn code(&self) -> &'static str {
        match self {
            ProcessRenderError::Files(_) => "files",
            ProcessRenderError::MissingRoot(_) => "missing_root",
            ProcessRenderError::UnsafePath(_) => "unsafe_path",
            ProcessRenderError::Stage(_) => "stage",
            ProcessRenderError::Spawn { .. } => "spawn",
            ProcessRenderError::Context(_) => "context",
            ProcessRenderError::Renderer(_) => "renderer",
            ProcessRenderError::Output => "output",
        }
    }
}

impl From<ProcessRenderError> for RenderFailure {
    fn from(error: ProcessRenderError) -> Self {
        RenderFailure::new(error.to_string())
    }
}

/// Loads a [`ProcessCapability`]: resolves the renderer program and prepares
/// the staging directory.
#[derive(Debug, Clone)]
pub struct ProcessCapabilityLoader {
    settings: CapabilitySettings,
}

impl ProcessCapabilityLoader {
    pub fn new(settings: CapabilitySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl CapabilityLoader for ProcessCapabilityLoader {
    async fn load(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        let program = resolve_program(&self.settings.program)?;
        let staging = StagingRoot::prepare(self.settings.staging_dir.as_deref()).await?;

        info!(
            target = "infra::process",
            op = "process::load",
            program = %program.display(),
            staging_dir = %staging.path().display(),
            "Renderer program resolved"
        );

        Ok(Arc::new(ProcessCapability {
            program,
            args: self.settings.args.clone(),
            staging,
        }))
    }
}

#[derive(Debug)]
enum StagingRoot {
    Fixed(PathBuf),
    Temporary(TempDir),
}

impl StagingRoot {
    async fn prepare(dir: Option<&Path>) -> Result<Self, LoadError> {
        match dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|source| LoadError::Staging {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                Ok(Self::Fixed(dir.to_path_buf()))
            }
            None => tempfile::Builder::new()
                .prefix("platelet-worker-")
                .tempdir()
                .map(Self::Temporary)
                .map_err(|source| LoadError::Staging {
                    path: env::temp_dir(),
                    source,
                }),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Fixed(path) => path,
            Self::Temporary(dir) => dir.path(),
        }
    }
}

/// Renders by staging the files map on disk and running the renderer on the
/// root entry.
#[derive(Debug)]
pub struct ProcessCapability {
    program: PathBuf,
    args: Vec<String>,
    staging: StagingRoot,
}

#[async_trait]
impl RenderCapability for ProcessCapability {
    async fn render(
        &self,
        root: &str,
        files: &str,
        json: &serde_json::Value,
    ) -> Result<String, RenderFailure> {
        let started_at = Instant::now();
        match self.run(root, files, json).await {
            Ok(output) => {
                debug!(
                    target = "infra::process",
                    op = "process::render",
                    result = "ok",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    root = %root,
                    output_bytes = output.len(),
                    "Renderer finished"
                );
                Ok(output)
            }
            Err(err) => {
                warn!(
                    target = "infra::process",
                    op = "process::render",
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    root = %root,
                    error_code = err.code(),
                    error = %err,
                    "Renderer failed"
                );
                Err(err.into())
            }
        }
    }
}

impl ProcessCapability {
    async fn run(
        &self,
        root: &str,
        files: &str,
        json: &serde_json::Value,
    ) -> Result<String, ProcessRenderError> {
        let files: BTreeMap<String, String> =
            serde_json::from_str(files).map_err(ProcessRenderError::Files)?;
        if !files.contains_key(root) {
            return Err(ProcessRenderError::MissingRoot(root.to_string()));
        }
        let root_path = checked_relative_path(root)?;

        let workdir = create_workdir(self.staging.path()).await?;
        let rendered = self.render_in(workdir.path(), root_path, &files, json).await;
        remove_workdir(workdir).await;
        rendered
    }

    async fn render_in(
        &self,
        workdir: &Path,
        root_path: &Path,
        files: &BTreeMap<String, String>,
        json: &serde_json::Value,
    ) -> Result<String, ProcessRenderError> {
        stage_files(workdir, files).await?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(root_path)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessRenderError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        let context = context_text(json);
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(context.as_bytes()).await {
                    Ok(()) => {}
                    // The renderer may exit without reading its context.
                    Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(ProcessRenderError::Context)?;
        let output = output.map_err(|source| ProcessRenderError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("renderer exited with {}", output.status)
            } else {
                stderr
            };
            return Err(ProcessRenderError::Renderer(message));
        }

        let mut rendered =
            String::from_utf8(output.stdout).map_err(|_| ProcessRenderError::Output)?;
        if rendered.ends_with('\n') {
            rendered.pop();
        }
        Ok(rendered)
    }
}

async fn create_workdir(staging: &Path) -> Result<TempDir, ProcessRenderError> {
    let staging = staging.to_path_buf();
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix("render-")
            .tempdir_in(staging)
    })
    .await
    .map_err(|err| ProcessRenderError::Stage(io::Error::other(err)))?
    .map_err(ProcessRenderError::Stage)
}

async fn remove_workdir(workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    let removed = tokio::task::spawn_blocking(move || workdir.close())
        .await
        .map_err(io::Error::other)
        .and_then(|closed| closed);
    if let Err(err) = removed {
        warn!(
            target = "infra::process",
            op = "process::cleanup",
            path = %path.display(),
            error = %err,
            "Failed to remove request directory"
        );
    }
}

async fn stage_files(
    workdir: &Path,
    files: &BTreeMap<String, String>,
) -> Result<(), ProcessRenderError> {
    for (path, content) in files {
        let target = workdir.join(checked_relative_path(path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ProcessRenderError::Stage)?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(ProcessRenderError::Stage)?;
    }
    Ok(())
}

fn checked_relative_path(path: &str) -> Result<&Path, ProcessRenderError> {
    let candidate = Path::new(path);
    let inside = candidate
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    let named = candidate
        .components()
        .any(|component| matches!(component, Component::Normal(_)));

    if inside && named {
        Ok(candidate)
    } else {
        Err(ProcessRenderError::UnsafePath(path.to_string()))
    }
}

/// JSON strings are already serialized contexts and pass through verbatim.
fn context_text(json: &serde_json::Value) -> String {
    match json {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn resolve_program(program: &Path) -> Result<PathBuf, LoadError> {
    let not_found = || LoadError::ProgramNotFound {
        program: program.to_path_buf(),
    };

    if program.is_absolute() || program.components().count() > 1 {
        return if program.is_file() {
            Ok(program.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search_path = env::var_os("PATH").ok_or_else(not_found)?;
    env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rejects_paths_leaving_the_tree() {
        for path in ["../escape.html", "/etc/passwd", "a/../../b", "", "."] {
            assert!(
                checked_relative_path(path).is_err(),
                "path `{path}` should be rejected"
            );
        }
        assert!(checked_relative_path("partials/nav.html").is_ok());
        assert!(checked_relative_path("./index.html").is_ok());
    }

    #[test]
    fn string_context_passes_through_verbatim() {
        assert_eq!(context_text(&json!("{\"a\":1}")), "{\"a\":1}");
        assert_eq!(context_text(&json!({ "a": 1 })), "{\"a\":1}");
        assert_eq!(context_text(&serde_json::Value::Null), "null");
    }

    #[tokio::test]
    async fn missing_explicit_program_fails_to_load() {
        let loader = ProcessCapabilityLoader::new(CapabilitySettings {
            program: PathBuf::from("/nonexistent/bin/platelet"),
            ..Default::default()
        });

        let err = match loader.load().await {
            Ok(_) => panic!("program must not resolve"),
            Err(err) => err,
        };
        assert!(matches!(err, LoadError::ProgramNotFound { .. }), "{err}");
    }

    #[cfg(unix)]
    mod unix {
        use std::{fs, os::unix::fs::PermissionsExt};

        use tempfile::TempDir;

        use super::*;

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, body).expect("write script");
            let mut perms = fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("set perms");
            path
        }

        async fn load(
            dir: &TempDir,
            script: &str,
            args: Vec<String>,
        ) -> Arc<dyn RenderCapability> {
            let program = write_script(dir.path(), "fake-platelet", script);
            ProcessCapabilityLoader::new(CapabilitySettings {
                program,
                args,
                staging_dir: Some(dir.path().join("staging")),
            })
            .load()
            .await
            .expect("capability loads")
        }

        fn files(entries: &[(&str, &str)]) -> String {
            let map: BTreeMap<&str, &str> = entries.iter().copied().collect();
            serde_json::to_string(&map).expect("files json")
        }

        #[tokio::test]
        async fn renders_template_with_context_on_stdin() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(
                &dir,
                "#!/bin/sh\nprintf '%s|' \"$1\"\ncat \"$1\"\nprintf '|'\ncat\necho\n",
                Vec::new(),
            )
            .await;

            let output = capability
                .render(
                    "index.html",
                    &files(&[("index.html", "<h1>Hi</h1>")]),
                    &json!({ "a": 1 }),
                )
                .await
                .expect("render succeeds");

            assert_eq!(output, "index.html|<h1>Hi</h1>|{\"a\":1}");
        }

        #[tokio::test]
        async fn stages_nested_files_relative_to_workdir() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(&dir, "#!/bin/sh\ncat partials/nav.html\n", Vec::new()).await;

            let output = capability
                .render(
                    "pages/index.html",
                    &files(&[
                        ("pages/index.html", "<nav></nav>"),
                        ("partials/nav.html", "<ul>nav</ul>"),
                    ]),
                    &json!("{}"),
                )
                .await
                .expect("render succeeds");

            assert_eq!(output, "<ul>nav</ul>");
        }

        #[tokio::test]
        async fn passes_configured_args_before_root() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(
                &dir,
                "#!/bin/sh\necho \"$@\"\n",
                vec!["--strict".to_string()],
            )
            .await;

            let output = capability
                .render("index", &files(&[("index", "")]), &json!("{}"))
                .await
                .expect("render succeeds");

            assert_eq!(output, "--strict index");
        }

        #[tokio::test]
        async fn surfaces_renderer_stderr() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(
                &dir,
                "#!/bin/sh\necho 'FOR LOOP EVALUATION ERROR: Expected array' >&2\nexit 3\n",
                Vec::new(),
            )
            .await;

            let err = capability
                .render("index", &files(&[("index", "x")]), &json!("{}"))
                .await
                .expect_err("renderer fails");

            assert_eq!(err.message(), "FOR LOOP EVALUATION ERROR: Expected array");
        }

        #[tokio::test]
        async fn silent_failure_reports_exit_status() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(&dir, "#!/bin/sh\nexit 7\n", Vec::new()).await;

            let err = capability
                .render("index", &files(&[("index", "x")]), &json!("{}"))
                .await
                .expect_err("renderer fails");

            assert!(err.message().starts_with("renderer exited with"), "{err}");
        }

        #[tokio::test]
        async fn missing_root_fails_before_running_renderer() {
            let dir = TempDir::new().expect("temp dir");
            let marker = dir.path().join("ran");
            let script = format!("#!/bin/sh\ntouch '{}'\n", marker.display());
            let capability = load(&dir, &script, Vec::new()).await;

            let err = capability
                .render("missing", &files(&[]), &json!("{}"))
                .await
                .expect_err("missing root fails");

            assert_eq!(err.message(), "template `missing` not found in files");
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn rejects_files_escaping_the_tree() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(&dir, "#!/bin/sh\ncat \"$1\"\n", Vec::new()).await;

            let err = capability
                .render(
                    "index",
                    &files(&[("index", "x"), ("../escape", "y")]),
                    &json!("{}"),
                )
                .await
                .expect_err("escaping path fails");

            assert!(err.message().contains("../escape"), "{err}");
            assert!(!dir.path().join("staging").join("escape").exists());
        }

        #[tokio::test]
        async fn request_directories_are_removed_after_render() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(&dir, "#!/bin/sh\ncat \"$1\"\n", Vec::new()).await;

            capability
                .render("index", &files(&[("index", "x")]), &json!("{}"))
                .await
                .expect("render succeeds");

            let leftovers = fs::read_dir(dir.path().join("staging"))
                .expect("staging dir exists")
                .count();
            assert_eq!(leftovers, 0);
        }

        #[tokio::test]
        async fn request_directories_are_removed_after_failed_render() {
            let dir = TempDir::new().expect("temp dir");
            let capability = load(&dir, "#!/bin/sh\nexit 1\n", Vec::new()).await;

            capability
                .render("index", &files(&[("index", "x")]), &json!("{}"))
                .await
                .expect_err("renderer fails");

            let leftovers = fs::read_dir(dir.path().join("staging"))
                .expect("staging dir exists")
                .count();
            assert_eq!(leftovers, 0);
        }
    }
}
