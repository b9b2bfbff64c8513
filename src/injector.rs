//! The per-image trust-layer injection pipeline.
//!
//! Each image goes through a fixed sequence: remove the old trust layer,
//! create a scratch volume, write the augmented runtime configuration,
//! run the import container, export the filesystem diff, and commit it
//! back into the image. Every allocation registers a compensation the
//! moment it succeeds; compensations run unconditionally, in reverse
//! order, once the pipeline for that image is done.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::command::{CommandRunner, ToolOutput};
use crate::config::ConfigWriter;
use crate::error::{InjectError, Result};

/// Executable locations for the external tools the pipeline drives.
/// Defaults are the well-known deployment paths; tests and alternative
/// targets substitute their own.
#[derive(Debug, Clone)]
pub struct Tools {
    /// Layer remover / committer.
    pub hydrate: PathBuf,
    /// Volume manager over the driver store.
    pub groot: PathBuf,
    /// Container runner.
    pub winc: PathBuf,
    /// Filesystem diff exporter.
    pub diff_exporter: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            hydrate: PathBuf::from(r"c:\var\vcap\packages\hydrate\hydrate.exe"),
            groot: PathBuf::from(r"c:\var\vcap\packages\groot\groot.exe"),
            winc: PathBuf::from(r"c:\var\vcap\packages\winc\winc.exe"),
            diff_exporter: PathBuf::from(r"c:\var\vcap\packages\diff-exporter\diff-exporter.exe"),
        }
    }
}

/// Cleanup action registered the moment its resource is allocated.
/// A failing compensation is logged and never replaces the pipeline's
/// outcome, and never stops the remaining compensations.
enum Compensation {
    DeleteVolume { container_id: String },
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
}

pub struct Injector {
    runner: Arc<dyn CommandRunner>,
    config: Arc<dyn ConfigWriter>,
    tools: Tools,
    scratch_dir: PathBuf,
}

impl Injector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: Arc<dyn ConfigWriter>,
        tools: Tools,
    ) -> Self {
        Self {
            runner,
            config,
            tools,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Override the scratch location for bundle directories and diff
    /// output files.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Process every image reference in the order given, stopping at the
    /// first failure. Images processed before the failure keep their new
    /// trust layer.
    pub async fn inject_all(
        &self,
        driver_store: &Path,
        image_refs: &[String],
        cert_data: &[u8],
    ) -> Result<()> {
        if image_refs.is_empty() {
            return Err(InjectError::Usage(
                "at least one image reference is required".to_string(),
            ));
        }

        // Nothing to import means nothing to rebuild.
        if cert_data.is_empty() {
            info!("certificate source is empty, nothing to inject");
            return Ok(());
        }

        for image_ref in image_refs {
            info!(image = %image_ref, "injecting trust layer");
            self.inject(driver_store, image_ref, cert_data).await?;
        }
        Ok(())
    }

    /// Run the full pipeline for one image. Whatever the pipeline
    /// allocated is released before this returns, on every path.
    pub async fn inject(
        &self,
        driver_store: &Path,
        image_ref: &str,
        cert_data: &[u8],
    ) -> Result<()> {
        let mut compensations = Vec::new();
        let outcome = self
            .pipeline(driver_store, image_ref, cert_data, &mut compensations)
            .await;
        self.cleanup(driver_store, compensations).await;
        outcome
    }

    async fn pipeline(
        &self,
        driver_store: &Path,
        image_ref: &str,
        cert_data: &[u8],
        compensations: &mut Vec<Compensation>,
    ) -> Result<()> {
        self.run_tool(
            &self.tools.hydrate,
            vec!["remove-layer".into(), "-ociImage".into(), image_ref.into()],
            "hydrate remove-layer",
        )
        .await?;

        let container_id = format!(
            "layer-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let driver_store = driver_store.to_string_lossy().into_owned();

        let created = self
            .run_tool(
                &self.tools.groot,
                vec![
                    "--driver-store".into(),
                    driver_store.clone(),
                    "create".into(),
                    image_ref.into(),
                    container_id.clone(),
                ],
                "groot create",
            )
            .await?;
        compensations.push(Compensation::DeleteVolume {
            container_id: container_id.clone(),
        });

        let bundle_dir = self.scratch_dir.join(&container_id);
        std::fs::create_dir_all(&bundle_dir).map_err(|source| InjectError::Filesystem {
            context: format!("create bundle directory {}", bundle_dir.display()),
            source,
        })?;
        compensations.push(Compensation::RemoveDir(bundle_dir.clone()));

        self.config.write(&bundle_dir, &created.stdout, cert_data)?;

        let bundle = bundle_dir.display().to_string();
        self.run_tool(
            &self.tools.winc,
            vec![
                "run".into(),
                "-b".into(),
                bundle.clone(),
                container_id.clone(),
            ],
            "winc run",
        )
        .await?;

        let diff_output = self
            .scratch_dir
            .join(format!("diff-output{}", Utc::now().timestamp()));
        self.run_tool(
            &self.tools.diff_exporter,
            vec![
                "-outputFile".into(),
                diff_output.display().to_string(),
                "-containerId".into(),
                container_id.clone(),
                "-bundlePath".into(),
                bundle,
            ],
            "diff-exporter",
        )
        .await?;
        compensations.push(Compensation::RemoveFile(diff_output.clone()));

        self.run_tool(
            &self.tools.hydrate,
            vec![
                "add-layer".into(),
                "-ociImage".into(),
                image_ref.into(),
                "-layer".into(),
                diff_output.display().to_string(),
            ],
            "hydrate add-layer",
        )
        .await?;

        Ok(())
    }

    async fn run_tool(
        &self,
        program: &Path,
        args: Vec<String>,
        tool: &str,
    ) -> Result<ToolOutput> {
        match self.runner.run(program, &args).await {
            Ok(output) => Ok(output),
            Err(err) => {
                if let Some(output) = err.output() {
                    error!(
                        tool,
                        stdout = %output.stdout.trim_end(),
                        stderr = %output.stderr.trim_end(),
                        "external tool failed"
                    );
                }
                Err(InjectError::ExternalTool {
                    tool: tool.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Run every registered compensation, newest first. Each failure is
    /// logged and the rest still run.
    async fn cleanup(&self, driver_store: &Path, compensations: Vec<Compensation>) {
        for compensation in compensations.into_iter().rev() {
            match compensation {
                Compensation::DeleteVolume { container_id } => {
                    let args = vec![
                        "--driver-store".into(),
                        driver_store.to_string_lossy().into_owned(),
                        "delete".into(),
                        container_id.clone(),
                    ];
                    if let Err(err) = self.runner.run(&self.tools.groot, &args).await {
                        if let Some(output) = err.output() {
                            warn!(
                                stdout = %output.stdout.trim_end(),
                                stderr = %output.stderr.trim_end(),
                                "groot delete output"
                            );
                        }
                        warn!(container_id = %container_id, error = %err, "groot delete failed");
                    }
                }
                Compensation::RemoveDir(path) => {
                    if let Err(err) = std::fs::remove_dir_all(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %err, "failed to remove bundle directory");
                        }
                    }
                }
                Compensation::RemoveFile(path) => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %err, "failed to remove diff output");
                        }
                    }
                }
            }
        }
    }
}
