use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, anyhow};
use tokio::{process::Command, sync::mpsc};

/// Everything a worker needs to run one invocation, owned so nothing is
/// shared with the scheduler while the job is in flight.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub binary: PathBuf,
    /// Queue key the completion is routed back to.
    pub device: String,
    pub argv: Vec<String>,
    pub serial: Option<String>,
    pub scratch_dir: PathBuf,
    pub output_path: PathBuf,
}

/// Completion record posted to the scheduler's channel.
#[derive(Debug)]
pub struct RunnerResult {
    pub device: String,
    pub output: String,
    pub error: Option<anyhow::Error>,
}

/// Run the external benchmark tool and report back on the channel. The raw
/// log is persisted before the result is posted, so it survives even when
/// the run itself is reported as failed.
pub async fn run(spec: RunnerSpec, tx: mpsc::Sender<RunnerResult>) {
    let device = spec.device.clone();
    let (output, error) = execute(spec).await;
    let _ = tx
        .send(RunnerResult {
            device,
            output,
            error,
        })
        .await;
}

async fn execute(spec: RunnerSpec) -> (String, Option<anyhow::Error>) {
    let mut command = Command::new(&spec.binary);
    command
        .arg(format!(
            "--scratch_output_base={}",
            spec.scratch_dir.display()
        ))
        .args(&spec.argv)
        .stdin(Stdio::null());
    if let Some(serial) = &spec.serial {
        command.env("ANDROID_SERIAL", serial);
    }

    let output = match command.output().await {
        Ok(output) => output,
        Err(err) => {
            let err = anyhow::Error::new(err)
                .context(format!("failed to spawn {}", spec.binary.display()));
            return (String::new(), Some(err));
        }
    };

    // stderr appended after stdout; the parser skips non-table lines.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if let Err(err) = persist(&spec.output_path, &text) {
        return (text, Some(err));
    }

    let error = (!output.status.success())
        .then(|| anyhow!("{} exited with {}", spec.binary.display(), output.status));
    (text, error)
}

fn persist(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .with_context(|| format!("failed to open raw log {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("failed to write raw log {}", path.display()))
}
