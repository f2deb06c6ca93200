//! Command execution inside the database container

use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to read {stream}: {source}")]
    Io {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("No {0} stream attached")]
    MissingStream(&'static str),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// Output of one command
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub message: Option<String>,
}

impl ExecOutput {
    /// stdout and stderr joined, for log upload
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs commands in one container of one pod
#[derive(Clone)]
pub struct PodExec {
    api: Api<Pod>,
    pod: String,
    container: String,
}

impl PodExec {
    pub fn new(client: Client, namespace: &str, pod: &str, container: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            pod: pod.to_string(),
            container: container.to_string(),
        }
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Run a command and collect its output, whatever its exit status
    pub async fn run(&self, command: &[String]) -> Result<ExecOutput, ExecError> {
        let attach_params = AttachParams {
            container: Some(self.container.clone()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        trace!(pod = %self.pod, command = ?command, "Executing command");
        let mut attached = self
            .api
            .exec(&self.pod, command.to_vec(), &attach_params)
            .await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or(ExecError::MissingStream("stdout"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or(ExecError::MissingStream("stderr"))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_result, err_result) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr)
        );
        out_result.map_err(|source| ExecError::Io {
            stream: "stdout",
            source,
        })?;
        err_result.map_err(|source| ExecError::Io {
            stream: "stderr",
            source,
        })?;

        let mut output = ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
            success: true,
            message: None,
        };

        if let Some(status_channel) = attached.take_status()
            && let Some(status) = status_channel.await
        {
            output.success = status.status.as_deref() != Some("Failure");
            output.message = status.message;
        }

        if !output.success {
            debug!(
                pod = %self.pod,
                command = ?command,
                message = ?output.message,
                "Command exited with non-success status"
            );
        }
        Ok(output)
    }

    /// Run a command and fail unless it exits successfully
    pub async fn run_checked(&self, command: &[String]) -> Result<ExecOutput, ExecError> {
        let output = self.run(command).await?;
        if output.success {
            Ok(output)
        } else {
            let message = if output.stderr.is_empty() {
                output.message.clone().unwrap_or_else(|| "unknown error".to_string())
            } else {
                output.stderr.clone()
            };
            Err(ExecError::CommandFailed {
                command: command.join(" "),
                message,
            })
        }
    }
}

/// Wrap a shell command line so it runs as the database user
pub fn as_postgres(command_line: &str) -> Vec<String> {
    vec![
        "su".to_string(),
        "postgres".to_string(),
        "-c".to_string(),
        command_line.to_string(),
    ]
}

/// Wrap a shell command line for `sh -c`
pub fn shell(command_line: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command_line.to_string()]
}

/// Shell snippet writing `content` to `path` through a quoted heredoc
pub fn write_file_command(path: &str, content: &str) -> String {
    format!("cat > {} <<'EOF'\n{}\nEOF", path, content.trim_end())
}
