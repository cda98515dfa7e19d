use crate::cluster::Node;
use crate::config::{KubestrapConfig, SshConfig};
use crate::error::ClusterError;
use crate::utils::passphrase::{AskpassScript, PassphraseCache, SshKeygen, TerminalPrompt};
use crate::utils::retry::{RetryPolicy, retry_with_backoff};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// OpenSSH reserves this exit status for its own connection errors
const SSH_TRANSPORT_ERROR: i32 = 255;

/// Text rewrite applied while a file travels between nodes
pub type Transform = dyn Fn(&str) -> Result<String> + Send + Sync;

/// Remote execution and file transfer on a single node
#[async_trait]
pub trait NodeCommunicator: Send + Sync {
    /// Run `command` and return its stdout. Non-zero exit is an error carrying stderr.
    async fn run_cmd(&self, node: &Node, command: &str) -> Result<String>;

    async fn read_file(&self, node: &Node, path: &str) -> Result<Vec<u8>>;

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        content: &[u8],
        executable: bool,
    ) -> Result<()>;

    async fn copy_file_over_node(&self, source: &Node, target: &Node, path: &str) -> Result<()> {
        let content = self
            .read_file(source, path)
            .await
            .with_context(|| format!("Failed to read {} from {}", path, source.name))?;
        self.write_file(target, path, &content, false)
            .await
            .with_context(|| format!("Failed to write {} to {}", path, target.name))
    }

    async fn transform_file_over_node(
        &self,
        source: &Node,
        target: &Node,
        path: &str,
        transform: &Transform,
    ) -> Result<()> {
        let raw = self
            .read_file(source, path)
            .await
            .with_context(|| format!("Failed to read {} from {}", path, source.name))?;
        let text = String::from_utf8(raw)
            .with_context(|| format!("{} on {} is not valid UTF-8", path, source.name))?;
        let rewritten = transform(&text)
            .with_context(|| format!("Failed to rewrite {} from {}", path, source.name))?;
        self.write_file(target, path, rewritten.as_bytes(), false)
            .await
            .with_context(|| format!("Failed to write {} to {}", path, target.name))
    }

    /// Prompt for and verify the passphrase of the named key, if it is encrypted
    async fn capture_passphrase(&self, key_name: &str) -> Result<()>;
}

/// [`NodeCommunicator`] backed by the system OpenSSH client
pub struct SshCommunicator {
    ssh: SshConfig,
    dial: RetryPolicy,
    askpass: Arc<AskpassScript>,
    passphrases: Arc<PassphraseCache>,
}

impl SshCommunicator {
    pub fn new(config: &KubestrapConfig) -> Result<Self> {
        let askpass = Arc::new(AskpassScript::create()?);
        let passphrases = Arc::new(PassphraseCache::new(
            Arc::new(TerminalPrompt),
            Arc::new(SshKeygen::new(askpass.clone())),
        ));

        Ok(Self {
            ssh: config.ssh.clone(),
            dial: config.retry.dial.clone(),
            askpass,
            passphrases,
        })
    }

    /// Share a passphrase cache, e.g. one with a non-interactive prompt
    pub fn with_passphrase_cache(mut self, passphrases: Arc<PassphraseCache>) -> Self {
        self.passphrases = passphrases;
        self
    }

    pub fn passphrases(&self) -> &Arc<PassphraseCache> {
        &self.passphrases
    }

    fn build_ssh_args(&self, node: &Node, key: &Path, interactive_key: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout_secs),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
        ];

        // BatchMode would also suppress the askpass passphrase query
        if !interactive_key {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }

        args.extend([
            "-i".to_string(),
            key.display().to_string(),
            "-p".to_string(),
            self.ssh.port.to_string(),
            format!("{}@{}", self.ssh.user, node.ip_address),
        ]);
        args
    }

    async fn spawn_once(
        &self,
        args: &[String],
        passphrase: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<Output> {
        let mut cmd = Command::new(&self.ssh.program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(secret) = passphrase {
            self.askpass.apply(&mut cmd, secret);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.ssh.program.display()))?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(content)
                .await
                .context("Failed to stream content to ssh")?;
            pipe.shutdown().await.context("Failed to close ssh stdin")?;
        }

        child
            .wait_with_output()
            .await
            .context("Failed to wait for ssh")
    }

    /// Execute `remote_command`, retrying only transport failures
    async fn exec(&self, node: &Node, remote_command: &str, stdin: Option<&[u8]>) -> Result<Output> {
        let key = self.ssh.key(&node.ssh_key_name)?;
        let passphrase = self
            .passphrases
            .passphrase_for(&key.private_key_path)
            .await?;

        let mut args = self.build_ssh_args(node, &key.private_key_path, passphrase.is_some());
        args.push(remote_command.to_string());

        debug!(node = %node.name, command = %remote_command, "running remote command");

        let this = self;
        let args = &args;
        let secret = passphrase.as_deref();
        let operation = format!("ssh {}", node.name);
        retry_with_backoff(&self.dial, &operation, move || async move {
            let output = this.spawn_once(args, secret, stdin).await?;
            // A remote command exiting 255 is indistinguishable from a dial failure
            if output.status.code() == Some(SSH_TRANSPORT_ERROR) {
                return Err(anyhow!(
                    "{}",
                    String::from_utf8_lossy(&output.stderr).trim().to_string()
                ));
            }
            Ok(output)
        })
        .await
        .map_err(|e| {
            ClusterError::Unreachable {
                node: node.name.clone(),
                attempts: self.dial.max_attempts.max(1),
                stderr: e.to_string(),
            }
            .into()
        })
    }

    async fn exec_checked(
        &self,
        node: &Node,
        remote_command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let output = self.exec(node, remote_command, stdin).await?;
        if !output.status.success() {
            return Err(ClusterError::command_failed(
                &node.name,
                remote_command,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            )
            .into());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl NodeCommunicator for SshCommunicator {
    async fn run_cmd(&self, node: &Node, command: &str) -> Result<String> {
        let stdout = self.exec_checked(node, command, None).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn read_file(&self, node: &Node, path: &str) -> Result<Vec<u8>> {
        self.exec_checked(node, &format!("cat {}", shell_escape(path)), None)
            .await
    }

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        content: &[u8],
        executable: bool,
    ) -> Result<()> {
        self.exec_checked(node, &write_command(path, executable), Some(content))
            .await
            .map(|_| ())
    }

    async fn capture_passphrase(&self, key_name: &str) -> Result<()> {
        let key = self.ssh.key(key_name)?;
        self.passphrases
            .capture(&key.private_key_path)
            .await
            .with_context(|| format!("Failed to capture passphrase for key '{}'", key_name))
            .map(|_| ())
    }
}

/// Remote shell command that stores stdin at `path`
fn write_command(path: &str, executable: bool) -> String {
    let mode = if executable { "0755" } else { "0644" };
    let target = shell_escape(path);
    match Path::new(path).parent().and_then(Path::to_str) {
        Some(parent) if !parent.is_empty() => format!(
            "mkdir -p {} && cat > {} && chmod {} {}",
            shell_escape(parent),
            target,
            mode,
            target
        ),
        _ => format!("cat > {} && chmod {} {}", target, mode, target),
    }
}

/// Escape a string for safe use in shell commands
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':' | '=' | ',' | '@' | '+')
    }) {
        return s.to_string();
    }

    // End the quote, add an escaped quote, reopen
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}
