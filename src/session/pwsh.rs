//! PowerShell remoting connector
//!
//! Each channel is one long-lived `pwsh` process that opens a `New-PSSession`
//! to the management host and then serves commands over its stdio:
//!
//! ```text
//! gateway ──{"id":1,"script":"...","args":[...]}\n──► pwsh (stdin)
//!                                                      │ Invoke-Command -Session
//! gateway ◄──{"id":1,"records":[...],...}\n────────────┘ (stdout)
//! ```
//!
//! Credentials are handed to the child through its environment so they never
//! show up in the process list.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::connector::{Channel, CommandResult, ConnectError, Connector, InvokeError, PropertyBag};

/// How long `close` waits for the child to exit before killing it
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Driver run inside each `pwsh` child
const DRIVER_SCRIPT: &str = r##"
$ErrorActionPreference = 'Stop'
function Send-Reply($reply) {
    [Console]::Out.WriteLine(($reply | ConvertTo-Json -Compress -Depth 5))
    [Console]::Out.Flush()
}
try {
    $params = @{ ComputerName = $env:SCVMM_GW_HOST }
    if ($env:SCVMM_GW_PORT) { $params.Port = [int]$env:SCVMM_GW_PORT }
    if ($env:SCVMM_GW_SSL -eq '1') { $params.UseSSL = $true }
    if ($env:SCVMM_GW_AUTH) { $params.Authentication = $env:SCVMM_GW_AUTH }
    if ($env:SCVMM_GW_USER) {
        $secret = if ($env:SCVMM_GW_PASSWORD) {
            ConvertTo-SecureString -String $env:SCVMM_GW_PASSWORD -AsPlainText -Force
        } else {
            [securestring]::new()
        }
        $params.Credential = [pscredential]::new($env:SCVMM_GW_USER, $secret)
    }
    $session = New-PSSession @params
} catch {
    Send-Reply @{ ready = $false; error = "$_" }
    exit 1
}
Send-Reply @{ ready = $true }
while ($null -ne ($line = [Console]::In.ReadLine())) {
    $request = $line | ConvertFrom-Json
    $records = [System.Collections.Generic.List[object]]::new()
    $errors = [System.Collections.Generic.List[string]]::new()
    try {
        $block = [scriptblock]::Create($request.script)
        $output = Invoke-Command -Session $session -ScriptBlock $block -ArgumentList @($request.args) -ErrorAction SilentlyContinue -ErrorVariable remoteErrors
        foreach ($item in $output) {
            $bag = @{}
            foreach ($property in $item.PSObject.Properties) {
                if ($null -ne $property.Value) { $bag[$property.Name] = "$($property.Value)" }
            }
            $records.Add($bag)
        }
        foreach ($remoteError in $remoteErrors) { $errors.Add("$remoteError") }
    } catch {
        $errors.Add("$_")
    }
    Send-Reply @{
        id = $request.id
        records = $records.ToArray()
        had_errors = ($errors.Count -gt 0)
        errors = $errors.ToArray()
        broken = ($session.State -ne 'Opened')
    }
}
Remove-PSSession -Session $session -ErrorAction SilentlyContinue
"##;

/// Connection options for PowerShell remoting
#[derive(Debug, Clone, PartialEq)]
pub struct PwshOptions {
    /// PowerShell executable (e.g., "pwsh")
    pub program: String,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub use_ssl: bool,
    /// Value for `-Authentication` (e.g., "Negotiate", "Kerberos")
    pub authentication: Option<String>,
    pub connect_timeout: Duration,
}

impl PwshOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            program: "pwsh".to_string(),
            host: host.into(),
            username: None,
            password: None,
            port: None,
            use_ssl: false,
            authentication: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens sessions by spawning `pwsh` children
pub struct PwshConnector {
    options: PwshOptions,
    endpoint: String,
}

impl PwshConnector {
    pub fn new(options: PwshOptions) -> Self {
        let endpoint = match options.port {
            Some(port) => format!("{}:{}", options.host, port),
            None => options.host.clone(),
        };
        Self { options, endpoint }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.options.program);
        command
            .args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", DRIVER_SCRIPT])
            .env("SCVMM_GW_HOST", &self.options.host)
            .env("SCVMM_GW_SSL", if self.options.use_ssl { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(port) = self.options.port {
            command.env("SCVMM_GW_PORT", port.to_string());
        }
        if let Some(auth) = &self.options.authentication {
            command.env("SCVMM_GW_AUTH", auth);
        }
        if let Some(username) = &self.options.username {
            command.env("SCVMM_GW_USER", username);
        }
        if let Some(password) = &self.options.password {
            command.env("SCVMM_GW_PASSWORD", password);
        }
        command
    }

    fn unreachable(&self, reason: impl Into<String>) -> ConnectError {
        ConnectError::Unreachable {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Ready {
    ready: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    script: &'a str,
    args: &'a [String],
}

/// ConvertTo-Json collapses single-element arrays in some positions
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    #[serde(default)]
    records: OneOrMany<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    had_errors: bool,
    #[serde(default)]
    errors: OneOrMany<String>,
    #[serde(default)]
    broken: bool,
}

/// Flatten a JSON record into strings; nulls are treated as absent
fn into_bag(record: HashMap<String, serde_json::Value>) -> PropertyBag {
    record
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect()
}

async fn forward_stderr(endpoint: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(endpoint = %endpoint, "pwsh: {}", line);
    }
}

#[async_trait]
impl Connector for PwshConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError> {
        let mut child = self.command().spawn().map_err(|e| {
            ConnectError::Client(format!("cannot start {}: {}", self.options.program, e))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ConnectError::Client("remoting client stdio unavailable".to_string()));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.endpoint.clone(), stderr));
        }

        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        let timeout = self.options.connect_timeout;

        match tokio::time::timeout(timeout, stdout.read_line(&mut line)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    endpoint: self.endpoint.clone(),
                    timeout,
                })
            }
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
            Ok(Ok(0)) => {
                return Err(self.unreachable("remoting client exited before the session opened"))
            }
            Ok(Ok(_)) => {}
        }

        let ready: Ready = serde_json::from_str(line.trim())
            .map_err(|e| ConnectError::Client(format!("unexpected handshake line: {e}")))?;
        if !ready.ready {
            let reason = ready.error.unwrap_or_else(|| "session refused".to_string());
            return Err(self.unreachable(reason));
        }

        Ok(Box::new(PwshChannel {
            child,
            stdin: Some(stdin),
            stdout,
            next_id: 0,
            healthy: true,
        }))
    }
}

/// One `pwsh` child holding an open PSSession
struct PwshChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    healthy: bool,
}

impl PwshChannel {
    fn lost(&mut self, reason: impl Into<String>) -> InvokeError {
        self.healthy = false;
        InvokeError::Connection(reason.into())
    }
}

#[async_trait]
impl Channel for PwshChannel {
    async fn invoke(
        &mut self,
        script: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, InvokeError> {
        if !self.healthy {
            return Err(InvokeError::Connection("channel out of sync".to_string()));
        }

        self.next_id += 1;
        let id = self.next_id;
        let mut payload = serde_json::to_string(&Request { id, script, args })
            .map_err(|e| InvokeError::Fault(format!("cannot encode request: {e}")))?;
        payload.push('\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.lost("remoting client stdin closed"));
        };
        let written = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            return Err(self.lost(format!("write failed: {e}")));
        }

        let mut line = String::new();
        match tokio::time::timeout(timeout, self.stdout.read_line(&mut line)).await {
            Err(_) => {
                // A late reply would be read as the answer to the next request.
                self.healthy = false;
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(error = %e, "Failed to kill timed out remoting client");
                }
                return Err(InvokeError::Timeout(timeout));
            }
            Ok(Err(e)) => return Err(self.lost(format!("read failed: {e}"))),
            Ok(Ok(0)) => return Err(self.lost("remoting client exited")),
            Ok(Ok(_)) => {}
        }

        let reply: Reply = match serde_json::from_str(line.trim()) {
            Ok(reply) => reply,
            Err(e) => return Err(self.lost(format!("malformed reply: {e}"))),
        };
        if reply.id != id {
            return Err(self.lost(format!("reply {} does not match request {}", reply.id, id)));
        }

        let errors = reply.errors.into_vec();
        if reply.broken {
            return Err(self.lost(if errors.is_empty() {
                "remote session is no longer open".to_string()
            } else {
                errors.join("; ")
            }));
        }

        Ok(CommandResult {
            records: reply.records.into_vec().into_iter().map(into_bag).collect(),
            had_errors: reply.had_errors || !errors.is_empty(),
            errors,
        })
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        self.healthy = false;
        // EOF on stdin ends the driver loop, which removes the PSSession.
        drop(self.stdin.take());

        match tokio::time::timeout(CLOSE_GRACE, self.child.wait()).await {
            Ok(status) => {
                status?;
                Ok(())
            }
            Err(_) => {
                self.child.kill().await?;
                Ok(())
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_with_single_record_object() {
        let reply: Reply = serde_json::from_str(
            r#"{"id":3,"records":{"Name":"web-01","VMId":"6f1c0e2a-3b4d-4e5f-8a9b-0c1d2e3f4a5b"},"had_errors":false,"errors":[],"broken":false}"#,
        )
        .unwrap();
        assert_eq!(reply.id, 3);
        let records = reply.records.into_vec();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["Name"], "web-01");
    }

    #[test]
    fn test_reply_defaults() {
        let reply: Reply = serde_json::from_str(r#"{"id":1}"#).unwrap();
        assert!(reply.records.into_vec().is_empty());
        assert!(reply.errors.into_vec().is_empty());
        assert!(!reply.had_errors);
        assert!(!reply.broken);
    }

    #[test]
    fn test_into_bag_stringifies_scalars() {
        let record: HashMap<String, serde_json::Value> = serde_json::from_str(
            r#"{"Name":"db-02","CPUCount":4,"IsHighlyAvailable":true,"VMHost":null}"#,
        )
        .unwrap();
        let bag = into_bag(record);
        assert_eq!(bag["Name"], "db-02");
        assert_eq!(bag["CPUCount"], "4");
        assert_eq!(bag["IsHighlyAvailable"], "true");
        assert!(!bag.contains_key("VMHost"));
    }

    #[test]
    fn test_endpoint_includes_port() {
        let mut options = PwshOptions::new("scvmm.corp.local");
        assert_eq!(PwshConnector::new(options.clone()).endpoint(), "scvmm.corp.local");
        options.port = Some(5986);
        assert_eq!(PwshConnector::new(options).endpoint(), "scvmm.corp.local:5986");
    }

    /// Connect through a "pwsh" that is a shell script ignoring its arguments
    #[cfg(unix)]
    async fn connect_scripted(body: &str) -> Result<Box<dyn Channel>, ConnectError> {
        use std::os::unix::fs::PermissionsExt;

        // exec fails with ETXTBSY if a concurrent fork still holds the script open
        static SPAWN: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
        let _spawning = SPAWN.lock().await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwsh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut options = PwshOptions::new("scvmm.corp.local");
        options.program = path.to_string_lossy().into_owned();
        options.connect_timeout = Duration::from_secs(5);
        PwshConnector::new(options).connect().await
    }

    #[cfg(unix)]
    const READY: &str = r#"echo '{"ready":true}'"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_objects_and_partial_output() {
        let reply = r#"echo '{"id":1,"records":{"Name":"web-01"},"had_errors":true,"errors":"hv-node-07 is not responding"}'"#;
        let body = format!("{READY}\nread line\n{reply}\nread line");
        let mut channel = connect_scripted(&body).await.unwrap();

        let result = channel
            .invoke("Get-SCVirtualMachine", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0]["Name"], "web-01");
        assert!(result.had_errors);
        assert_eq!(result.errors, ["hv-node-07 is not responding"]);
        assert!(channel.is_healthy());
        channel.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_client() {
        let body = format!("{READY}\nread line\nsleep 5");
        let mut channel = connect_scripted(&body).await.unwrap();

        let result = channel
            .invoke("Start-SCVirtualMachine", &[], Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(InvokeError::Timeout(_))));
        assert!(!channel.is_healthy());

        let next = channel.invoke("Get-SCVirtualMachine", &[], Duration::from_secs(1)).await;
        assert!(matches!(next, Err(InvokeError::Connection(_))));

        tokio::time::timeout(Duration::from_secs(2), channel.close())
            .await
            .expect("killed client should exit promptly")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_out_of_sync_replies_lose_the_channel() {
        let replies = [
            r#"echo '{"id":99,"records":[]}'"#,
            r#"echo 'Get-SCVirtualMachine : not json'"#,
            "exit 0",
        ];

        for reply in replies {
            let body = format!("{READY}\nread line\n{reply}\nread line");
            let mut channel = connect_scripted(&body).await.unwrap();

            let result = channel
                .invoke("Get-SCVirtualMachine", &[], Duration::from_secs(5))
                .await;
            assert!(matches!(result, Err(InvokeError::Connection(_))), "{reply}");
            assert!(!channel.is_healthy(), "{reply}");
            channel.close().await.unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_reply_carries_remote_errors() {
        let reply = r#"echo '{"id":1,"broken":true,"errors":["WinRM shell closed"]}'"#;
        let body = format!("{READY}\nread line\n{reply}\nread line");
        let mut channel = connect_scripted(&body).await.unwrap();

        match channel.invoke("Get-SCVirtualMachine", &[], Duration::from_secs(5)).await {
            Err(InvokeError::Connection(reason)) => assert_eq!(reason, "WinRM shell closed"),
            other => panic!("expected a connection error, got {other:?}"),
        }
        channel.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_failures_are_unreachable() {
        let refused = r#"echo '{"ready":false,"error":"Access is denied"}'"#;
        for body in [refused, "exit 1"] {
            let err = connect_scripted(body).await.err().unwrap();
            assert!(matches!(err, ConnectError::Unreachable { .. }), "{body}");
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_connect_error() {
        let mut options = PwshOptions::new("scvmm.corp.local");
        options.program = "/nonexistent/pwsh".to_string();

        let err = PwshConnector::new(options).connect().await.err().unwrap();
        assert!(matches!(err, ConnectError::Client(_)));
    }
}
