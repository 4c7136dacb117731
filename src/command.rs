//! Command type for building executable command lines
//!
//! A [`Command`] is an ordered sequence of argument tokens with a canonical
//! rendered string form. Commands are value objects: every composition
//! operation (sudo prefix, network-namespace wrap, shell wrap) returns a new
//! `Command` and leaves the original untouched, so the same base command can
//! be composed differently per call.

use std::fmt;

use crate::error::{Error, Result};
use crate::params::{ExecutionParams, ShellPolicy, SudoPolicy};

/// Default sudo prefix applied when sudo is requested without an override
pub const DEFAULT_SUDO_COMMAND: &str = "sudo";

/// Default interpreter used when shell wrapping is requested without an override
pub const DEFAULT_SHELL_COMMAND: &str = "/bin/sh -c";

/// A command to be executed
///
/// Invariant: the token sequence is never empty, and the rendered string
/// form re-parses to the same tokens (whitespace-bearing tokens are quoted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program followed by its arguments
    tokens: Vec<String>,
}

impl Command {
    /// Create a new command for the given program
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            tokens: vec![program.into()],
        }
    }

    /// Build a command from an ordered token sequence
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(Error::invalid_command("empty token sequence"));
        }
        Ok(Self { tokens })
    }

    /// Build a command by splitting a line on whitespace
    ///
    /// No quote parsing is performed; use [`Command::from_tokens`] when
    /// arguments contain whitespace.
    pub fn from_line(line: &str) -> Result<Self> {
        Self::from_tokens(line.split_whitespace())
    }

    /// Add an argument, returning the extended command
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.tokens.push(arg.into());
        self
    }

    /// Add multiple arguments, returning the extended command
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(args.into_iter().map(Into::into));
        self
    }

    /// Get the program name
    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    /// Get the full token sequence (program first)
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Render the command to its canonical single-line string form
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Return a new command with the given tokens prepended
    pub fn prepend<I, S>(&self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens: Vec<String> = prefix.into_iter().map(Into::into).collect();
        tokens.extend(self.tokens.iter().cloned());
        Self { tokens }
    }

    /// Return a new command prefixed with sudo
    ///
    /// `sudo_command` overrides the default `sudo` prefix; it is split on
    /// whitespace so callers can pass e.g. `"sudo -E"`.
    pub fn with_sudo(&self, sudo_command: Option<&str>) -> Self {
        let prefix = sudo_command.unwrap_or(DEFAULT_SUDO_COMMAND);
        self.prepend(prefix.split_whitespace())
    }

    /// Return a new command wrapped to run inside a network namespace
    pub fn with_network_namespace(&self, namespace: &str) -> Self {
        self.prepend(["ip", "netns", "exec", namespace])
    }

    /// Return a new command handing the whole rendered line to a shell
    ///
    /// The rendered form of `self` becomes a single argument to the
    /// interpreter, e.g. `/bin/sh -c 'echo hello'`.
    pub fn wrap_shell(&self, shell_command: Option<&str>) -> Self {
        let interpreter = shell_command.unwrap_or(DEFAULT_SHELL_COMMAND);
        let mut tokens: Vec<String> = interpreter.split_whitespace().map(String::from).collect();
        tokens.push(self.render());
        Self { tokens }
    }

    /// Apply the composition flags from the given execution parameters
    ///
    /// The order is fixed: namespace-wrap, then shell-wrap, then sudo-prefix.
    /// A network namespace implies sudo unless sudo is explicitly disabled.
    pub fn compose(&self, params: &ExecutionParams) -> Self {
        let mut command = self.clone();

        if let Some(namespace) = params.network_namespace() {
            command = command.with_network_namespace(namespace);
        }

        match params.shell() {
            ShellPolicy::Unset | ShellPolicy::Disabled => {}
            ShellPolicy::Enabled => command = command.wrap_shell(None),
            ShellPolicy::Command(interpreter) => {
                command = command.wrap_shell(Some(interpreter.as_str()));
            }
        }

        let sudo_implied = params.network_namespace().is_some();
        match params.sudo() {
            SudoPolicy::Enabled => command = command.with_sudo(None),
            SudoPolicy::Command(sudo) => command = command.with_sudo(Some(sudo.as_str())),
            SudoPolicy::Unset if sudo_implied => command = command.with_sudo(None),
            SudoPolicy::Unset | SudoPolicy::Disabled => {}
        }

        command
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&shell_escape(token))?;
        }
        Ok(())
    }
}

/// Escape a token for safe inclusion in a shell command line
pub(crate) fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}".contains(c)) {
        // Use single quotes and escape any single quotes in the string
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ExecutionParams;

    #[test]
    fn test_command_creation() {
        let cmd = Command::new("echo");
        assert_eq!(cmd.program(), "echo");
        assert_eq!(cmd.tokens().len(), 1);
    }

    #[test]
    fn test_command_with_args() {
        let cmd = Command::new("ls").arg("-la").arg("/tmp");

        assert_eq!(cmd.tokens(), &["ls", "-la", "/tmp"]);
        assert_eq!(cmd.render(), "ls -la /tmp");
    }

    #[test]
    fn test_empty_tokens_rejected() {
        let err = Command::from_tokens(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidCommand { .. }));
    }

    #[test]
    fn test_from_line() {
        let cmd = Command::from_line("ping -c 3 10.0.0.1").unwrap();
        assert_eq!(cmd.tokens().len(), 4);
        assert_eq!(cmd.program(), "ping");
    }

    #[test]
    fn test_render_quotes_whitespace() {
        let cmd = Command::new("echo").arg("hello world");
        assert_eq!(cmd.render(), "echo 'hello world'");
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("simple"), "simple");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("with'quote"), "'with'\"'\"'quote'");
        assert_eq!(shell_escape("$variable"), "'$variable'");
        assert_eq!(shell_escape("path/to/file"), "path/to/file");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_prepend_returns_new_command() {
        let cmd = Command::new("echo").arg("hi");
        let wrapped = cmd.prepend(["timeout", "5"]);

        assert_eq!(cmd.render(), "echo hi");
        assert_eq!(wrapped.render(), "timeout 5 echo hi");
    }

    #[test]
    fn test_sudo_default_prefix() {
        let cmd = Command::new("ip").arg("link");
        assert_eq!(cmd.with_sudo(None).render(), "sudo ip link");
    }

    #[test]
    fn test_sudo_override_command() {
        let cmd = Command::new("ip").arg("link");
        assert_eq!(cmd.with_sudo(Some("sudo -E")).render(), "sudo -E ip link");
    }

    #[test]
    fn test_network_namespace_wrap() {
        let cmd = Command::new("ping").arg("10.0.0.1");
        assert_eq!(
            cmd.with_network_namespace("qrouter-1").render(),
            "ip netns exec qrouter-1 ping 10.0.0.1"
        );
    }

    #[test]
    fn test_shell_wrap_single_argument() {
        let cmd = Command::new("echo").arg("hello world");
        let wrapped = cmd.wrap_shell(None);

        assert_eq!(wrapped.tokens().len(), 3);
        assert_eq!(wrapped.tokens()[2], "echo 'hello world'");
    }

    #[test]
    fn test_compose_order_namespace_shell_sudo() {
        let params = ExecutionParams::builder()
            .network_namespace("ns0")
            .shell(true)
            .sudo(true)
            .build()
            .unwrap();
        let cmd = Command::new("echo").arg("hi").compose(&params);

        // namespace-wrap, then shell-wrap, then sudo-prefix
        assert_eq!(
            cmd.render(),
            "sudo /bin/sh -c 'ip netns exec ns0 echo hi'"
        );
    }

    #[test]
    fn test_namespace_implies_sudo() {
        let params = ExecutionParams::builder()
            .network_namespace("ns0")
            .build()
            .unwrap();
        let cmd = Command::new("ping").arg("10.0.0.1").compose(&params);
        assert_eq!(cmd.program(), "sudo");
    }

    #[test]
    fn test_namespace_with_sudo_disabled() {
        let params = ExecutionParams::builder()
            .network_namespace("ns0")
            .sudo(false)
            .build()
            .unwrap();
        let cmd = Command::new("ping").compose(&params);
        assert_eq!(cmd.program(), "ip");
    }

    #[test]
    fn test_sudo_render_begins_with_prefix() {
        let params = ExecutionParams::builder().sudo(true).build().unwrap();
        let base = Command::new("cat").arg("/etc/shadow");
        let composed = base.compose(&params);
        assert_eq!(
            composed.render(),
            format!("sudo {}", base.render())
        );
    }
}
