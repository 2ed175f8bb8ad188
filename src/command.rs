//! Running external programs.
//!
//! Nothing here returns an error: a program that cannot be spawned, or that runs
//! past its time limit, is reported the same way as one that exited non-zero, so
//! checks can turn it into an outcome.
use std::fmt::Display;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use process_control::{ChildExt, Control};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time limits in seconds for programs that are known to be slow or quick.  Keyed
/// by file name, so `/cm/local/apps/cmd/bin/cmsh` matches `cmsh`.
pub static COMMAND_TIMEOUTS: phf::Map<&'static str, u64> = phf::phf_map! {
    "sacct" => 60,
    "sacctmgr" => 15,
    "cmsh" => 20,
    "munge" => 5,
    "unmunge" => 5,
    "scp" => 60,
    "srun" => 120,
};

pub fn timeout_for(program: &str) -> Duration {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    COMMAND_TIMEOUTS
        .get(name)
        .map_or(DEFAULT_TIMEOUT, |&secs| Duration::from_secs(secs))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 if the program never ran, timed out or was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        CommandOutput {
            code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn timed_out(limit: Duration) -> Self {
        CommandOutput::failed(format!("Command timed out after {} seconds", limit.as_secs()))
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Error text to show when the command failed.
    pub fn error_text(&self) -> String {
        let e = self.stderr.trim();
        if e.is_empty() {
            format!("exit code {}", self.code)
        } else {
            e.to_string()
        }
    }
}

pub trait Shell {
    /// Run `program` with `input` on stdin, killing it once `limit` has passed.
    fn execute(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&str>,
        limit: Duration,
    ) -> CommandOutput;

    /// Run with the limit from [`timeout_for`].
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.execute(program, args, None, timeout_for(program))
    }

    fn run_for(&self, limit: Duration, program: &str, args: &[&str]) -> CommandOutput {
        self.execute(program, args, None, limit)
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> CommandOutput {
        self.execute(program, args, Some(input), timeout_for(program))
    }

    fn ssh_connect_timeout(&self) -> u32 {
        5
    }

    fn run_ssh(&self, node: &str, remote: &[&str]) -> CommandOutput {
        let timeout = format!("ConnectTimeout={}", self.ssh_connect_timeout());
        let mut args = vec!["-o", "StrictHostKeyChecking=no", "-o", timeout.as_str(), node];
        args.extend_from_slice(remote);
        self.run("ssh", &args)
    }
}

#[derive(Clone, Copy)]
pub struct DisplayCmd<'a>(pub &'a Command);

impl<'a> Display for DisplayCmd<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get_program().to_string_lossy())?;
        for arg in self.0.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs commands on this machine.
#[derive(Clone, Debug)]
pub struct SystemShell {
    ssh_connect_timeout: u32,
}

impl SystemShell {
    pub fn new(ssh_connect_timeout: u32) -> Self {
        SystemShell {
            ssh_connect_timeout,
        }
    }

    fn spawn_error(program: &str, e: std::io::Error) -> CommandOutput {
        if e.kind() == std::io::ErrorKind::NotFound {
            CommandOutput::failed(format!("Command not found: {}", program))
        } else {
            CommandOutput::failed(e.to_string())
        }
    }

    fn finish(cmd: &Command, started: Instant, out: process_control::Output) -> CommandOutput {
        let code = out
            .status
            .code()
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(-1);
        log::debug!(
            "`{}` exited with {} after {:.2}s",
            DisplayCmd(cmd),
            code,
            started.elapsed().as_secs_f64()
        );
        CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        SystemShell::new(5)
    }
}

impl Shell for SystemShell {
    fn execute(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&str>,
        limit: Duration,
    ) -> CommandOutput {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("running `{}` (limit {}s)", DisplayCmd(&cmd), limit.as_secs());
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return SystemShell::spawn_error(program, e),
        };
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()) {
                log::warn!("failed to write stdin of {}: {}", program, e);
            }
        }
        let waited = child
            .controlled_with_output()
            .time_limit(limit)
            .terminate_for_timeout()
            .wait();
        match waited {
            Ok(Some(out)) => SystemShell::finish(&cmd, started, out),
            Ok(None) => {
                log::warn!("`{}` killed after {}s", DisplayCmd(&cmd), limit.as_secs());
                CommandOutput::timed_out(limit)
            }
            Err(e) => CommandOutput::failed(e.to_string()),
        }
    }

    fn ssh_connect_timeout(&self) -> u32 {
        self.ssh_connect_timeout
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Replays canned outputs keyed by the full command line.  Unknown commands fail
    /// as if the program were missing.
    #[derive(Default)]
    pub struct ScriptedShell {
        responses: HashMap<String, CommandOutput>,
        pub calls: RefCell<Vec<String>>,
        /// Time limit of every call, in call order.
        pub limits: RefCell<Vec<Duration>>,
    }

    impl ScriptedShell {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(mut self, command_line: &str, out: CommandOutput) -> Self {
            self.responses.insert(command_line.to_string(), out);
            self
        }

        pub fn ok(self, command_line: &str, stdout: &str) -> Self {
            self.on(command_line, CommandOutput::ok(stdout))
        }

        pub fn fail(self, command_line: &str, code: i32, stderr: &str) -> Self {
            self.on(
                command_line,
                CommandOutput {
                    code,
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            )
        }
    }

    impl Shell for ScriptedShell {
        fn execute(
            &self,
            program: &str,
            args: &[&str],
            input: Option<&str>,
            limit: Duration,
        ) -> CommandOutput {
            let mut line = program.to_string();
            for a in args {
                line.push(' ');
                line.push_str(a);
            }
            if let Some(input) = input {
                line.push_str(" <<< ");
                line.push_str(input.trim());
            }
            let out = self.responses.get(&line).cloned().unwrap_or_else(|| {
                CommandOutput::failed(format!("Command not found: {}", program))
            });
            self.calls.borrow_mut().push(line);
            self.limits.borrow_mut().push(limit);
            out
        }
    }
}
