use crate::observer::Observer;
use log::{debug, error, warn};
use std::any::Any;
use std::io::{self, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::ptr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Crash(String),
    ObserverError(String),
    Other(String),
}

pub trait Executor {
    fn execute_sync(&mut self, input: &[u8], observers: &mut [&mut dyn Observer])
    -> ExecutionStatus;
}

fn run_pre_exec(observers: &mut [&mut dyn Observer]) -> Result<(), ExecutionStatus> {
    for obs in observers.iter_mut() {
        if let Err(e) = obs.pre_exec() {
            let error_msg = format!("Observer '{}' pre_exec failed: {e:#}", obs.name());
            error!("{error_msg}");
            return Err(ExecutionStatus::ObserverError(error_msg));
        }
    }
    Ok(())
}

fn attach_observers(
    observers: &mut [&mut dyn Observer],
    pid: libc::pid_t,
) -> Result<(), ExecutionStatus> {
    for obs in observers.iter_mut() {
        if let Err(e) = obs.on_target(pid) {
            let error_msg = format!("Observer '{}' on_target failed: {e:#}", obs.name());
            error!("{error_msg}");
            return Err(ExecutionStatus::ObserverError(error_msg));
        }
    }
    Ok(())
}

/// Runs every observer's `post_exec`. The first observer failure replaces an
/// `Ok` status; crashes, timeouts and earlier errors are kept as they are.
fn run_post_exec(
    observers: &mut [&mut dyn Observer],
    status: ExecutionStatus,
    target_output: Option<&dyn Any>,
) -> ExecutionStatus {
    let mut post_exec_error: Option<String> = None;
    for obs in observers.iter_mut() {
        if let Err(e) = obs.post_exec(&status, target_output) {
            let error_msg = format!("Observer '{}' post_exec failed: {e:#}", obs.name());
            error!("{error_msg}");
            post_exec_error.get_or_insert(error_msg);
        }
    }
    match (status, post_exec_error) {
        (ExecutionStatus::Ok, Some(msg)) => ExecutionStatus::ObserverError(msg),
        (status, _) => status,
    }
}

/// Runs a harness closure on the calling thread. Observers are attached to the
/// calling thread (pid 0) right before the harness runs.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8]),
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8]),
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8]),
{
    fn execute_sync(
        &mut self,
        input: &[u8],
        observers: &mut [&mut dyn Observer],
    ) -> ExecutionStatus {
        if let Err(status) = run_pre_exec(observers) {
            return status;
        }
        if let Err(status) = attach_observers(observers, 0) {
            return run_post_exec(observers, status, None);
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(input);
        }));

        let execution_status = match result {
            Ok(_) => ExecutionStatus::Ok,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                ExecutionStatus::Crash(msg)
            }
        };

        run_post_exec(observers, execution_status, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Write the input to a temp file and substitute its path for `{}` in this template.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Runs an external command per input.
///
/// The child asks to be traced before `exec`, so it stops on the first instruction
/// of the new image. Observers are attached to its pid while it is stopped, then
/// the executor detaches and the target runs untraced.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

fn trace_me() -> io::Result<()> {
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_TRACEME,
            0,
            ptr::null_mut::<libc::c_void>(),
            ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A traced child stops with `SIGTRAP` once `execve` has succeeded.
fn wait_for_exec_stop(pid: libc::pid_t) -> Result<(), String> {
    let mut wstatus: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut wstatus, 0) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(format!("waitpid({pid}) failed: {err}"));
        }
        break;
    }
    if libc::WIFSTOPPED(wstatus) && libc::WSTOPSIG(wstatus) == libc::SIGTRAP {
        Ok(())
    } else {
        Err(format!(
            "Child {pid} did not stop after exec (wait status {wstatus:#x})"
        ))
    }
}

/// Detaches from the stopped child, letting it run.
fn resume(pid: libc::pid_t) -> io::Result<()> {
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_DETACH,
            pid,
            ptr::null_mut::<libc::c_void>(),
            ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn describe_failure(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("Exited with code {code}")
    } else if let Some(signal) = status.signal() {
        format!("Terminated by signal {signal}")
    } else {
        "Exited abnormally".to_string()
    }
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        warn!("Target timed out after {timeout:?}, killing...");
                        if let Err(e) = child.kill() {
                            error!("Failed to kill child process: {e}");
                            return Err(ExecutionStatus::Other(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    error!("Error waiting for child process: {e}");
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}",
                    )));
                }
            }
        }
    }

    fn build_command(
        &self,
        input: &[u8],
    ) -> Result<(Command, Option<tempfile::NamedTempFile>), ExecutionStatus> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| ExecutionStatus::Other("Empty target command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        // SAFETY: ptrace(2) is async-signal-safe and nothing else runs in the hook.
        unsafe {
            cmd.pre_exec(trace_me);
        }

        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
                Ok((cmd, None))
            }
            InputDelivery::File(arg_template) => {
                let mut temp = tempfile::NamedTempFile::new().map_err(|e| {
                    ExecutionStatus::Other(format!("Failed to create temp file: {e}"))
                })?;
                temp.write_all(input)
                    .and_then(|_| temp.flush())
                    .map_err(|e| {
                        ExecutionStatus::Other(format!(
                            "Failed to write to temp file {:?}: {e}",
                            temp.path()
                        ))
                    })?;
                let path_str = temp.path().to_str().ok_or_else(|| {
                    ExecutionStatus::Other("Temp file path is not valid UTF-8".to_string())
                })?;
                let final_arg = arg_template.replace("{}", path_str);
                cmd.args(final_arg.split_whitespace());
                cmd.stdin(Stdio::null());
                Ok((cmd, Some(temp)))
            }
        }
    }
}

impl Executor for CommandExecutor {
    fn execute_sync(
        &mut self,
        input: &[u8],
        observers: &mut [&mut dyn Observer],
    ) -> ExecutionStatus {
        if let Err(status) = run_pre_exec(observers) {
            return status;
        }

        // Keeps the input file alive until the child is done with it.
        let (mut cmd, _input_file) = match self.build_command(input) {
            Ok(built) => built,
            Err(status) => return run_post_exec(observers, status, None),
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn command '{:?}': {e}", self.config.command);
                error!("{error_msg}");
                return run_post_exec(observers, ExecutionStatus::Other(error_msg), None);
            }
        };
        let pid = child.id() as libc::pid_t;
        debug!("Spawned target pid {pid}");

        let attached = wait_for_exec_stop(pid)
            .map_err(ExecutionStatus::Other)
            .and_then(|_| attach_observers(observers, pid));
        if let Err(status) = attached {
            let _ = child.kill();
            let _ = child.wait();
            return run_post_exec(observers, status, None);
        }

        if let Err(err) = resume(pid) {
            let _ = child.kill();
            let _ = child.wait();
            return run_post_exec(
                observers,
                ExecutionStatus::Other(format!("Failed to resume target {pid}: {err}")),
                None,
            );
        }

        if let Some(mut child_stdin) = child.stdin.take() {
            // A target that exits without reading its input closes the pipe early.
            if let Err(e) = child_stdin.write_all(input) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    warn!("Error writing to child stdin: {e}");
                }
            }
        }

        let final_status = match self.run_and_wait_with_timeout(&mut child, self.config.timeout) {
            Ok(status) => {
                let output = ProcessOutput {
                    exit_code: status.code(),
                    signal: status.signal(),
                };
                let exec_status = if status.success() {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::Crash(describe_failure(status))
                };
                return run_post_exec(observers, exec_status, Some(&output as &dyn Any));
            }
            Err(status) => status,
        };
        run_post_exec(observers, final_status, None)
    }
}


#[cfg(test)]
mod command_executor_tests {
    use super::*;
    use crate::observer::NoOpObserver;

    fn shell(script: &str, input_delivery: InputDelivery, timeout: Duration) -> CommandExecutor {
        CommandExecutor::new(CommandExecutorConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            input_delivery,
            timeout,
            working_dir: None,
        })
    }

    struct PidObserver(Option<libc::pid_t>);

    impl Observer for PidObserver {
        fn name(&self) -> &'static str {
            "PidObserver"
        }
        fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn on_target(&mut self, pid: libc::pid_t) -> Result<(), anyhow::Error> {
            self.0 = Some(pid);
            Ok(())
        }
        fn post_exec(
            &mut self,
            _status: &ExecutionStatus,
            _target_output: Option<&dyn Any>,
        ) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn reset(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn serialize_data(&self) -> Option<Vec<u8>> {
            None
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn cmd_exec_successful_run_stdin() {
        let mut executor = shell(
            "read line; [ \"$line\" = hello ]",
            InputDelivery::StdIn,
            Duration::from_secs(5),
        );
        let mut observer = NoOpObserver;
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];
        let status = executor.execute_sync(b"hello\n", &mut observers);
        assert_eq!(status, ExecutionStatus::Ok);
    }

    #[test]
    fn cmd_exec_attaches_observers_to_child_pid() {
        let mut executor = shell("exit 0", InputDelivery::StdIn, Duration::from_secs(5));
        let mut observer = PidObserver(None);
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];
        executor.execute_sync(&[], &mut observers);
        let pid = observer.0.expect("observer should see the child pid");
        assert!(pid > 0 && pid as u32 != std::process::id());
    }

    #[test]
    fn cmd_exec_crash_detection() {
        let mut executor = shell("kill -SEGV $$", InputDelivery::StdIn, Duration::from_secs(5));
        let mut observer = NoOpObserver;
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];
        let status = executor.execute_sync(&[], &mut observers);
        match status {
            ExecutionStatus::Crash(desc) => {
                assert!(desc.contains("signal 11"), "Unexpected crash desc: {desc}")
            }
            _ => panic!("Expected Crash status, got {status:?}"),
        }
    }

    #[test]
    fn cmd_exec_timeout() {
        let mut executor = shell("sleep 5", InputDelivery::StdIn, Duration::from_millis(100));
        let mut observer = NoOpObserver;
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];
        let status = executor.execute_sync(&[], &mut observers);
        assert_eq!(status, ExecutionStatus::Timeout);
    }

    #[test]
    fn cmd_exec_input_via_file() {
        let mut executor = shell(
            "grep -q CRASHFILE \"$0\" && exit 1; exit 0",
            InputDelivery::File("{}".to_string()),
            Duration::from_secs(5),
        );
        let mut observer = NoOpObserver;
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];

        let status_ok = executor.execute_sync(b"OK_FILE", &mut observers);
        assert_eq!(status_ok, ExecutionStatus::Ok);

        let status_crash = executor.execute_sync(b"CRASHFILE", &mut observers);
        match status_crash {
            ExecutionStatus::Crash(desc) => {
                assert!(desc.contains("code 1"), "Expected exit code 1, got: {desc}")
            }
            _ => panic!("Expected Crash status for CRASHFILE, got {status_crash:?}"),
        }
    }

    #[test]
    fn cmd_exec_invalid_command() {
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(1),
            working_dir: None,
        });
        let mut observer = NoOpObserver;
        let mut observers: Vec<&mut dyn Observer> = vec![&mut observer];
        let status = executor.execute_sync(&[], &mut observers);
        match status {
            ExecutionStatus::Other(msg) => assert!(msg.contains("Failed to spawn command")),
            _ => panic!("Expected Other status for invalid command, got {status:?}"),
        }
    }

    #[test]
    fn cmd_exec_empty_command_is_rejected() {
        let mut executor = CommandExecutor::new(CommandExecutorConfig {
            command: Vec::new(),
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(1),
            working_dir: None,
        });
        let status = executor.execute_sync(&[], &mut []);
        assert_eq!(
            status,
            ExecutionStatus::Other("Empty target command".to_string())
        );
    }
}
