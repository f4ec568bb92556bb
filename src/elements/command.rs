//! The `Command` leaf: run a shell command, record the captured result.

use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::while_loop::LoopContext;
use crate::engine::{Engine, Thunk};
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::{CommandLine, CommandResult, ShellRequest};

/// The `Command` element. `cmd` may be an argv list (direct exec) or a
/// string (shell exec); `args` are only valid with a string command name.
pub struct Command {
    cmd: CommandLine,
    args: Option<Vec<String>>,
    cwd: Option<std::path::PathBuf>,
    env_vars: Vec<(String, String)>,
    timeout: Option<Duration>,
    on_finished: Option<Rc<dyn Fn(&CommandResult)>>,
    on_error: Option<Rc<dyn Fn(&CommandResult)>>,
    children: Option<Rc<dyn Fn(&CommandResult) -> Element>>,
}

impl Command {
    /// Shell-exec form: the whole string runs through `sh -c`.
    pub fn shell(cmd: impl Into<String>) -> Self {
        Self::with_line(CommandLine::Shell(cmd.into()))
    }

    /// Argv-exec form: the first element is the program.
    pub fn argv(argv: Vec<String>) -> Self {
        Self::with_line(CommandLine::Argv(argv))
    }

    fn with_line(cmd: CommandLine) -> Self {
        Self {
            cmd,
            args: None,
            cwd: None,
            env_vars: Vec::new(),
            timeout: None,
            on_finished: None,
            on_error: None,
            children: None,
        }
    }

    /// Arguments appended to a string command name.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_finished(mut self, f: impl Fn(&CommandResult) + 'static) -> Self {
        self.on_finished = Some(Rc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&CommandResult) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    /// Render a child element from the captured result once it arrives.
    pub fn render_result(mut self, f: impl Fn(&CommandResult) -> Element + 'static) -> Self {
        self.children = Some(Rc::new(f));
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }

    /// Resolve the effective command line, validating the `args` contract.
    fn effective_line(&self) -> Result<CommandLine, RenderError> {
        match (&self.cmd, &self.args) {
            (CommandLine::Shell(program), Some(args)) => {
                let mut argv = vec![program.clone()];
                argv.extend(args.iter().cloned());
                Ok(CommandLine::Argv(argv))
            }
            (CommandLine::Argv(_), Some(_)) => Err(RenderError::author(
                "Command",
                "args require a string command name, not an argv list",
            )),
            (line, None) => Ok(line.clone()),
        }
    }
}

#[derive(Clone, Default, PartialEq)]
struct CommandState {
    started: bool,
    result: Option<ResultCell>,
}

/// Wrapper so the state struct stays cheaply comparable.
#[derive(Clone)]
struct ResultCell(Rc<CommandResult>);

impl PartialEq for ResultCell {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Component for Command {
    fn type_name(&self) -> &'static str {
        "Command"
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let line = self.effective_line()?;
        let env = cx.env();
        let scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let iteration = cx
            .use_context::<LoopContext>()
            .map(|l| l.iteration)
            .unwrap_or(0);

        let (state, set_state) = cx.use_state(CommandState::default);

        {
            let env = env.clone();
            let set_state = set_state.clone();
            let line = line.clone();
            let cmd_display = line.display();
            let cwd = self.cwd.clone();
            let env_vars = self.env_vars.clone();
            let timeout = self.timeout;
            let on_finished = self.on_finished.clone();
            let on_error = self.on_error.clone();
            let scope_id = scope.scope_id;
            let fire = scope.enabled && !state.started;
            cx.use_effect(json!([scope.enabled, state.started]), move || {
                if !fire {
                    return;
                }
                let task_id = match env
                    .store
                    .tasks()
                    .start("command", &cmd_display, iteration, scope_id)
                {
                    Ok(id) => id,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                set_state.set(CommandState {
                    started: true,
                    result: None,
                });
                debug!(command = %cmd_display, "command spawned");

                let request = ShellRequest {
                    command: line.clone(),
                    cwd,
                    env: env_vars,
                    timeout,
                };
                let shell = Rc::clone(&env.options.shell);
                let env2 = env.clone();
                env.handle.spawn(async move {
                    let outcome = shell.exec(request).await;
                    Box::new(move |_: &mut Engine| {
                        let result = match outcome {
                            Ok(result) => result,
                            Err(err) => {
                                // The adapter itself failed (spawn error);
                                // synthesize a non-success result.
                                CommandResult {
                                    stderr: err.to_string(),
                                    exit_code: -1,
                                    ..CommandResult::default()
                                }
                            }
                        };
                        let result_key = format!("command:result:{}", invocation_hash(&cmd_display));
                        if !env2.store.is_closed() {
                            if let Err(err) = env2.store.state().set(
                                &result_key,
                                &result,
                                "command finished",
                            ) {
                                env2.report(EngineError::Store(err));
                            }
                            let finish = if result.success() {
                                env2.store.tasks().complete(&task_id)
                            } else {
                                env2.store.tasks().fail(&task_id)
                            };
                            if let Err(err) = finish {
                                env2.report(EngineError::Store(err));
                            }
                        }
                        if result.success() {
                            if let Some(on_finished) = &on_finished {
                                on_finished(&result);
                            }
                        } else if let Some(on_error) = &on_error {
                            on_error(&result);
                        }
                        set_state.update(|s| s.result = Some(ResultCell(Rc::new(result))));
                    }) as Thunk
                });
            });
        }

        let status = match (&state.result, state.started) {
            (Some(cell), _) if cell.0.success() => "completed",
            (Some(_), _) => "failed",
            (None, true) => "running",
            (None, false) => "pending",
        };

        let mut host = HostElement::new("command")
            .attr("cmd", line.display())
            .attr("status", status);
        if let (Some(render_child), Some(cell)) = (&self.children, &state.result) {
            host = host.child(render_child(&cell.0));
        }
        Ok(host.into())
    }
}

/// Stable per-invocation suffix for the result state key.
fn invocation_hash(display: &str) -> String {
    let digest = Sha256::digest(display.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}
