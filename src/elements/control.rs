//! Pure structural elements: `If`, `Each`, `Switch`, and the terminal `End`.

use std::rc::Rc;

use serde_json::{Value, json};
use tracing::info;

use crate::engine::request_stop;
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::ExecutionStatus;

/// Render children only when the condition holds; an optional else-branch
/// renders otherwise.
pub struct If {
    cond: bool,
    then_children: Vec<Element>,
    else_children: Vec<Element>,
}

impl If {
    pub fn new(cond: bool) -> Self {
        Self {
            cond,
            then_children: Vec::new(),
            else_children: Vec::new(),
        }
    }

    pub fn then(mut self, child: Element) -> Self {
        self.then_children.push(child);
        self
    }

    pub fn otherwise(mut self, child: Element) -> Self {
        self.else_children.push(child);
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }
}

impl Component for If {
    fn type_name(&self) -> &'static str {
        "If"
    }

    fn render(&self, _cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let children = if self.cond {
            self.then_children.clone()
        } else {
            self.else_children.clone()
        };
        Ok(Element::fragment(children))
    }
}

/// Map a list of values through a render function; items keep identity by
/// position unless the rendered elements carry keys.
pub struct Each {
    items: Vec<Value>,
    render_item: Rc<dyn Fn(&Value, usize) -> Element>,
}

impl Each {
    pub fn new(items: Vec<Value>, render_item: impl Fn(&Value, usize) -> Element + 'static) -> Self {
        Self {
            items,
            render_item: Rc::new(render_item),
        }
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }
}

impl Component for Each {
    fn type_name(&self) -> &'static str {
        "Each"
    }

    fn render(&self, _cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let children = self
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| (self.render_item)(item, index))
            .collect();
        Ok(Element::fragment(children))
    }
}

/// Value dispatch: the first case equal to the subject renders; otherwise
/// the default branch does.
pub struct Switch {
    subject: Value,
    cases: Vec<(Value, Vec<Element>)>,
    default: Vec<Element>,
}

impl Switch {
    pub fn new(subject: impl Into<Value>) -> Self {
        Self {
            subject: subject.into(),
            cases: Vec::new(),
            default: Vec::new(),
        }
    }

    pub fn case(mut self, value: impl Into<Value>, child: Element) -> Self {
        let value = value.into();
        match self.cases.iter_mut().find(|(v, _)| *v == value) {
            Some((_, children)) => children.push(child),
            None => self.cases.push((value, vec![child])),
        }
        self
    }

    pub fn default(mut self, child: Element) -> Self {
        self.default.push(child);
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }
}

impl Component for Switch {
    fn type_name(&self) -> &'static str {
        "Switch"
    }

    fn render(&self, _cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let children = self
            .cases
            .iter()
            .find(|(value, _)| *value == self.subject)
            .map(|(_, children)| children.clone())
            .unwrap_or_else(|| self.default.clone());
        Ok(Element::fragment(children))
    }
}

/// Finalize the execution and stop the engine. The recorded exit code is
/// what `Engine::run` returns to the host process.
pub struct End {
    exit_code: i32,
    summary: Option<Value>,
    reason: String,
}

impl End {
    pub fn new() -> Self {
        Self {
            exit_code: 0,
            summary: None,
            reason: "workflow ended".to_string(),
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn summary(mut self, summary: Value) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }
}

impl Default for End {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for End {
    fn type_name(&self) -> &'static str {
        "End"
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let (fired, set_fired) = cx.use_state(|| false);

        {
            let env = env.clone();
            let exit_code = self.exit_code;
            let summary = self.summary.clone();
            let reason = self.reason.clone();
            let fire = scope.enabled && !fired;
            cx.use_effect(json!([scope.enabled, fired]), move || {
                if !fire {
                    return;
                }
                set_fired.set(true);
                info!(exit_code, reason = %reason, "workflow end");
                let status = if exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                if let Err(err) =
                    env.store
                        .executions()
                        .finish(status, exit_code, summary.as_ref(), &reason)
                {
                    env.report(EngineError::Store(err));
                }
                if let Err(err) = request_stop(&env.store, &reason) {
                    env.report(EngineError::Store(err));
                }
                let exit = crate::engine::ExitStatus {
                    exit_code,
                    reason: reason.clone(),
                };
                env.handle.defer(move |engine| {
                    engine.mark_execution_finalized();
                    engine.set_exit(exit);
                });
            });
        }

        Ok(HostElement::new("end")
            .attr("exitCode", self.exit_code as i64)
            .attr("fired", fired)
            .into())
    }
}
