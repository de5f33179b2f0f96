//! Built-in process classes, used by the demo command and the test suites.
use serde_json::{Value, json};

use super::process::{HookContext, ProcessClass, ProcessError, ProcessLogic, RunContext, Step};
use super::spec::{InputPort, ProcessSpec, ValueMap, ValueType};
use super::state::{Hook, Resume};
use crate::bundle::{Bundle, BundleError};
use crate::promise::Promise;

pub const ECHO: &str = "echo";
pub const DUMMY: &str = "dummy";
pub const DUMMY_WITH_OUTPUT: &str = "dummy_with_output";
pub const EXCEPTION: &str = "exception";
pub const THREE_STEPS: &str = "three_steps";
pub const WAIT_FOR_SIGNAL: &str = "wait_for_signal";
pub const FORGET_TO_CALL_PARENT: &str = "forget_to_call_parent";

pub fn classes() -> Vec<ProcessClass> {
    vec![
        ProcessClass::new(
            ECHO,
            ProcessSpec::builder()
                .dynamic_input()
                .dynamic_output()
                .description("Emits every input back as an output of the same name.")
                .build(),
            |_| Box::new(Echo),
        ),
        ProcessClass::new(
            DUMMY,
            ProcessSpec::builder()
                .description("Does nothing and finishes.")
                .build(),
            |_| Box::new(Dummy),
        ),
        ProcessClass::new(
            DUMMY_WITH_OUTPUT,
            ProcessSpec::builder()
                .output_port("default", ValueType::Integer)
                .description("Emits 5 on `default`.")
                .build(),
            |_| Box::new(DummyWithOutput),
        ),
        ProcessClass::new(
            EXCEPTION,
            ProcessSpec::builder()
                .description("Fails during its run step.")
                .build(),
            |_| Box::new(Exception),
        ),
        ProcessClass::new(
            THREE_STEPS,
            ProcessSpec::builder()
                .input_port(InputPort::new("a").with_default(json!(1)).valid_type(ValueType::Integer))
                .output("v")
                .output("w")
                .output("x")
                .description("Three run steps separated by immediately satisfied waits.")
                .build(),
            |inputs| {
                Box::new(ThreeSteps {
                    a: inputs.get("a").and_then(Value::as_i64).unwrap_or(1),
                    done: 0,
                })
            },
        ),
        ProcessClass::new(
            WAIT_FOR_SIGNAL,
            ProcessSpec::builder()
                .output_port("finished", ValueType::Bool)
                .description("Waits on `signal` until continued, then finishes.")
                .build(),
            |_| Box::new(WaitForSignal),
        ),
        ProcessClass::new(
            FORGET_TO_CALL_PARENT,
            ProcessSpec::builder()
                .input_port(
                    InputPort::new("forget_on")
                        .valid_type(ValueType::String)
                        .help("hook that skips its base behaviour: start, run, fail, finish or stop"),
                )
                .description("Skips the base behaviour of one lifecycle hook.")
                .build(),
            |inputs| {
                let forget_on = inputs
                    .get("forget_on")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Box::new(ForgetToCallParent { forget_on })
            },
        ),
    ]
}

struct Echo;

impl ProcessLogic for Echo {
    fn run(&mut self, ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        let values: ValueMap = ctx.inputs().clone();
        for (name, value) in values {
            ctx.emit(name, value)?;
        }
        Ok(Step::Done)
    }
}

struct Dummy;

impl ProcessLogic for Dummy {
    fn run(&mut self, _ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        Ok(Step::Done)
    }
}

struct DummyWithOutput;

impl ProcessLogic for DummyWithOutput {
    fn run(&mut self, ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        ctx.emit("default", json!(5))?;
        Ok(Step::Done)
    }
}

struct Exception;

impl ProcessLogic for Exception {
    fn run(&mut self, _ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        Err(ProcessError::execution("RuntimeError", "Great scott!").into())
    }
}

/// Keeps the number of completed steps in its checkpoint.
struct ThreeSteps {
    a: i64,
    done: u64,
}

impl ProcessLogic for ThreeSteps {
    fn run(&mut self, ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        let a = self.a;
        self.done += 1;
        match self.done {
            1 => {
                ctx.emit("v", json!(a))?;
                Ok(Step::wait_on("s2", Promise::resolved(Value::Null)))
            }
            2 => {
                ctx.emit("w", json!(a * 2))?;
                Ok(Step::wait_on("s3", Promise::resolved(Value::Null)))
            }
            _ => {
                ctx.emit("x", json!(a * 3))?;
                Ok(Step::Done)
            }
        }
    }

    fn save_state(&self, ext: &mut Bundle) -> Result<(), BundleError> {
        ext.put("steps_done", &self.done)
    }

    fn load_state(&mut self, ext: &Bundle) -> Result<(), BundleError> {
        self.done = ext.get_opt("steps_done")?.unwrap_or_default();
        Ok(())
    }
}

struct WaitForSignal;

impl ProcessLogic for WaitForSignal {
    fn run(&mut self, ctx: &mut RunContext<'_>, resume: Option<Resume>) -> anyhow::Result<Step> {
        match resume {
            None => Ok(Step::wait("signal")),
            Some(_) => {
                ctx.emit("finished", json!(true))?;
                Ok(Step::Done)
            }
        }
    }
}

struct ForgetToCallParent {
    forget_on: String,
}

impl ForgetToCallParent {
    fn maybe_call_base(&self, ctx: &mut HookContext<'_>) {
        let name = match ctx.hook() {
            Hook::Start => "start",
            Hook::Run => "run",
            Hook::Fail => "fail",
            Hook::Finish => "finish",
            Hook::Stop => "stop",
        };
        if self.forget_on != name {
            ctx.call_base();
        }
    }
}

impl ProcessLogic for ForgetToCallParent {
    fn run(&mut self, _ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        Ok(Step::Done)
    }

    fn on_start(&mut self, ctx: &mut HookContext<'_>) {
        self.maybe_call_base(ctx);
    }

    fn on_run(&mut self, ctx: &mut HookContext<'_>) {
        self.maybe_call_base(ctx);
    }

    fn on_fail(&mut self, ctx: &mut HookContext<'_>) {
        self.maybe_call_base(ctx);
    }

    fn on_finish(&mut self, ctx: &mut HookContext<'_>) {
        self.maybe_call_base(ctx);
    }

    fn on_stop(&mut self, ctx: &mut HookContext<'_>) {
        self.maybe_call_base(ctx);
    }
}
