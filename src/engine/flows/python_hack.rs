// ExecutePythonHack - run a named Python snippet on the agent

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::Payload;
use crate::{FleetError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutePythonHackArgs {
    /// Name the hack is known by; shows up in the flow log
    pub hack_name: String,
    pub code: String,
    /// Exposed to the code as the `py_args` dict
    #[serde(default)]
    pub py_args: Map<String, Value>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePythonRequest {
    pub python_code: String,
    #[serde(default)]
    pub py_args: Map<String, Value>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePythonResponse {
    /// Whatever the code printed or returned
    #[serde(default)]
    pub return_val: String,
    #[serde(default)]
    pub time_used_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum PythonHackState {
    Done,
}

impl Continuation for PythonHackState {
    fn name(&self) -> &'static str {
        "Done"
    }

    fn from_name(name: &str) -> Option<Self> {
        (name == "Done").then_some(PythonHackState::Done)
    }
}

pub struct ExecutePythonHack;

impl FlowBehavior for ExecutePythonHack {
    const NAME: &'static str = "ExecutePythonHack";
    type Args = ExecutePythonHackArgs;
    type State = PythonHackState;

    fn validate(args: &ExecutePythonHackArgs) -> Result<()> {
        let missing = if args.hack_name.trim().is_empty() {
            Some("hack_name")
        } else if args.code.trim().is_empty() {
            Some("code")
        } else {
            None
        };
        match missing {
            Some(field) => Err(FleetError::InvalidArgs {
                flow: Self::NAME.to_string(),
                message: format!("{} must not be empty", field),
            }),
            None => Ok(()),
        }
    }

    fn start(ctx: &mut FlowContext<'_>, args: &ExecutePythonHackArgs) -> Result<()> {
        let request = ExecutePythonRequest {
            python_code: args.code.clone(),
            py_args: args.py_args.clone(),
            time_limit_secs: args.time_limit_secs,
        };
        ctx.call_client(
            "ExecutePython",
            Payload::json("ExecutePythonRequest", &request)?,
            PythonHackState::Done,
        )?;
        ctx.log(format!("Sent python hack {}", args.hack_name));
        Ok(())
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &ExecutePythonHackArgs,
        _state: PythonHackState,
        responses: Responses,
    ) -> Result<()> {
        for payload in responses.payloads() {
            let result: ExecutePythonResponse = payload.decode()?;
            ctx.log(format!(
                "Python hack {} returned {} bytes in {} ms",
                args.hack_name,
                result.return_val.len(),
                result.time_used_ms
            ));
            ctx.reply(payload.clone());
        }
        Ok(())
    }
}
