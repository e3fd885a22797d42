// ClientActionRunner - run one agent action and keep its replies

use serde::Deserialize;

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::Payload;
use crate::{FleetError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientActionRunnerArgs {
    pub action: String,
    /// Passed to the action as a JSON payload; no payload when absent
    #[serde(default)]
    pub args: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub enum ActionRunnerState {
    StoreResults,
}

impl Continuation for ActionRunnerState {
    fn name(&self) -> &'static str {
        "StoreResults"
    }

    fn from_name(name: &str) -> Option<Self> {
        (name == "StoreResults").then_some(ActionRunnerState::StoreResults)
    }
}

pub struct ClientActionRunner;

impl FlowBehavior for ClientActionRunner {
    const NAME: &'static str = "ClientActionRunner";
    type Args = ClientActionRunnerArgs;
    type State = ActionRunnerState;

    fn validate(args: &ClientActionRunnerArgs) -> Result<()> {
        if args.action.trim().is_empty() {
            return Err(FleetError::InvalidArgs {
                flow: Self::NAME.to_string(),
                message: "action must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn start(ctx: &mut FlowContext<'_>, args: &ClientActionRunnerArgs) -> Result<()> {
        let payload = match &args.args {
            Some(value) => Payload::json(format!("{}Args", args.action), value)?,
            None => Payload::empty(),
        };
        ctx.call_client(&args.action, payload, ActionRunnerState::StoreResults)?;
        Ok(())
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &ClientActionRunnerArgs,
        _state: ActionRunnerState,
        responses: Responses,
    ) -> Result<()> {
        ctx.log(format!("{} returned {} responses", args.action, responses.len()));
        for payload in responses.payloads() {
            ctx.reply(payload.clone());
        }
        Ok(())
    }
}
