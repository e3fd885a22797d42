// UpdateConfiguration - change agent configuration and read it back

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::Payload;
use crate::{FleetError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfigurationArgs {
    /// Configuration options to set, e.g. `"Client.poll_min": 1`
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateConfigurationState {
    Confirmation,
    Verify,
}

impl Continuation for UpdateConfigurationState {
    fn name(&self) -> &'static str {
        match self {
            UpdateConfigurationState::Confirmation => "Confirmation",
            UpdateConfigurationState::Verify => "Verify",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Confirmation" => Some(UpdateConfigurationState::Confirmation),
            "Verify" => Some(UpdateConfigurationState::Verify),
            _ => None,
        }
    }
}

/// Sends the new options, then fetches the agent's configuration and fails
/// unless every option reads back with the value that was sent
pub struct UpdateConfiguration;

impl FlowBehavior for UpdateConfiguration {
    const NAME: &'static str = "UpdateConfiguration";
    type Args = UpdateConfigurationArgs;
    type State = UpdateConfigurationState;

    fn validate(args: &UpdateConfigurationArgs) -> Result<()> {
        if args.config.is_empty() {
            return Err(FleetError::InvalidArgs {
                flow: Self::NAME.to_string(),
                message: "config must set at least one option".to_string(),
            });
        }
        Ok(())
    }

    fn start(ctx: &mut FlowContext<'_>, args: &UpdateConfigurationArgs) -> Result<()> {
        ctx.call_client(
            "UpdateConfiguration",
            Payload::json("Dict", &args.config)?,
            UpdateConfigurationState::Confirmation,
        )?;
        Ok(())
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &UpdateConfigurationArgs,
        state: UpdateConfigurationState,
        responses: Responses,
    ) -> Result<()> {
        match state {
            UpdateConfigurationState::Confirmation => {
                ctx.log(format!("Client accepted {} configuration options", args.config.len()));
                ctx.call_client("GetConfiguration", Payload::empty(), UpdateConfigurationState::Verify)?;
            }
            UpdateConfigurationState::Verify => {
                let current: Map<String, Value> = responses.first()?;
                let mut missing: Vec<&str> = args
                    .config
                    .iter()
                    .filter(|(key, value)| current.get(key.as_str()) != Some(*value))
                    .map(|(key, _)| key.as_str())
                    .collect();
                if !missing.is_empty() {
                    missing.sort_unstable();
                    return Err(FleetError::Continuation {
                        session_id: ctx.session_id().to_string(),
                        continuation: state.name().to_string(),
                        message: format!("client did not apply {}", missing.join(", ")),
                    });
                }
                ctx.log("Configuration read back as written");
                ctx.reply(Payload::json("Dict", &current)?);
            }
        }
        Ok(())
    }
}
