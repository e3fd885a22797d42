// OnlineNotification - alert an address once an agent comes back online

use serde::Deserialize;

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::Payload;
use crate::{FleetError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct OnlineNotificationArgs {
    pub email: String,
}

#[derive(Debug, Clone, Copy)]
pub enum OnlineNotificationState {
    SendMail,
}

impl Continuation for OnlineNotificationState {
    fn name(&self) -> &'static str {
        "SendMail"
    }

    fn from_name(name: &str) -> Option<Self> {
        (name == "SendMail").then_some(OnlineNotificationState::SendMail)
    }
}

/// Pings the agent; the Echo request stays queued until the agent polls, so
/// the reply means the agent is back
pub struct OnlineNotification;

impl FlowBehavior for OnlineNotification {
    const NAME: &'static str = "OnlineNotification";
    type Args = OnlineNotificationArgs;
    type State = OnlineNotificationState;

    fn validate(args: &OnlineNotificationArgs) -> Result<()> {
        if !args.email.contains('@') {
            return Err(FleetError::InvalidArgs {
                flow: Self::NAME.to_string(),
                message: format!("not an email address: {}", args.email),
            });
        }
        Ok(())
    }

    fn start(ctx: &mut FlowContext<'_>, _args: &OnlineNotificationArgs) -> Result<()> {
        ctx.call_client("Echo", Payload::text("ping"), OnlineNotificationState::SendMail)?;
        Ok(())
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &OnlineNotificationArgs,
        _state: OnlineNotificationState,
        _responses: Responses,
    ) -> Result<()> {
        let hostname = ctx.client_display_name();
        let subject = format!("Fleet client on {} became available.", hostname);
        let body = format!(
            "Client {} ({}) became available.\n\nRequested by flow {}.\n",
            ctx.client_id(),
            hostname,
            ctx.session_id()
        );
        ctx.alert(args.email.clone(), subject, body);
        ctx.log(format!("Sent online notification to {}", args.email));
        Ok(())
    }
}
