// Flow classes - typed state machines advanced one continuation at a time

//! # Flow Classes
//!
//! A flow class is a type implementing [`FlowBehavior`]. It declares:
//!
//! - `Args`: the typed argument struct, decoded from JSON when the flow starts
//! - `State`: a closed enum of continuations (see [`Continuation`])
//! - `start`: the initial continuation
//! - `resume`: invoked with a [`Responses`] batch once a request is complete
//!
//! Continuations are synchronous and never perform I/O. They record their
//! effects on a [`FlowContext`] (requests to the agent, child flows, replies,
//! alerts, log lines). The runner persists everything the context collected in
//! one commit and only then performs external side effects.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Copy)]
//! enum EchoState { Done }
//!
//! impl FlowBehavior for EchoFlow {
//!     const NAME: &'static str = "EchoFlow";
//!     type Args = EchoArgs;
//!     type State = EchoState;
//!
//!     fn start(ctx: &mut FlowContext<'_>, args: &EchoArgs) -> Result<()> {
//!         ctx.call_client("Echo", Payload::text(&args.data), EchoState::Done)?;
//!         Ok(())
//!     }
//!     ...
//! }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Associated Types and Constants
//! `type Args` and `const NAME` let every implementation choose its own
//! argument type and registry name. Such a trait cannot be used as `dyn`
//! directly, so [`FlowRegistry`] stores each class behind the object-safe
//! [`FlowDescriptor`] adapter.
//!
//! ### PhantomData<fn() -> F>
//! The adapter stores no `F` value. `PhantomData<fn() -> F>` records the type
//! without requiring `F: Send + Sync` for the adapter to be `Send + Sync`.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::models::{
    AgentRequest, ClientId, ClientRecord, EnvelopeStatus, FlowId, FlowInstance, FlowSpec,
    FlowStatus, MessageEnvelope, OutstandingRequest, Payload, SessionId,
};
use crate::{FleetError, Result};

/// Name of the continuation every flow starts in
pub const START_STATE: &str = "Start";

/// Closed set of continuations of one flow class
///
/// Implemented by a plain enum. `name()` is persisted on the outstanding
/// request; `from_name()` resolves it when the responses arrive.
pub trait Continuation: Sized + Send + 'static {
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self>;
}

/// A flow class
pub trait FlowBehavior: Send + Sync + 'static {
    /// Registry name, also persisted as `FlowInstance.flow_name`
    const NAME: &'static str;

    type Args: DeserializeOwned + Send;

    type State: Continuation;

    /// Semantic checks beyond what deserialization enforces
    fn validate(_args: &Self::Args) -> Result<()> {
        Ok(())
    }

    fn start(ctx: &mut FlowContext<'_>, args: &Self::Args) -> Result<()>;

    /// Invoked once the request registered with `state` has all its responses
    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &Self::Args,
        state: Self::State,
        responses: Responses,
    ) -> Result<()>;

    /// Invoked instead of `resume` when the request was aborted by an ERROR
    /// record or its STATUS reports a failure. The default fails the flow.
    fn on_request_error(
        ctx: &mut FlowContext<'_>,
        _args: &Self::Args,
        state: Self::State,
        responses: Responses,
    ) -> Result<()> {
        Err(FleetError::Continuation {
            session_id: ctx.session_id().to_string(),
            continuation: state.name().to_string(),
            message: responses
                .error_message()
                .unwrap_or_else(|| "request failed".to_string()),
        })
    }
}

/// Agent capabilities a flow may call
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashSet<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions every fleet agent ships with
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for action in [
            "Echo",
            "GetClientStats",
            "GetClientInfo",
            "GetConfiguration",
            "UpdateConfiguration",
            "SendStartupInfo",
            "GetPlatformInfo",
            "ListProcesses",
            "ListDirectory",
            "StatFile",
            "HashFile",
            "TransferBuffer",
            "ExecuteCommand",
            "ExecuteBinaryCommand",
            "ExecutePython",
            "Kill",
        ] {
            registry.register(action);
        }
        registry
    }

    pub fn register<S: Into<String>>(&mut self, action: S) -> &mut Self {
        self.actions.insert(action.into());
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains(action)
    }
}

/// The completed response set of one request, ordered by response id
#[derive(Debug, Clone)]
pub struct Responses {
    request_id: u64,
    messages: Vec<MessageEnvelope>,
    status: Option<FlowStatus>,
    error: Option<String>,
}

impl Responses {
    pub(crate) fn from_request(request: OutstandingRequest) -> Self {
        let error = request.error.as_ref().map(|envelope| match &envelope.status {
            EnvelopeStatus::Error { message } => message.clone(),
            _ => "request aborted".to_string(),
        });
        let status = request
            .status
            .as_ref()
            .and_then(|envelope| envelope.flow_status().cloned());
        Self {
            request_id: request.request_id,
            // BTreeMap iteration is already in response id order
            messages: request.responses.into_values().collect(),
            status,
            error,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// True when no ERROR record arrived and the STATUS reports OK
    pub fn success(&self) -> bool {
        self.error.is_none() && self.status.as_ref().map_or(false, |s| s.code.is_ok())
    }

    pub fn status(&self) -> Option<&FlowStatus> {
        self.status.as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        self.status
            .as_ref()
            .filter(|s| !s.code.is_ok())
            .map(|s| {
                s.error_message
                    .clone()
                    .unwrap_or_else(|| format!("request failed with {:?}", s.code))
            })
    }

    pub fn messages(&self) -> &[MessageEnvelope] {
        &self.messages
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.messages.iter().filter_map(|m| m.payload.as_ref())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Decode the first payload
    pub fn first<T: DeserializeOwned>(&self) -> Result<T> {
        self.payloads()
            .next()
            .ok_or_else(|| FleetError::Protocol(format!("request {} has no responses", self.request_id)))?
            .decode()
    }

    /// Decode every payload
    pub fn decode_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.payloads().map(|p| p.decode()).collect()
    }
}

/// A child flow a continuation asked for
#[derive(Debug, Clone)]
pub struct ChildStart {
    pub session_id: SessionId,
    pub parent_session_id: SessionId,
    /// Request of the parent the child's responses are routed to
    pub request_id: u64,
    pub flow: FlowSpec,
}

/// An alert to send once the commit succeeded; `None` means the default target
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub target: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Side effects collected while running continuations
#[derive(Debug, Default)]
pub struct FlowEffects {
    pub outbound: Vec<AgentRequest>,
    pub children: Vec<ChildStart>,
    pub notifications: Vec<MessageEnvelope>,
    pub alerts: Vec<PendingAlert>,
}

impl FlowEffects {
    pub fn merge(&mut self, other: FlowEffects) {
        self.outbound.extend(other.outbound);
        self.children.extend(other.children);
        self.notifications.extend(other.notifications);
        self.alerts.extend(other.alerts);
    }
}

/// What a continuation may do
pub struct FlowContext<'a> {
    flow: &'a mut FlowInstance,
    client: Option<&'a ClientRecord>,
    actions: &'a ActionRegistry,
    effects: FlowEffects,
}

impl<'a> FlowContext<'a> {
    pub fn new(
        flow: &'a mut FlowInstance,
        client: Option<&'a ClientRecord>,
        actions: &'a ActionRegistry,
    ) -> Self {
        Self {
            flow,
            client,
            actions,
            effects: FlowEffects::default(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.flow.session_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.flow.client_id
    }

    /// Client record as of the start of this dispatch cycle
    pub fn client(&self) -> Option<&ClientRecord> {
        self.client
    }

    /// Hostname when known, client id otherwise
    pub fn client_display_name(&self) -> String {
        self.client
            .map(|c| c.display_name())
            .unwrap_or_else(|| self.flow.client_id.to_string())
    }

    /// Issue a request to the agent; `next` runs once its responses are complete
    ///
    /// ## Errors
    /// - `InvalidAction` when the agent class does not support `action`
    pub fn call_client<C: Continuation>(&mut self, action: &str, args: Payload, next: C) -> Result<u64> {
        if !self.actions.contains(action) {
            return Err(FleetError::InvalidAction {
                action: action.to_string(),
                flow: self.flow.flow_name.clone(),
            });
        }

        let request_id = self.flow.allocate_request_id();
        self.flow.outstanding.insert(
            request_id,
            OutstandingRequest::new(request_id, next.name().to_string(), Some(action.to_string())),
        );
        self.effects.outbound.push(AgentRequest {
            session_id: self.flow.session_id.clone(),
            client_id: self.flow.client_id.clone(),
            request_id,
            action: action.to_string(),
            args,
            issued_at: Utc::now(),
            cpu_limit: None,
            network_bytes_limit: None,
        });
        debug!(
            session_id = %self.flow.session_id,
            request_id,
            action,
            "Queued client request"
        );
        Ok(request_id)
    }

    /// Start a child flow on the same client; its replies and terminal status
    /// come back as the responses of the returned request id
    pub fn call_flow<C: Continuation>(&mut self, flow: FlowSpec, next: C) -> Result<u64> {
        let request_id = self.flow.allocate_request_id();
        let child_session = self.flow.session_id.child(&FlowId::random());

        let mut request = OutstandingRequest::new(request_id, next.name().to_string(), None);
        request.child_session = Some(child_session.clone());
        self.flow.outstanding.insert(request_id, request);

        self.effects.children.push(ChildStart {
            session_id: child_session,
            parent_session_id: self.flow.session_id.clone(),
            request_id,
            flow,
        });
        Ok(request_id)
    }

    /// Record a result; forwarded to the parent when this is a child flow
    pub fn reply(&mut self, payload: Payload) {
        if let Some(parent) = self.flow.parent.as_mut() {
            let envelope = MessageEnvelope::response(
                parent.session_id.clone(),
                parent.request_id,
                parent.next_response_id,
                payload.clone(),
            )
            .with_source(self.flow.client_id.clone());
            parent.next_response_id += 1;
            self.effects.notifications.push(envelope);
        }
        self.flow.results.push(payload);
    }

    /// Alert `target` once this cycle is committed
    pub fn alert<T: Into<String>, S: Into<String>, B: Into<String>>(&mut self, target: T, subject: S, body: B) {
        self.effects.alerts.push(PendingAlert {
            target: Some(target.into()),
            subject: subject.into(),
            body: body.into(),
        });
    }

    /// Alert the fleet default target once this cycle is committed
    pub fn alert_default<S: Into<String>, B: Into<String>>(&mut self, subject: S, body: B) {
        self.effects.alerts.push(PendingAlert {
            target: None,
            subject: subject.into(),
            body: body.into(),
        });
    }

    pub fn log<S: Into<String>>(&mut self, message: S) {
        self.flow.log(message);
    }

    /// Data an earlier continuation saved with [`Self::set_data`]; `T::default()` before that
    pub fn data<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.flow.data.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.flow.data.clone()).map_err(|e| FleetError::Continuation {
            session_id: self.flow.session_id.to_string(),
            continuation: self.flow.current_state.clone(),
            message: format!("flow data does not decode: {}", e),
        })
    }

    /// Persisted with the flow in the same commit as the continuation's other effects
    pub fn set_data<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.flow.data = serde_json::to_value(data)?;
        Ok(())
    }

    pub fn into_effects(self) -> FlowEffects {
        self.effects
    }
}

/// Type-erased view of a flow class, stored in the registry
pub trait FlowDescriptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, args: &serde_json::Value) -> Result<()>;

    fn start(&self, ctx: &mut FlowContext<'_>, args: &serde_json::Value) -> Result<()>;

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        args: &serde_json::Value,
        state: &str,
        responses: Responses,
    ) -> Result<()>;

    fn on_request_error(
        &self,
        ctx: &mut FlowContext<'_>,
        args: &serde_json::Value,
        state: &str,
        responses: Responses,
    ) -> Result<()>;
}

struct FlowAdapter<F> {
    _flow: PhantomData<fn() -> F>,
}

impl<F: FlowBehavior> FlowAdapter<F> {
    fn args(&self, args: &serde_json::Value) -> Result<F::Args> {
        serde_json::from_value(args.clone()).map_err(|e| FleetError::InvalidArgs {
            flow: F::NAME.to_string(),
            message: e.to_string(),
        })
    }

    fn state(&self, ctx: &FlowContext<'_>, state: &str) -> Result<F::State> {
        F::State::from_name(state).ok_or_else(|| FleetError::Continuation {
            session_id: ctx.session_id().to_string(),
            continuation: state.to_string(),
            message: format!("{} has no continuation named {}", F::NAME, state),
        })
    }
}

impl<F: FlowBehavior> FlowDescriptor for FlowAdapter<F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        F::validate(&self.args(args)?)
    }

    fn start(&self, ctx: &mut FlowContext<'_>, args: &serde_json::Value) -> Result<()> {
        let args = self.args(args)?;
        F::start(ctx, &args)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        args: &serde_json::Value,
        state: &str,
        responses: Responses,
    ) -> Result<()> {
        let args = self.args(args)?;
        let state = self.state(ctx, state)?;
        F::resume(ctx, &args, state, responses)
    }

    fn on_request_error(
        &self,
        ctx: &mut FlowContext<'_>,
        args: &serde_json::Value,
        state: &str,
        responses: Responses,
    ) -> Result<()> {
        let args = self.args(args)?;
        let state = self.state(ctx, state)?;
        F::on_request_error(ctx, &args, state, responses)
    }
}

/// Flow classes by name
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn FlowDescriptor>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in flow classes
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register::<super::flows::ClientActionRunner>()
            .register::<super::flows::OnlineNotification>()
            .register::<super::flows::GetClientStats>()
            .register::<super::flows::UpdateConfiguration>()
            .register::<super::flows::LaunchBinary>()
            .register::<super::flows::ExecutePythonHack>();
        registry
    }

    pub fn register<F: FlowBehavior>(&mut self) -> &mut Self {
        debug!("Registered flow class: {}", F::NAME);
        self.flows.insert(
            F::NAME.to_string(),
            Arc::new(FlowAdapter::<F> {
                _flow: PhantomData,
            }),
        );
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn FlowDescriptor>> {
        self.flows
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::UnknownFlowClass(name.to_string()))
    }

    /// Resolve the class and validate the arguments, without starting anything
    pub fn validate(&self, spec: &FlowSpec) -> Result<Arc<dyn FlowDescriptor>> {
        let descriptor = self.get(&spec.flow_name)?;
        descriptor.validate(&spec.args)?;
        Ok(descriptor)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowSpec, ParentLink};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct PingArgs {
        count: u32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum PingState {
        Pong,
    }

    impl Continuation for PingState {
        fn name(&self) -> &'static str {
            "Pong"
        }

        fn from_name(name: &str) -> Option<Self> {
            (name == "Pong").then_some(PingState::Pong)
        }
    }

    struct Ping;

    impl FlowBehavior for Ping {
        const NAME: &'static str = "Ping";
        type Args = PingArgs;
        type State = PingState;

        fn validate(args: &PingArgs) -> Result<()> {
            if args.count == 0 {
                return Err(FleetError::InvalidArgs {
                    flow: Self::NAME.to_string(),
                    message: "count must be positive".to_string(),
                });
            }
            Ok(())
        }

        fn start(ctx: &mut FlowContext<'_>, args: &PingArgs) -> Result<()> {
            for _ in 0..args.count {
                ctx.call_client("Echo", Payload::text("ping"), PingState::Pong)?;
            }
            Ok(())
        }

        fn resume(
            ctx: &mut FlowContext<'_>,
            _args: &PingArgs,
            _state: PingState,
            responses: Responses,
        ) -> Result<()> {
            for payload in responses.payloads() {
                ctx.reply(payload.clone());
            }
            Ok(())
        }
    }

    fn flow(args: serde_json::Value) -> FlowInstance {
        FlowInstance::new(
            SessionId::from("C.1000000000000000/flows/F.00000001"),
            ClientId::from_index(0),
            &FlowSpec::new("Ping", args),
        )
    }

    #[test]
    fn test_registry_validates_args() {
        let mut registry = FlowRegistry::new();
        registry.register::<Ping>();

        assert!(registry.validate(&FlowSpec::new("Ping", json!({"count": 2}))).is_ok());
        assert!(matches!(
            registry.validate(&FlowSpec::new("Ping", json!({"count": 0}))),
            Err(FleetError::InvalidArgs { .. })
        ));
        assert!(matches!(
            registry.validate(&FlowSpec::new("Ping", json!({"count": "x"}))),
            Err(FleetError::InvalidArgs { .. })
        ));
        assert!(matches!(
            registry.validate(&FlowSpec::new("Nope", json!({}))),
            Err(FleetError::UnknownFlowClass(_))
        ));
    }

    #[test]
    fn test_call_client_allocates_requests() {
        let mut registry = FlowRegistry::new();
        registry.register::<Ping>();
        let actions = ActionRegistry::standard();
        let args = json!({"count": 2});
        let mut instance = flow(args.clone());

        let mut ctx = FlowContext::new(&mut instance, None, &actions);
        registry.get("Ping").unwrap().start(&mut ctx, &args).unwrap();
        let effects = ctx.into_effects();

        assert_eq!(effects.outbound.len(), 2);
        assert_eq!(effects.outbound[0].request_id, 1);
        assert_eq!(effects.outbound[1].request_id, 2);
        assert_eq!(instance.outstanding.len(), 2);
        assert_eq!(instance.outstanding[&1].next_state, "Pong");
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let actions = ActionRegistry::new();
        let mut instance = flow(json!({"count": 1}));
        let mut ctx = FlowContext::new(&mut instance, None, &actions);

        let result = ctx.call_client("Echo", Payload::empty(), PingState::Pong);
        assert!(matches!(result, Err(FleetError::InvalidAction { .. })));
        drop(ctx);
        assert!(instance.outstanding.is_empty());
    }

    #[test]
    fn test_reply_is_forwarded_to_parent() {
        let actions = ActionRegistry::standard();
        let mut instance = flow(json!({"count": 1}));
        let parent = SessionId::from("C.1000000000000000/flows/F.00000002");
        instance.parent = Some(ParentLink {
            session_id: parent.clone(),
            request_id: 4,
            next_response_id: 0,
        });

        let mut ctx = FlowContext::new(&mut instance, None, &actions);
        ctx.reply(Payload::text("one"));
        ctx.reply(Payload::text("two"));
        let effects = ctx.into_effects();

        assert_eq!(effects.notifications.len(), 2);
        assert_eq!(effects.notifications[0].session_id, parent);
        assert_eq!(effects.notifications[0].request_id, 4);
        assert_eq!(effects.notifications[1].response_id, 1);
        assert_eq!(instance.results.len(), 2);
    }

    #[test]
    fn test_flow_data_survives_between_continuations() {
        #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
        struct Progress {
            offset: usize,
        }

        let actions = ActionRegistry::standard();
        let mut instance = flow(json!({"count": 1}));
        {
            let mut ctx = FlowContext::new(&mut instance, None, &actions);
            assert_eq!(ctx.data::<Progress>().unwrap(), Progress::default());
            ctx.set_data(&Progress { offset: 100 }).unwrap();
        }

        // through the same serialization the stores use
        let mut stored: FlowInstance = serde_json::from_value(serde_json::to_value(&instance).unwrap()).unwrap();
        let ctx = FlowContext::new(&mut stored, None, &actions);
        assert_eq!(ctx.data::<Progress>().unwrap(), Progress { offset: 100 });
    }

    #[test]
    fn test_responses_error_message() {
        let session = SessionId::from("C.1000000000000000/flows/F.00000001");
        let mut request = OutstandingRequest::new(1, "Pong".to_string(), Some("Echo".to_string()));
        request.status = Some(MessageEnvelope::status(
            session,
            1,
            0,
            FlowStatus::error(crate::models::StatusCode::IoError, "disk gone"),
        ));
        let responses = Responses::from_request(request);
        assert!(!responses.success());
        assert_eq!(responses.error_message().as_deref(), Some("disk gone"));
    }
}
