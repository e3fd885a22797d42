// GetClientStats - collect resource statistics and store them downsampled

use serde::Deserialize;

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::{ClientStats, Payload, DEFAULT_SAMPLE_INTERVAL_US};
use crate::{FleetError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GetClientStatsArgs {
    /// Bucket width in microseconds
    pub sample_interval_us: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub enum ClientStatsState {
    StoreResults,
}

impl Continuation for ClientStatsState {
    fn name(&self) -> &'static str {
        "StoreResults"
    }

    fn from_name(name: &str) -> Option<Self> {
        (name == "StoreResults").then_some(ClientStatsState::StoreResults)
    }
}

pub struct GetClientStats;

impl FlowBehavior for GetClientStats {
    const NAME: &'static str = "GetClientStats";
    type Args = GetClientStatsArgs;
    type State = ClientStatsState;

    fn validate(args: &GetClientStatsArgs) -> Result<()> {
        match args.sample_interval_us {
            Some(interval) if interval <= 0 => Err(FleetError::InvalidArgs {
                flow: Self::NAME.to_string(),
                message: "sample_interval_us must be positive".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn start(ctx: &mut FlowContext<'_>, _args: &GetClientStatsArgs) -> Result<()> {
        ctx.call_client("GetClientStats", Payload::empty(), ClientStatsState::StoreResults)?;
        Ok(())
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &GetClientStatsArgs,
        _state: ClientStatsState,
        responses: Responses,
    ) -> Result<()> {
        let interval = args.sample_interval_us.unwrap_or(DEFAULT_SAMPLE_INTERVAL_US);
        for stats in responses.decode_all::<ClientStats>()? {
            let sampled = stats.downsample(interval);
            ctx.log(format!(
                "Stored {} cpu and {} io samples",
                sampled.cpu_samples.len(),
                sampled.io_samples.len()
            ));
            ctx.reply(Payload::json("ClientStats", &sampled)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::flows::testing::FlowHarness;
    use crate::models::{
        ClientId, CpuSample, FlowSpec, FlowStartRequest, FlowState, FlowStatus, IoSample,
        MessageEnvelope,
    };
    use serde_json::json;

    #[tokio::test]
    async fn test_stats_are_downsampled_before_storing() {
        let h = FlowHarness::new().await;
        let session = h
            .runner
            .start_flow(FlowStartRequest::new(
                ClientId::from_index(0),
                FlowSpec::new("GetClientStats", json!({})),
            ))
            .await
            .unwrap()
            .session_id;

        let mut stats = ClientStats::default();
        for i in 0..12i64 {
            stats.cpu_samples.push(CpuSample {
                timestamp: i * 10_000_000,
                user_cpu_time: 10.0 + i as f64,
                system_cpu_time: 20.0 + i as f64,
                cpu_percent: 10.0 + i as f64,
            });
            stats.io_samples.push(IoSample {
                timestamp: i * 10_000_000,
                read_bytes: 10 + i as u64,
                write_bytes: 10 + i as u64,
            });
        }

        let flow = h
            .deliver(
                &session,
                vec![
                    MessageEnvelope::response(
                        session.clone(),
                        1,
                        0,
                        Payload::json("ClientStats", &stats).unwrap(),
                    ),
                    MessageEnvelope::status(session.clone(), 1, 1, FlowStatus::ok()),
                ],
            )
            .await;

        assert_eq!(flow.state, FlowState::Terminated);
        assert_eq!(flow.results.len(), 1);
        let stored: ClientStats = flow.results[0].decode().unwrap();
        assert_eq!(stored.cpu_samples.len(), 2);
        assert_eq!(stored.io_samples.len(), 2);
        assert_eq!(stored.io_samples[0].read_bytes, 15);
        assert_eq!(stored.io_samples[1].read_bytes, 21);
        assert_eq!(stored.cpu_samples[0].user_cpu_time, 15.0);
        assert_eq!(stored.cpu_samples[1].system_cpu_time, 31.0);
    }

    #[tokio::test]
    async fn test_undecodable_stats_fail_the_flow() {
        let h = FlowHarness::new().await;
        let session = h
            .runner
            .start_flow(FlowStartRequest::new(
                ClientId::from_index(0),
                FlowSpec::new("GetClientStats", json!({})),
            ))
            .await
            .unwrap()
            .session_id;

        let flow = h
            .deliver(
                &session,
                vec![
                    MessageEnvelope::response(session.clone(), 1, 0, Payload::text("garbage")),
                    MessageEnvelope::status(session.clone(), 1, 1, FlowStatus::ok()),
                ],
            )
            .await;
        assert_eq!(flow.state, FlowState::Error);
    }
}
