// LaunchBinary - upload an executable in chunks and run it on the agent

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::engine::flow::{Continuation, FlowBehavior, FlowContext, Responses};
use crate::models::Payload;
use crate::{FleetError, Result};

/// Chunk size when the arguments name none
pub const DEFAULT_BINARY_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchBinaryArgs {
    /// The executable, base64 encoded
    pub binary: String,
    /// Command line arguments, already split
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

impl LaunchBinaryArgs {
    fn decode_binary(&self) -> Result<Vec<u8>> {
        STANDARD.decode(&self.binary).map_err(|e| FleetError::InvalidArgs {
            flow: LaunchBinary::NAME.to_string(),
            message: format!("binary is not base64: {}", e),
        })
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_BINARY_CHUNK_SIZE)
    }
}

/// One `ExecuteBinaryCommand` request
///
/// The agent appends `executable` at `offset` of `write_path` and runs the
/// file once a chunk arrives with `more_data` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteBinaryRequest {
    /// Base64 encoded chunk
    pub executable: String,
    pub args: Vec<String>,
    pub offset: u64,
    pub more_data: bool,
    pub write_path: String,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteBinaryResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_status: i32,
    #[serde(default)]
    pub time_used_ms: u64,
}

/// Upload position, persisted between chunks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UploadProgress {
    offset: usize,
    chunks_sent: usize,
    write_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaunchBinaryState {
    NextChunk,
    End,
}

impl Continuation for LaunchBinaryState {
    fn name(&self) -> &'static str {
        match self {
            LaunchBinaryState::NextChunk => "NextChunk",
            LaunchBinaryState::End => "End",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "NextChunk" => Some(LaunchBinaryState::NextChunk),
            "End" => Some(LaunchBinaryState::End),
            _ => None,
        }
    }
}

/// Sends the binary one chunk per request; the next chunk only goes out once
/// the agent acknowledged the previous one, so chunks land in order
pub struct LaunchBinary;

impl LaunchBinary {
    fn send_chunk(ctx: &mut FlowContext<'_>, args: &LaunchBinaryArgs, mut progress: UploadProgress) -> Result<()> {
        let binary = args.decode_binary()?;
        let end = (progress.offset + args.chunk_size()).min(binary.len());
        let more_data = end < binary.len();
        let request = ExecuteBinaryRequest {
            executable: STANDARD.encode(&binary[progress.offset..end]),
            args: args.args.clone(),
            offset: progress.offset as u64,
            more_data,
            write_path: progress.write_path.clone(),
            time_limit_secs: args.time_limit_secs,
        };
        let next = if more_data {
            LaunchBinaryState::NextChunk
        } else {
            LaunchBinaryState::End
        };
        ctx.call_client(
            "ExecuteBinaryCommand",
            Payload::json("ExecuteBinaryRequest", &request)?,
            next,
        )?;

        progress.offset = end;
        progress.chunks_sent += 1;
        ctx.set_data(&progress)
    }
}

impl FlowBehavior for LaunchBinary {
    const NAME: &'static str = "LaunchBinary";
    type Args = LaunchBinaryArgs;
    type State = LaunchBinaryState;

    fn validate(args: &LaunchBinaryArgs) -> Result<()> {
        let invalid = |message: &str| FleetError::InvalidArgs {
            flow: Self::NAME.to_string(),
            message: message.to_string(),
        };
        if args.decode_binary()?.is_empty() {
            return Err(invalid("binary must not be empty"));
        }
        if args.chunk_size == Some(0) {
            return Err(invalid("chunk_size must be positive"));
        }
        Ok(())
    }

    fn start(ctx: &mut FlowContext<'_>, args: &LaunchBinaryArgs) -> Result<()> {
        let progress = UploadProgress {
            write_path: format!("{}", Utc::now().timestamp_millis()),
            ..UploadProgress::default()
        };
        Self::send_chunk(ctx, args, progress)
    }

    fn resume(
        ctx: &mut FlowContext<'_>,
        args: &LaunchBinaryArgs,
        state: LaunchBinaryState,
        responses: Responses,
    ) -> Result<()> {
        match state {
            LaunchBinaryState::NextChunk => {
                let progress: UploadProgress = ctx.data()?;
                Self::send_chunk(ctx, args, progress)
            }
            LaunchBinaryState::End => {
                let progress: UploadProgress = ctx.data()?;
                ctx.log(format!(
                    "Sent {} bytes in {} chunks",
                    progress.offset, progress.chunks_sent
                ));
                if let Some(payload) = responses.payloads().next() {
                    let result: ExecuteBinaryResponse = payload.decode()?;
                    ctx.log(format!(
                        "Binary exited with status {} after {} ms",
                        result.exit_status, result.time_used_ms
                    ));
                    ctx.reply(payload.clone());
                }
                Ok(())
            }
        }
    }
}
