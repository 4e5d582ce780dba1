//! Messages exchanged with child processes.
//!
//! A child reads exactly one JSON task from stdin and writes exactly one
//! JSON result to stdout. Logs go to stderr so they never mix with the result.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use txbench_core::{BenchConfig, BenchResult, BranchRange};

/// Task of a `worker-process` child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub index: usize,
    pub config: BenchConfig,
}

/// Task of an `init-shard` child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTask {
    pub index: usize,
    pub config: BenchConfig,
    pub shard: BranchRange,
}

/// Reads one message until end of input.
pub async fn read_message<T, R>(reader: &mut R) -> BenchResult<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Writes one message followed by a newline and flushes.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> BenchResult<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use txbench_core::{BenchError, LatencySample, RunSummary};

    #[tokio::test]
    async fn test_task_and_result_cross_a_pipe() {
        let mut config = BenchConfig::default();
        config.connection.endpoint = "memory://pipe".to_string();
        config.workload.seed = Some(3);
        let task = ShardTask {
            index: 2,
            config,
            shard: BranchRange::new(4, 6),
        };

        let mut wire = Vec::new();
        write_message(&mut wire, &task).await.unwrap();
        let decoded: ShardTask = read_message(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, task);

        let summary = RunSummary::from_samples(
            &[LatencySample::success(Duration::from_micros(1500), 1)],
            Duration::from_secs(1),
        );
        let mut wire = Vec::new();
        write_message(&mut wire, &summary).await.unwrap();
        let decoded: RunSummary = read_message(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded.latencies_us, vec![1500]);
    }

    #[tokio::test]
    async fn test_garbage_is_a_serialization_error() {
        let err = read_message::<RunTask, _>(&mut b"{\"index\": ".as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Serialization(_)));
    }
}
