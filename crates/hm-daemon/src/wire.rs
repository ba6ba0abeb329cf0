//! JSON-lines wire format between agents, the daemon and the dispatcher

use hm_harmonizer::collaborators::NudgeCommand;
use hm_types::{DropletId, ExitNotice, Heartbeat};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::DaemonResult;

/// A message on the agent feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Heartbeats of every instance one agent hosts
    Heartbeat { droplets: Vec<Heartbeat> },

    /// An instance stopped running
    Exit(ExitNotice),

    /// A droplet's desired state changed at its source
    DropletUpdated { droplet_id: DropletId },
}

/// Decode one line of the agent feed. Blank lines yield `None`.
pub fn decode_line(line: &str) -> DaemonResult<Option<AgentMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Write commands as JSON lines until the channel closes. Returns how many
/// were written.
pub async fn write_commands<W>(
    mut commands: mpsc::UnboundedReceiver<NudgeCommand>,
    mut writer: W,
) -> DaemonResult<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(command) = commands.recv().await {
        let mut line = serde_json::to_vec(&command)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_types::{ExitReason, InstanceState, Priority};

    #[test]
    fn test_decode_messages() {
        let heartbeat = decode_line(
            r#"{"type":"heartbeat","droplets":[{"droplet_id":"app","version":"v1","index":0,"state":"RUNNING","timestamp":"2024-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        match heartbeat {
            Some(AgentMessage::Heartbeat { droplets }) => {
                assert_eq!(droplets.len(), 1);
                assert_eq!(droplets[0].state, InstanceState::Running);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let exit = decode_line(
            r#"{"type":"exit","droplet_id":"app","version":"v1","index":2,"reason":"DEA_SHUTDOWN","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            exit,
            Some(AgentMessage::Exit(ExitNotice { reason: ExitReason::DeaShutdown, index: 2, .. }))
        ));

        let updated = decode_line(r#"{"type":"droplet_updated","droplet_id":"app"}"#).unwrap();
        assert_eq!(
            updated,
            Some(AgentMessage::DropletUpdated {
                droplet_id: DropletId::new("app")
            })
        );
    }

    #[test]
    fn test_decode_blank_and_garbage() {
        assert_eq!(decode_line("   ").unwrap(), None);
        assert!(decode_line("{not json").is_err());
    }

    #[tokio::test]
    async fn test_write_commands() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(NudgeCommand::Start {
            droplet_id: DropletId::new("app"),
            index: 1,
            priority: Priority::High,
        })
        .unwrap();
        drop(tx);

        let mut out = Vec::new();
        let written = write_commands(rx, &mut out).await.unwrap();

        assert_eq!(written, 1);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "{\"command\":\"start\",\"droplet_id\":\"app\",\"index\":1,\"priority\":\"high\"}\n"
        );
    }
}
