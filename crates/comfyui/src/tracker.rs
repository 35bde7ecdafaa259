//! Follows a single prompt on a ComfyUI WebSocket until it finishes.
//!
//! [`track_prompt`] reads frames, forwards progress for the prompt it is
//! watching, collects per-node outputs, and turns the terminal message
//! into the result of the backend `run` call. Frames for other prompts
//! are skipped, as are frames without a prompt ID until this prompt has
//! been seen on the socket.

use futures::{Stream, StreamExt};
use switchgen_core::backend::{BackendError, ProgressEvent, ProgressSender};
use switchgen_core::job::JobOutput;
use tokio_tungstenite::tungstenite::Message;

use crate::messages::{parse_message, ComfyUIMessage};

/// Consume `stream` until `prompt_id` succeeds, fails or is interrupted.
///
/// Generic over the stream so it can be driven by a live socket or by a
/// canned sequence of frames.
pub async fn track_prompt<S, E>(
    stream: &mut S,
    prompt_id: &str,
    progress: &ProgressSender,
) -> Result<JobOutput, BackendError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut outputs = serde_json::Map::new();
    let mut started = false;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                // Preview images.
                tracing::trace!(prompt_id, "Ignoring binary frame");
                continue;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Close(frame)) => {
                tracing::warn!(prompt_id, ?frame, "ComfyUI WebSocket closed mid-prompt");
                return Err(BackendError::Transport(
                    "WebSocket closed before the prompt finished".into(),
                ));
            }
            Err(e) => {
                return Err(BackendError::Transport(format!("WebSocket receive error: {e}")));
            }
        };

        let msg = match parse_message(&text) {
            Ok(msg) => msg,
            Err(e) => {
                // Custom nodes broadcast their own message types.
                tracing::debug!(prompt_id, error = %e, "Skipping unrecognised ComfyUI message");
                continue;
            }
        };

        match msg.prompt_id() {
            Some(id) if id != prompt_id => continue,
            Some(_) => started = true,
            // Older servers omit prompt_id on `executing` and `progress`.
            None if !started && !matches!(msg, ComfyUIMessage::Status(_)) => {
                tracing::trace!(prompt_id, "Skipping unattributed frame before execution start");
                continue;
            }
            None => {}
        }

        match msg {
            ComfyUIMessage::Status(data) => {
                tracing::trace!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            ComfyUIMessage::ExecutionStart(_) => {
                tracing::debug!(prompt_id, "Execution started");
            }
            ComfyUIMessage::ExecutionCached(data) => {
                let _ = progress.send(ProgressEvent::Cached { nodes: data.nodes });
            }
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => {
                    let _ = progress.send(ProgressEvent::NodeStarted { node });
                }
                // node == None means execution is complete for this prompt.
                None => return Ok(finished(prompt_id, outputs)),
            },
            ComfyUIMessage::Progress(data) => {
                let _ = progress.send(ProgressEvent::Step {
                    value: data.value,
                    max: data.max,
                });
            }
            ComfyUIMessage::Executed(data) => {
                let _ = progress.send(ProgressEvent::NodeCompleted {
                    node: data.node.clone(),
                });
                outputs.insert(data.node, data.output);
            }
            ComfyUIMessage::ExecutionSuccess(_) => return Ok(finished(prompt_id, outputs)),
            ComfyUIMessage::ExecutionError(data) => {
                tracing::error!(
                    prompt_id,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                return Err(BackendError::Execution {
                    node_id: data.node_id,
                    exception_type: data.exception_type,
                    message: data.exception_message,
                });
            }
            ComfyUIMessage::ExecutionInterrupted(data) => {
                tracing::info!(prompt_id, node_id = ?data.node_id, "Execution interrupted");
                return Err(BackendError::Interrupted);
            }
        }
    }

    Err(BackendError::Transport(
        "WebSocket stream ended before the prompt finished".into(),
    ))
}

fn finished(prompt_id: &str, outputs: serde_json::Map<String, serde_json::Value>) -> JobOutput {
    tracing::debug!(prompt_id, nodes = outputs.len(), "Prompt finished");
    JobOutput {
        prompt_id: Some(prompt_id.to_string()),
        outputs: serde_json::Value::Object(outputs),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::stream;
    use switchgen_core::backend::progress_channel;

    use super::*;

    fn text(json: &str) -> Result<Message, String> {
        Ok(Message::Text(json.to_string()))
    }

    async fn run(
        frames: Vec<Result<Message, String>>,
    ) -> (Result<JobOutput, BackendError>, Vec<ProgressEvent>) {
        let (tx, mut rx) = progress_channel();
        let mut frames = stream::iter(frames);
        let result = track_prompt(&mut frames, "p1", &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn successful_prompt_collects_outputs_and_progress() {
        let (result, events) = run(vec![
            text(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#),
            text(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            text(r#"{"type":"execution_cached","data":{"prompt_id":"p1","nodes":["1"]}}"#),
            text(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#),
            text(r#"{"type":"progress","data":{"value":1,"max":2,"prompt_id":"p1","node":"3"}}"#),
            text(r#"{"type":"progress","data":{"value":2,"max":2,"prompt_id":"p1","node":"3"}}"#),
            Ok(Message::Binary(vec![0, 1, 2])),
            text(r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"a.png"}]},"prompt_id":"p1"}}"#),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#),
        ])
        .await;

        let output = result.unwrap();
        assert_eq!(output.prompt_id.as_deref(), Some("p1"));
        assert_eq!(output.outputs["9"]["images"][0]["filename"], "a.png");
        assert_eq!(
            events,
            vec![
                ProgressEvent::Cached {
                    nodes: vec!["1".into()]
                },
                ProgressEvent::NodeStarted { node: "3".into() },
                ProgressEvent::Step { value: 1, max: 2 },
                ProgressEvent::Step { value: 2, max: 2 },
                ProgressEvent::NodeCompleted { node: "9".into() },
            ]
        );
    }

    #[tokio::test]
    async fn execution_success_finishes_the_prompt() {
        let (result, _) = run(vec![
            text(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            text(r#"{"type":"execution_success","data":{"prompt_id":"p1"}}"#),
        ])
        .await;
        assert!(result.unwrap().outputs.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_prompts_are_ignored() {
        let (result, events) = run(vec![
            text(r#"{"type":"executing","data":{"node":"7","prompt_id":"other"}}"#),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"other"}}"#),
            text(r#"{"type":"execution_error","data":{"prompt_id":"other","node_id":"1","exception_message":"x","exception_type":"E"}}"#),
            text(r#"{"type":"execution_success","data":{"prompt_id":"p1"}}"#),
        ])
        .await;
        assert!(result.is_ok());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unattributed_frames_wait_for_our_prompt() {
        let (result, events) = run(vec![
            text(r#"{"type":"executing","data":{"node":"4"}}"#),
            text(r#"{"type":"executing","data":{"node":null}}"#),
            text(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            text(r#"{"type":"progress","data":{"value":3,"max":8}}"#),
            text(r#"{"type":"executed","data":{"node":"9","output":{"text":["ok"]},"prompt_id":"p1"}}"#),
            text(r#"{"type":"executing","data":{"node":null}}"#),
        ])
        .await;

        let output = result.unwrap();
        assert_eq!(output.outputs["9"]["text"][0], "ok");
        assert_eq!(
            events,
            vec![
                ProgressEvent::Step { value: 3, max: 8 },
                ProgressEvent::NodeCompleted { node: "9".into() },
            ]
        );
    }

    #[tokio::test]
    async fn execution_error_maps_to_backend_error() {
        let (result, _) = run(vec![text(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"5","exception_message":"CUDA out of memory","exception_type":"torch.OutOfMemoryError"}}"#,
        )])
        .await;
        assert_matches!(
            result,
            Err(BackendError::Execution { node_id, exception_type, message })
                if node_id == "5"
                    && exception_type == "torch.OutOfMemoryError"
                    && message == "CUDA out of memory"
        );
    }

    #[tokio::test]
    async fn interrupt_maps_to_interrupted() {
        let (result, _) = run(vec![
            text(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#),
            text(r#"{"type":"execution_interrupted","data":{"prompt_id":"p1","node_id":"3"}}"#),
        ])
        .await;
        assert_matches!(result, Err(BackendError::Interrupted));
    }

    #[tokio::test]
    async fn unknown_messages_are_skipped() {
        let (result, _) = run(vec![
            text(r#"{"type":"crystools.monitor","data":{"cpu_utilization":3}}"#),
            text("garbage"),
            text(r#"{"type":"execution_success","data":{"prompt_id":"p1"}}"#),
        ])
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn closed_socket_is_a_transport_error() {
        let (result, _) = run(vec![
            text(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            Ok(Message::Close(None)),
        ])
        .await;
        assert_matches!(result, Err(BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn stream_end_and_receive_error_are_transport_errors() {
        let (result, _) = run(vec![]).await;
        assert_matches!(result, Err(BackendError::Transport(_)));

        let (result, _) = run(vec![Err("connection reset".to_string())]).await;
        assert_matches!(result, Err(BackendError::Transport(msg)) if msg.contains("connection reset"));
    }
}
