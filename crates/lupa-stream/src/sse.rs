use crate::events::StreamEvent;

/// Serializes one event as an SSE frame: `event: <tag>\ndata: <json>\n\n`.
pub fn to_sse_frame(event: &StreamEvent) -> String {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| "{\"type\":\"error\",\"reason\":\"serialization\"}".to_string());
    format!("event: {}\ndata: {}\n\n", event.tag(), payload)
}
