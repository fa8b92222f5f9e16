use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Tagged stream event. Serialization round-trips exactly; the wire shape is
/// `{"type": <tag>, ...tag-specific fields}`.
pub enum StreamEvent {
    Start {
        investigation_id: String,
        session_id: String,
    },
    Progress {
        phase: String,
        /// In [0, 1], non-decreasing per connection.
        progress: f64,
    },
    Intent {
        intent: String,
        confidence: f64,
    },
    AgentSelected {
        agent_id: String,
    },
    Text {
        content: String,
        index: usize,
    },
    Audio {
        /// Base64-encoded chunk.
        data: String,
        index: usize,
        #[serde(rename = "final")]
        final_chunk: bool,
    },
    Done {
        total_records_analyzed: u64,
        anomalies_found: u64,
        processing_time_ms: u64,
    },
    Error {
        reason: String,
        message: String,
    },
    Warning {
        message: String,
    },
}

impl StreamEvent {
    /// SSE event tag for this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Progress { .. } => "progress",
            Self::Intent { .. } => "intent",
            Self::AgentSelected { .. } => "agent_selected",
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::StreamEvent;

    fn sample_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                investigation_id: "inv-1".to_string(),
                session_id: "sess-1".to_string(),
            },
            StreamEvent::Progress {
                phase: "collecting".to_string(),
                progress: 0.4,
            },
            StreamEvent::Intent {
                intent: "investigate".to_string(),
                confidence: 0.9,
            },
            StreamEvent::AgentSelected {
                agent_id: "detective".to_string(),
            },
            StreamEvent::Text {
                content: "Análise concluída para o".to_string(),
                index: 0,
            },
            StreamEvent::Audio {
                data: "UklGRg==".to_string(),
                index: 0,
                final_chunk: true,
            },
            StreamEvent::Done {
                total_records_analyzed: 42,
                anomalies_found: 3,
                processing_time_ms: 1_200,
            },
            StreamEvent::Error {
                reason: "slow_consumer".to_string(),
                message: "cliente não consumiu o stream".to_string(),
            },
            StreamEvent::Warning {
                message: "fonte tce-sp fora da análise".to_string(),
            },
        ]
    }

    #[test]
    fn functional_every_event_round_trips_through_serde() {
        for event in sample_events() {
            let serialized = serde_json::to_string(&event).expect("serialize");
            let deserialized: StreamEvent =
                serde_json::from_str(&serialized).expect("deserialize");
            assert_eq!(deserialized, event);
        }
    }

    #[test]
    fn unit_wire_shape_carries_type_tag() {
        let event = StreamEvent::AgentSelected {
            agent_id: "detective".to_string(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "agent_selected");
        assert_eq!(value["agent_id"], "detective");
    }

    #[test]
    fn unit_audio_final_flag_uses_wire_name() {
        let event = StreamEvent::Audio {
            data: "QUJD".to_string(),
            index: 2,
            final_chunk: true,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["final"], true);
    }

    #[test]
    fn unit_terminal_classification() {
        assert!(StreamEvent::Done {
            total_records_analyzed: 0,
            anomalies_found: 0,
            processing_time_ms: 0,
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            reason: "x".to_string(),
            message: "y".to_string(),
        }
        .is_terminal());
        assert!(!StreamEvent::Warning {
            message: "w".to_string(),
        }
        .is_terminal());
    }
}
