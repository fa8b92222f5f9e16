use lupa_planner::IntentKind;

/// The authoritative intent-to-agent table, in fallback order.
pub fn agents_for_intent(kind: IntentKind) -> &'static [&'static str] {
    match kind {
        IntentKind::Greeting | IntentKind::HelpRequest | IntentKind::Unknown => &["communicator"],
        IntentKind::Investigate => &["detective", "analyst"],
        IntentKind::Analyze => &["analyst", "detective"],
        IntentKind::ReportRequest => &["reporter", "communicator"],
    }
}

/// Action verb carried by the dispatched message for each intent.
pub fn default_action_for_intent(kind: IntentKind) -> &'static str {
    match kind {
        IntentKind::Greeting => "greet",
        IntentKind::HelpRequest => "help",
        IntentKind::Investigate => "investigate",
        IntentKind::Analyze => "analyze",
        IntentKind::ReportRequest => "report",
        IntentKind::Unknown => "clarify",
    }
}
