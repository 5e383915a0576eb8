//! Text shown to the doorman for a forwarded decision.

use porteiro_events::DecisionNotice;

/// One-line summary, e.g. `Ana Souza (apt 101) approved Carlos`.
pub fn describe(notice: &DecisionNotice) -> String {
    let decision = &notice.decision;
    let verb = decision.status.as_str();
    let apartment = decision
        .apartment_number
        .as_deref()
        .map(|n| format!(" (apt {n})"))
        .unwrap_or_default();
    let visitor = decision.visitor_name.as_deref().unwrap_or("a visitor");

    format!("{}{apartment} {verb} {visitor}", notice.resident_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use porteiro_core::decision::{Decision, DecisionStatus};
    use porteiro_events::DeliveryPath;

    fn notice(status: DecisionStatus, apartment: Option<&str>, visitor: Option<&str>) -> DecisionNotice {
        let decision = Decision {
            id: Some("log-1".into()),
            visitor_id: Some("v1".into()),
            status,
            responded_by: "r1".into(),
            responded_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            apartment_number: apartment.map(String::from),
            building_id: Some("b1".into()),
            visitor_name: visitor.map(String::from),
        };
        DecisionNotice {
            signature: decision.signature(),
            decision,
            resident_name: "Ana Souza".into(),
            path: DeliveryPath::Poll,
        }
    }

    #[test]
    fn full_description() {
        let text = describe(&notice(DecisionStatus::Approved, Some("101"), Some("Carlos")));
        assert_eq!(text, "Ana Souza (apt 101) approved Carlos");
    }

    #[test]
    fn missing_details_are_omitted() {
        let text = describe(&notice(DecisionStatus::Rejected, None, None));
        assert_eq!(text, "Ana Souza rejected a visitor");
    }
}
