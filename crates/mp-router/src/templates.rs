//! Template Selector — `select(event, profile) -> Option<Notification>`.
//!
//! Pure functions, no I/O, mirroring the payload-construction style of
//! the teacher's HTTP mediation layer: priority is derived from bucketed
//! event severity, the template id from the same buckets (so the same
//! shape of event always produces the same template), and the dedup key
//! from a canonical hash of the payload so two deliveries of the same
//! underlying fact collapse to one notification.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use mp_common::{Correlation, Event, EventKind, Notification, Priority, RecipientProfile};

/// Builds the `Notification` a given event would produce for `profile`,
/// or `None` if the event kind doesn't apply to this recipient at all
/// (kind-level gating happens again, authoritatively, in the Preference
/// Filter — this early check just avoids constructing dead notifications).
pub fn select(event: &Event, profile: &RecipientProfile) -> Option<Notification> {
    if !profile.kinds.enabled_for(event.kind) {
        return None;
    }

    let priority = priority_for(event);
    let template_id = template_id_for(event, priority);
    let (title, body) = render(event, &template_id);
    let dedup_key = dedup_key_for(event);

    Some(Notification {
        notif_id: Uuid::new_v4().to_string(),
        recipient_id: profile.recipient_id.clone(),
        kind: event.kind,
        priority,
        title,
        body,
        dedup_key,
        created_at: Utc::now(),
        scheduled_for: Utc::now(),
        attempts: 0,
        correlation: Correlation {
            event_id: event.event_id.clone(),
            subject_wallet: event.subject_wallet.clone(),
            subject_market: event.subject_market.clone(),
        },
    })
}

/// Priority from event severity: transactions and price/volume updates
/// bucket a magnitude field out of the payload; positions and resolutions
/// bucket the action/outcome the payload carries instead of a magnitude,
/// since those kinds don't have one.
fn priority_for(event: &Event) -> Priority {
    match event.kind {
        EventKind::Resolution => resolution_priority(event),
        EventKind::Transaction => bucket(payload_f64(event, "amount"), &[1_000.0, 10_000.0, 100_000.0]),
        EventKind::PriceUpdate => bucket(payload_f64(event, "pct_change").map(f64::abs), &[5.0, 10.0, 20.0]),
        EventKind::VolumeUpdate => bucket(payload_f64(event, "pct_change").map(f64::abs), &[10.0, 25.0, 50.0]),
        EventKind::PositionUpdate => position_priority(event),
    }
}

fn payload_f64(event: &Event, field: &str) -> Option<f64> {
    event.payload.get(field).and_then(|v| v.as_f64())
}

fn payload_str<'a>(event: &'a Event, field: &str) -> Option<&'a str> {
    event.payload.get(field).and_then(|v| v.as_str())
}

/// `opened | increased | decreased | closed`, the position action the
/// Queue Manager and template selector both split on; an unrecognized or
/// missing action is treated as a generic update.
fn position_action(event: &Event) -> &str {
    payload_str(event, "action").unwrap_or("updated")
}

fn position_priority(event: &Event) -> Priority {
    match position_action(event) {
        "closed" => Priority::High,
        "opened" | "increased" => Priority::Medium,
        "decreased" => Priority::Low,
        _ => Priority::Medium,
    }
}

/// The resolution outcome the payload carries (`yes`/`no`/`invalid`/...);
/// missing is treated as unknown rather than guessed.
fn resolution_outcome(event: &Event) -> &str {
    payload_str(event, "outcome").unwrap_or("unknown")
}

/// Every resolution is urgent except an invalid/void market, which doesn't
/// move anyone's position and so doesn't need the same urgency.
fn resolution_priority(event: &Event) -> Priority {
    match resolution_outcome(event) {
        "invalid" | "void" => Priority::High,
        _ => Priority::Urgent,
    }
}

/// `thresholds[0] <= x < thresholds[1]` -> Medium, `< thresholds[0]` ->
/// Low, and so on up to Urgent; a missing value buckets to Medium.
fn bucket(value: Option<f64>, thresholds: &[f64; 3]) -> Priority {
    let value = match value {
        Some(v) => v,
        None => return Priority::Medium,
    };
    if value >= thresholds[2] {
        Priority::Urgent
    } else if value >= thresholds[1] {
        Priority::High
    } else if value >= thresholds[0] {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// For most kinds the same shape of event always produces the same
/// template, so the id is kind+priority. Positions and resolutions vary by
/// action/outcome instead — two `PositionUpdate`s at the same priority but
/// different actions (e.g. `opened` vs. `closed`) need different bodies.
fn template_id_for(event: &Event, priority: Priority) -> String {
    let variant = match event.kind {
        EventKind::PositionUpdate => position_action(event).to_string(),
        EventKind::Resolution => resolution_outcome(event).to_string(),
        _ => format!("{priority:?}"),
    };
    format!("{}.{}", event.kind.as_str(), variant).to_lowercase()
}

fn render(event: &Event, template_id: &str) -> (String, String) {
    let subject = event
        .subject_market
        .as_deref()
        .or(event.subject_wallet.as_deref())
        .unwrap_or("market");

    let title = match event.kind {
        EventKind::Transaction => format!("New transaction on {subject}"),
        EventKind::PositionUpdate => match position_action(event) {
            "opened" => format!("Position opened on {subject}"),
            "increased" => format!("Position increased on {subject}"),
            "decreased" => format!("Position decreased on {subject}"),
            "closed" => format!("Position closed on {subject}"),
            _ => format!("Position update on {subject}"),
        },
        EventKind::Resolution => {
            let outcome = resolution_outcome(event);
            if outcome == "unknown" {
                format!("{subject} resolved")
            } else {
                format!("{subject} resolved: {outcome}")
            }
        }
        EventKind::PriceUpdate => format!("Price move on {subject}"),
        EventKind::VolumeUpdate => format!("Volume spike on {subject}"),
    };

    let body = format!(
        "{title} (template={template_id}, event={})",
        event.event_id
    );

    (title, body)
}

/// Stable hash of the event's kind, subject, and payload, used as the
/// dedup key so re-ingesting the same upstream fact (e.g. on reconnect
/// replay) doesn't produce a second notification.
fn dedup_key_for(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.kind.as_str().as_bytes());
    hasher.update(event.subject_wallet.as_deref().unwrap_or("").as_bytes());
    hasher.update(event.subject_market.as_deref().unwrap_or("").as_bytes());
    hasher.update(canonical_json(&event.payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serializes a JSON value with object keys sorted, so semantically
/// identical payloads hash identically regardless of field order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k:?}:{}", canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, payload: serde_json::Value) -> Event {
        Event {
            event_id: "e1".to_string(),
            kind,
            occurred_at: Utc::now(),
            payload,
            subject_wallet: Some("0xabc".to_string()),
            subject_market: Some("MKT-1".to_string()),
            ingest_seq: 0,
        }
    }

    #[test]
    fn disabled_kind_yields_none() {
        let mut profile = RecipientProfile::new("r1");
        profile.kinds.transaction = false;
        let ev = event(EventKind::Transaction, serde_json::json!({"amount": 50.0}));
        assert!(select(&ev, &profile).is_none());
    }

    #[test]
    fn large_transaction_is_urgent() {
        let profile = RecipientProfile::new("r1");
        let ev = event(EventKind::Transaction, serde_json::json!({"amount": 250_000.0}));
        let notif = select(&ev, &profile).unwrap();
        assert_eq!(notif.priority, Priority::Urgent);
    }

    #[test]
    fn resolution_is_urgent_unless_invalid() {
        let profile = RecipientProfile::new("r1");
        let resolved = event(EventKind::Resolution, serde_json::json!({"outcome": "yes"}));
        assert_eq!(select(&resolved, &profile).unwrap().priority, Priority::Urgent);

        let invalid = event(EventKind::Resolution, serde_json::json!({"outcome": "invalid"}));
        assert_eq!(select(&invalid, &profile).unwrap().priority, Priority::High);
    }

    #[test]
    fn resolution_template_and_body_vary_by_outcome() {
        let profile = RecipientProfile::new("r1");
        let yes = event(EventKind::Resolution, serde_json::json!({"outcome": "yes"}));
        let no = event(EventKind::Resolution, serde_json::json!({"outcome": "no"}));
        let yes_notif = select(&yes, &profile).unwrap();
        let no_notif = select(&no, &profile).unwrap();
        assert_ne!(yes_notif.title, no_notif.title);
        assert!(yes_notif.title.contains("yes"));
    }

    #[test]
    fn position_priority_and_title_vary_by_action() {
        let profile = RecipientProfile::new("r1");
        let opened = event(EventKind::PositionUpdate, serde_json::json!({"action": "opened"}));
        let closed = event(EventKind::PositionUpdate, serde_json::json!({"action": "closed"}));

        let opened_notif = select(&opened, &profile).unwrap();
        let closed_notif = select(&closed, &profile).unwrap();

        assert_eq!(opened_notif.priority, Priority::Medium);
        assert_eq!(closed_notif.priority, Priority::High);
        assert_ne!(opened_notif.title, closed_notif.title);
        assert!(closed_notif.title.contains("closed"));
    }

    #[test]
    fn dedup_key_ignores_field_order() {
        let a = event(EventKind::Transaction, serde_json::json!({"amount": 1.0, "side": "buy"}));
        let b = event(EventKind::Transaction, serde_json::json!({"side": "buy", "amount": 1.0}));
        assert_eq!(dedup_key_for(&a), dedup_key_for(&b));
    }
}
