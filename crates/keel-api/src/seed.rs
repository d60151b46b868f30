//! Seeding workspaces from NDJSON event files.
//!
//! Each non-blank line is one event object. `workspaceId` and `timestamp`
//! may be omitted; they default to the seeding workspace and the seeding
//! time. Lines starting with `#` are comments.

use serde::Deserialize;
use serde_json::Value;

use keel_core::{Error, Result};
use keel_engine::events::RawEvent;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedLine {
    event_type: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Parses `input` into events, filling defaults.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the first malformed line, or an
/// event with no workspace when `default_workspace` is `None`.
pub fn parse_events(
    input: &str,
    default_workspace: Option<&str>,
    now_millis: i64,
) -> Result<Vec<RawEvent>> {
    let mut events = Vec::new();
    for (index, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let number = index + 1;
        let seed: SeedLine = serde_json::from_str(line)
            .map_err(|e| Error::InvalidInput(format!("line {number}: {e}")))?;
        let workspace_id = seed
            .workspace_id
            .or_else(|| default_workspace.map(str::to_string))
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "line {number}: no workspaceId and WORKSPACE_ID is not set"
                ))
            })?;
        events.push(RawEvent {
            event_type: seed.event_type,
            workspace_id,
            data: seed.data,
            timestamp: seed.timestamp.unwrap_or(now_millis),
        });
    }
    Ok(events)
}

/// Splits `events` into posts: consecutive runs of one workspace, at most
/// `batch_size` events each. Order is preserved.
#[must_use]
pub fn batches(events: Vec<RawEvent>, batch_size: usize) -> Vec<(String, Vec<RawEvent>)> {
    let batch_size = batch_size.max(1);
    let mut out: Vec<(String, Vec<RawEvent>)> = Vec::new();
    for event in events {
        match out.last_mut() {
            Some((workspace_id, batch))
                if *workspace_id == event.workspace_id && batch.len() < batch_size =>
            {
                batch.push(event);
            }
            _ => out.push((event.workspace_id.clone(), vec![event])),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = r#"
# bootstrap
{"eventType":"system.created","data":{"id":"sys1","name":"sys1"}}
{"eventType":"resource.upserted","workspaceId":"globex","data":{"id":"r1"},"timestamp":42}

{"eventType":"workspace.tick"}
"#;

    #[test]
    fn defaults_are_filled() -> Result<()> {
        let events = parse_events(INPUT, Some("acme"), 1_000)?;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].workspace_id, "acme");
        assert_eq!(events[0].timestamp, 1_000);
        assert_eq!(events[1].workspace_id, "globex");
        assert_eq!(events[1].timestamp, 42);
        assert_eq!(events[2].data, Value::Null);
        Ok(())
    }

    #[test]
    fn missing_workspace_is_an_error() {
        let err = parse_events(INPUT, None, 0).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn malformed_lines_name_their_number() {
        let err = parse_events("{}\n", Some("acme"), 0).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn batches_keep_order_and_split_by_workspace() -> Result<()> {
        let mut events = parse_events(INPUT, Some("acme"), 0)?;
        events.push(events[2].clone());
        let posts = batches(events, 2);
        let shape: Vec<(String, usize)> = posts.iter().map(|(ws, b)| (ws.clone(), b.len())).collect();
        assert_eq!(
            shape,
            vec![
                ("acme".to_string(), 1),
                ("globex".to_string(), 1),
                ("acme".to_string(), 2),
            ]
        );
        Ok(())
    }
}
