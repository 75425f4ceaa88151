//! Caller side of the operation protocol

use super::registry::Progress;
use crate::error::{FleetError, Result};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Poll an operation on a fixed cadence until it finishes or `timeout` runs out.
///
/// `check` performs one poll. Non-empty progress text is handed to
/// `on_message`. A timeout only stops the caller; the work behind the
/// handle keeps running.
pub async fn poll_until_finished<F, Fut, M>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
    mut on_message: M,
) -> Result<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress>>,
    M: FnMut(&str),
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(FleetError::Timeout(format!(
                    "operation did not finish within {:?}",
                    timeout
                )));
            }
            _ = ticker.tick() => {
                match check().await? {
                    Progress::Running { message } => {
                        if !message.is_empty() {
                            on_message(&message);
                        }
                    }
                    Progress::Finished { payload } => return Ok(payload),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationRegistry;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_collects_messages_until_finished() {
        let registry = Arc::new(OperationRegistry::default());
        let id = registry.create().unwrap();
        registry.append_status(&id, "step 1;");

        let reg = registry.clone();
        let poll_id = id.clone();
        let mut polls = 0;
        let mut messages = Vec::new();
        let payload = poll_until_finished(
            Duration::from_millis(5),
            Duration::from_secs(5),
            || {
                polls += 1;
                if polls == 2 {
                    reg.finish(&poll_id, json!({"result": "ok"}));
                }
                let progress = reg.poll(&poll_id);
                async move { progress }
            },
            |m| messages.push(m.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(payload, json!({"result": "ok"}));
        assert_eq!(messages, vec!["step 1;".to_string()]);
    }

    #[tokio::test]
    async fn test_times_out() {
        let result = poll_until_finished(
            Duration::from_millis(5),
            Duration::from_millis(30),
            || async { Ok(Progress::Running { message: String::new() }) },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(FleetError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_poll_error_stops_loop() {
        let result = poll_until_finished(
            Duration::from_millis(5),
            Duration::from_secs(5),
            || async { Err(FleetError::OperationNotFound("x".to_string())) },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(FleetError::OperationNotFound(_))));
    }
}
