//! Pure retry-decision function, evaluated when the packet timer expires.

use wire_types::timing::MAX_SEGMENTS_PER_REQUEST;

use crate::UploadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// No action; keep waiting.
    Wait,
    /// Re-issue the init command from scratch.
    RetryFull,
    /// Request the missing segments by bitmap.
    RetryPartial,
}

/// Packets we expect to land from one full pass on the assumed 5% link.
fn expected_good_packets(total_segments: usize) -> f64 {
    total_segments as f64 * 0.05
}

/// Map the session position onto a retry decision, with a human-readable
/// reason for the logs. Rules are evaluated top to bottom:
///
/// 1. Nothing arrived after the init command -> the command was lost.
/// 2. Far fewer packets than the link should deliver -> garbled command or
///    a degraded link; start over.
/// 3. More than one bitmap's worth missing and more than 80% of the total
///    -> a full retry moves more data than chained partial requests.
/// 4. Anything missing -> partial request.
/// 5. Otherwise wait.
pub fn evaluate_retry(
    state: UploadState,
    received: usize,
    total: usize,
    _retry_count: u32,
    _max_retries: u32,
) -> (RetryDecision, String) {
    let missing = total.saturating_sub(received);
    let expected = expected_good_packets(total);
    let bitmap_cap = usize::from(MAX_SEGMENTS_PER_REQUEST);

    if state == UploadState::CommandSent && received == 0 {
        return (
            RetryDecision::RetryFull,
            "No packets after timeout - init command likely lost".to_string(),
        );
    }

    if received > 0 && (received as f64) < expected * 0.10 {
        return (
            RetryDecision::RetryFull,
            format!(
                "Very few packets: {} received vs {:.1} expected (<10%) - command may be garbled or link degraded",
                received, expected
            ),
        );
    }

    if missing > bitmap_cap && missing as f64 > total as f64 * 0.80 {
        return (
            RetryDecision::RetryFull,
            format!(
                "Missing {} segments (>80% of {} and >{}) - full retry more efficient than multiple partial requests",
                missing, total, bitmap_cap
            ),
        );
    }

    if missing > 0 {
        let reason = if missing > bitmap_cap {
            format!(
                "Missing {} segments (>{} but <80% of total) - partial uploads worthwhile, may need multiple requests",
                missing, bitmap_cap
            )
        } else {
            format!("Missing {} segments - normal partial upload", missing)
        };
        return (RetryDecision::RetryPartial, reason);
    }

    (
        RetryDecision::Wait,
        "Upload complete or no timeout condition".to_string(),
    )
}
