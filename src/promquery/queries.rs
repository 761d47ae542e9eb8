// Query templates for well-known mesh metrics

use std::time::Duration;

/// Window used by success-rate queries that do not set one
pub const DEFAULT_SUCCESS_RATE_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of requests to `namespace/name` that did not answer with a 5xx,
/// over a sliding window of `interval`
pub fn istio_success_rate_query(namespace: &str, name: &str, interval: Duration) -> String {
    let window = prometheus_duration(interval);
    format!(
        r#"
sum(
	rate(
		istio_requests_total{{
			response_code!~"5.*",
			destination_service_namespace="{ns}",
			destination_service_name="{name}",
		}}[{window}]
	)
)
	/
sum(
	rate(
		istio_requests_total{{
			destination_service_namespace="{ns}",
			destination_service_name="{name}",
		}}[{window}]
	)
)
"#,
        ns = namespace,
        name = name,
        window = window,
    )
}

/// Render a duration in PromQL range syntax ("1m", "90s", "250ms")
pub fn prometheus_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        // an empty range is invalid PromQL; the smallest usable window is 1ms
        return "1ms".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = millis / 1000;
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
